//! tcpexpose Userspace Library
//!
//! Provides reusable components for loading, configuring and reading the
//! tcpexpose eBPF program.

pub mod config;
pub mod events;
pub mod exporter;
pub mod loader;
pub mod tracker;
pub mod types;

pub use config::Settings;
pub use events::EventProcessor;
pub use exporter::{EventExporter, ExporterType, SummaryExporter};
pub use loader::ProbeLoader;
pub use tracker::ConnectionTracker;
pub use types::*;
