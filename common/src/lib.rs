//! Shared types and pipeline logic for the tcpexpose probes
//!
//! This crate holds the record layouts, constants and configuration shared
//! between the eBPF program and the userspace daemon, plus the probe
//! pipeline itself. The pipeline is generic over its seams (socket reads,
//! correlation table, port filter, output channel, clock) so the kernel
//! program and the host tests drive the same code.

#![cfg_attr(not(test), no_std)]

pub mod builder;
pub mod channel;
pub mod classify;
pub mod config;
pub mod constants;
pub mod correlation;
pub mod pipeline;
pub mod sock;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use classify::EventKind;
pub use config::{PipelineConfig, RecordLayout, StartRetention};
pub use constants::*;
pub use pipeline::{Pipeline, ProbeOutcome};
pub use sock::SockLayout;
pub use types::{EventRecord, Ipv4EventRecord, Ipv6EventRecord, MetricsBlock, PortPair, StartRecord};
