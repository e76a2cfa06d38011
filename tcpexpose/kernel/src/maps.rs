//! BPF map definitions for connection tracking
//!
//! Defines the correlation table, the output channels, and the maps the
//! daemon fills with configuration before attaching any probe.

use aya_ebpf::{
    macros::map,
    maps::{Array, HashMap, PerCpuArray, PerfEventArray},
};
use tcpexpose_common::{
    constants::*, Ipv4EventRecord, Ipv6EventRecord, PipelineConfig, SockLayout, StartRecord,
};

/// Correlation table
///
/// Key: address of the kernel `struct sock`
/// Value: StartRecord captured at connect time
///
/// Written by the connect probes, read or consumed by tcp_set_state and
/// tcp_rcv_established. Cleared by the daemon on every attach.
#[map]
pub static START: HashMap<u64, StartRecord> = HashMap::with_max_entries(MAX_CONNECTIONS, 0);

/// Output channel for records with 32-bit addresses
#[map]
pub static EVENTS_V4: PerfEventArray<Ipv4EventRecord> = PerfEventArray::new(0);

/// Output channel for records with 128-bit addresses (IPv6 and unified layouts)
#[map]
pub static EVENTS_V6: PerfEventArray<Ipv6EventRecord> = PerfEventArray::new(0);

/// Ports whose traffic produces no events
///
/// Key: port in host byte order
/// Value: unused
#[map]
pub static EXCLUDED_PORTS: HashMap<u16, u8> = HashMap::with_max_entries(MAX_EXCLUDED_PORTS, 0);

/// Pipeline configuration, slot 0
#[map]
pub static CONFIG: Array<PipelineConfig> = Array::with_max_entries(1, 0);

/// Kernel structure offsets, slot 0
#[map]
pub static SOCK_LAYOUT: Array<SockLayout> = Array::with_max_entries(1, 0);

/// Per-CPU statistics counters
///
/// Index: STAT_* constants
#[map]
pub static STATS: PerCpuArray<u64> = PerCpuArray::with_max_entries(MAX_STATS, 0);
