//! Helper functions for the eBPF program
//!
//! Kernel implementations of the pipeline seams, plus thin wrappers around
//! BPF helper functions and the statistics map.

use aya_ebpf::{
    helpers::{bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_ktime_get_ns},
    EbpfContext,
};
use tcpexpose_common::{
    channel::OutputChannel,
    classify::{EventKind, PortFilter},
    constants::*,
    correlation::{CorrelationTable, RecordStatus},
    pipeline::{ProbeEnv, ProbeOutcome},
    Ipv4EventRecord, Ipv6EventRecord, PipelineConfig, SockLayout, StartRecord,
};

use crate::maps::*;

/// Get current timestamp in nanoseconds
#[inline(always)]
pub fn get_timestamp() -> u64 {
    unsafe { bpf_ktime_get_ns() }
}

/// Get current process ID
#[inline(always)]
pub fn get_pid() -> u32 {
    (bpf_get_current_pid_tgid() >> 32) as u32
}

/// Increment a statistics counter
#[inline(always)]
pub fn increment_stat(stat_id: u32) {
    if let Some(count) = STATS.get_ptr_mut(stat_id) {
        unsafe { *count += 1 };
    }
}

/// Count an invocation outcome
#[inline(always)]
pub fn record_outcome(outcome: ProbeOutcome) {
    match outcome {
        ProbeOutcome::Recorded => increment_stat(STAT_START_RECORDED),
        ProbeOutcome::TableFull => increment_stat(STAT_TABLE_FULL),
        ProbeOutcome::Filtered => increment_stat(STAT_FILTERED),
        ProbeOutcome::Missed => increment_stat(STAT_CORRELATION_MISS),
        ProbeOutcome::Emitted(EventKind::ConnectionOpened) => increment_stat(STAT_OPENED),
        ProbeOutcome::Emitted(EventKind::ConnectionClosed) => increment_stat(STAT_CLOSED),
        ProbeOutcome::Emitted(EventKind::MetricsSnapshot) => increment_stat(STAT_SNAPSHOTS),
        ProbeOutcome::Emitted(EventKind::ConnectIssued) | ProbeOutcome::Ignored => {}
    }
}

/// Configuration written by the daemon, or the built-in default
#[inline(always)]
pub fn pipeline_config() -> PipelineConfig {
    CONFIG.get(0).copied().unwrap_or(PipelineConfig::DEFAULT)
}

/// Structure offsets written by the daemon, or the built-in default
#[inline(always)]
pub fn sock_layout() -> SockLayout {
    SOCK_LAYOUT.get(0).copied().unwrap_or(SockLayout::DEFAULT)
}

/// Clock and identity of the task the probe fired in
pub struct KernelEnv;

impl ProbeEnv for KernelEnv {
    #[inline(always)]
    fn now_ns(&self) -> u64 {
        get_timestamp()
    }

    #[inline(always)]
    fn pid(&self) -> u32 {
        get_pid()
    }

    #[inline(always)]
    fn task(&self) -> [u8; TASK_COMM_LEN] {
        bpf_get_current_comm().unwrap_or([0; TASK_COMM_LEN])
    }
}

/// Correlation table backed by the START hash map
pub struct StartTable;

impl CorrelationTable for StartTable {
    #[inline(always)]
    fn record(&self, handle: u64, start: &StartRecord) -> RecordStatus {
        match START.insert(&handle, start, 0) {
            Ok(()) => RecordStatus::Stored,
            Err(_) => RecordStatus::Full,
        }
    }

    #[inline(always)]
    fn lookup(&self, handle: u64) -> Option<StartRecord> {
        unsafe { START.get(&handle).copied() }
    }

    #[inline(always)]
    fn remove(&self, handle: u64) {
        let _ = START.remove(&handle);
    }
}

/// Port filter backed by the EXCLUDED_PORTS hash map
pub struct ExcludedPorts;

impl PortFilter for ExcludedPorts {
    #[inline(always)]
    fn is_excluded(&self, port: u16) -> bool {
        unsafe { EXCLUDED_PORTS.get(&port).is_some() }
    }
}

/// Output channel publishing to the per-CPU perf buffers
pub struct PerfOutput<'a, C: EbpfContext> {
    pub ctx: &'a C,
}

impl<C: EbpfContext> OutputChannel for PerfOutput<'_, C> {
    #[inline(always)]
    fn publish_v4(&self, record: &Ipv4EventRecord) {
        EVENTS_V4.output(self.ctx, record, 0);
    }

    #[inline(always)]
    fn publish_v6(&self, record: &Ipv6EventRecord) {
        EVENTS_V6.output(self.ctx, record, 0);
    }
}
