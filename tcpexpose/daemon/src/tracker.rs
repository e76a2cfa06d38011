//! Connection tracking
//!
//! Follows connections through the decoded event stream: registered when
//! opened, updated by metrics snapshots, unregistered when closed. The
//! tracker also keeps the counters and connect latency samples that end
//! up in the run summary.

use crate::types::{DecodedEvent, LifecycleEvent, MetricsSnapshot, Quartet};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tcpexpose_common::constants::MAX_CONNECTIONS;

/// Number of recently closed connections kept for the summary
const RECENT_CLOSED: usize = 64;

/// Open connections tracked before the oldest is evicted
pub const MAX_TRACKED: usize = MAX_CONNECTIONS as usize;

/// State of one open connection
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTrace {
    pub quartet: Quartet,
    pub pid: u32,
    pub comm: String,
    /// Kernel time of the opened event, in microseconds
    pub opened_us: u64,
    /// Connect to established, in microseconds
    pub connect_latency_us: u64,
    pub snapshots: u64,
    pub last: MetricsSnapshot,
}

/// A connection seen closing
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ClosedConnection {
    pub connection: String,
    pub pid: u32,
    pub comm: String,
    /// Raw delta carried by the closed event
    pub close_delta: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub retrans_out: u64,
}

/// Event counts by lifecycle kind
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct EventBreakdown {
    pub opened: u64,
    pub closed: u64,
    pub metrics: u64,
}

/// Connect latency percentiles, in microseconds
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct Percentiles {
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub p999: f64,
}

/// Summary written at the end of a run
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TrackerSummary {
    /// ISO 8601 timestamp when the summary was generated
    pub timestamp: String,
    pub duration_seconds: u64,
    pub total_events: u64,
    pub events: EventBreakdown,
    /// Events for connections the tracker never saw open
    pub untracked_events: u64,
    /// Open connections dropped to stay within capacity
    pub evicted_connections: u64,
    /// Samples lost in the perf buffers
    pub lost_events: u64,
    pub connect_latency_us: Percentiles,
    pub open_connections: Vec<ConnectionTrace>,
    pub recently_closed: Vec<ClosedConnection>,
}

/// Tracks open connections from the event stream
pub struct ConnectionTracker {
    open: HashMap<Quartet, ConnectionTrace>,
    capacity: usize,
    closed: VecDeque<ClosedConnection>,
    connect_latencies: Vec<f64>,
    events: EventBreakdown,
    untracked: u64,
    evicted: u64,
    total_events: u64,
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::with_capacity(MAX_TRACKED)
    }
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker holding at most `capacity` open connections
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            open: HashMap::new(),
            capacity: capacity.max(1),
            closed: VecDeque::new(),
            connect_latencies: Vec::new(),
            events: EventBreakdown::default(),
            untracked: 0,
            evicted: 0,
            total_events: 0,
        }
    }

    /// Feed one decoded event
    pub fn publish(&mut self, event: &DecodedEvent) {
        self.total_events += 1;
        match event.event {
            LifecycleEvent::Opened => {
                self.events.opened += 1;
                self.register(event);
            }
            LifecycleEvent::Closed => {
                self.events.closed += 1;
                self.unregister(event);
            }
            LifecycleEvent::Metrics => {
                self.events.metrics += 1;
                match self.open.get_mut(&event.quartet()) {
                    Some(trace) => {
                        trace.snapshots += 1;
                        trace.last = event.metrics;
                    }
                    None => self.untracked += 1,
                }
            }
        }
    }

    fn register(&mut self, event: &DecodedEvent) {
        if event.delta_us > 0 {
            self.connect_latencies.push(event.delta_us as f64);
        }

        let quartet = event.quartet();
        if !self.open.contains_key(&quartet) && self.open.len() >= self.capacity {
            self.evict_oldest();
        }

        self.open.insert(
            quartet,
            ConnectionTrace {
                quartet,
                pid: event.pid,
                comm: event.comm.clone(),
                opened_us: event.ts_us,
                connect_latency_us: event.delta_us,
                snapshots: 0,
                last: event.metrics,
            },
        );
    }

    fn unregister(&mut self, event: &DecodedEvent) {
        if self.open.remove(&event.quartet()).is_none() {
            self.untracked += 1;
        }

        if self.closed.len() == RECENT_CLOSED {
            self.closed.pop_front();
        }
        self.closed.push_back(ClosedConnection {
            connection: event.quartet().to_string(),
            pid: event.pid,
            comm: event.comm.clone(),
            close_delta: event.delta_us,
            rx_bytes: event.metrics.rx_bytes,
            tx_bytes: event.metrics.tx_bytes,
            retrans_out: event.metrics.retrans_out,
        });
    }

    /// Closed events can be lost, so the oldest open entry makes room
    fn evict_oldest(&mut self) {
        let oldest = self
            .open
            .iter()
            .min_by_key(|(_, trace)| trace.opened_us)
            .map(|(quartet, _)| *quartet);
        if let Some(quartet) = oldest {
            self.open.remove(&quartet);
            self.evicted += 1;
        }
    }

    pub fn event_count(&self) -> u64 {
        self.total_events
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn untracked_count(&self) -> u64 {
        self.untracked
    }

    pub fn get(&self, quartet: &Quartet) -> Option<&ConnectionTrace> {
        self.open.get(quartet)
    }

    /// Build the run summary
    pub fn summary(&self, elapsed_secs: u64, lost_events: u64) -> TrackerSummary {
        let mut open_connections: Vec<_> = self.open.values().cloned().collect();
        open_connections.sort_by_key(|trace| trace.opened_us);

        TrackerSummary {
            timestamp: chrono::Utc::now().to_rfc3339(),
            duration_seconds: elapsed_secs,
            total_events: self.total_events,
            events: self.events.clone(),
            untracked_events: self.untracked,
            evicted_connections: self.evicted,
            lost_events,
            connect_latency_us: calculate_percentiles(self.connect_latencies.clone()),
            open_connections,
            recently_closed: self.closed.iter().cloned().collect(),
        }
    }
}

/// Nearest-rank percentiles over `samples`
pub fn calculate_percentiles(mut samples: Vec<f64>) -> Percentiles {
    if samples.is_empty() {
        return Percentiles::default();
    }

    samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let len = samples.len();
    let at = |per_mille: usize| {
        let index = std::cmp::min((len * per_mille / 1000).saturating_sub(1), len - 1);
        samples[index]
    };

    Percentiles {
        p50: at(500),
        p75: at(750),
        p90: at(900),
        p95: at(950),
        p99: at(990),
        p999: at(999),
    }
}
