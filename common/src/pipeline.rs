//! Probe pipeline
//!
//! One configurable pipeline drives every probe site. Each entry point is a
//! bounded function from one probe firing to at most one published record:
//! no loops, no allocation, and no I/O besides the single publish.
//!
//! ```text
//! tcp_v{4,6}_connect  -> on_connect      -> correlation table (record)
//! tcp_set_state       -> on_state_change -> classify -> filter -> take/lookup -> build -> publish
//! tcp_rcv_established -> on_ack          -> filter -> lookup -> build -> publish
//! ```

use crate::builder::{build_record, EmitContext};
use crate::channel::OutputChannel;
use crate::classify::{classify_transition, is_filtered, EventKind, PortFilter};
use crate::config::{PipelineConfig, RecordLayout, StartRetention};
use crate::constants::*;
use crate::correlation::{CorrelationTable, RecordStatus};
use crate::sock::{SockLayout, SockReader, SockView};
use crate::types::{Ipv4EventRecord, Ipv6EventRecord, StartRecord};

/// Execution context of the current probe invocation
pub trait ProbeEnv {
    /// Monotonic clock in nanoseconds
    fn now_ns(&self) -> u64;

    /// Process ID of the current task
    fn pid(&self) -> u32;

    /// Name of the current task
    fn task(&self) -> [u8; TASK_COMM_LEN];
}

/// What a probe invocation did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Probe inactive, or the firing is not an observable event
    Ignored,
    /// Start record stored in the correlation table
    Recorded,
    /// Correlation table full, start record dropped
    TableFull,
    /// Suppressed by the port filter
    Filtered,
    /// No start record for a connection entering ESTABLISHED
    Missed,
    /// Record handed to the output channel
    Emitted(EventKind),
}

/// The seams a pipeline runs against
pub struct Pipeline<'a, T, F, O, E>
where
    T: CorrelationTable,
    F: PortFilter + ?Sized,
    O: OutputChannel,
    E: ProbeEnv,
{
    pub config: &'a PipelineConfig,
    pub layout: &'a SockLayout,
    pub table: &'a T,
    pub filter: &'a F,
    pub output: &'a O,
    pub env: &'a E,
}

impl<'a, T, F, O, E> Pipeline<'a, T, F, O, E>
where
    T: CorrelationTable,
    F: PortFilter + ?Sized,
    O: OutputChannel,
    E: ProbeEnv,
{
    /// connect-issued: remember who started the connection and when
    #[inline(always)]
    pub fn on_connect<S: SockReader + ?Sized>(&self, sock: &S) -> ProbeOutcome {
        if !self.config.probe_enabled(PROBE_CONNECT) || !self.config.tracks_identity() {
            return ProbeOutcome::Ignored;
        }

        let start = StartRecord::new(self.env.now_ns(), self.env.pid(), self.env.task());
        match self.table.record(sock.handle(), &start) {
            RecordStatus::Stored => ProbeOutcome::Recorded,
            RecordStatus::Full => ProbeOutcome::TableFull,
        }
    }

    /// state-transition: report connections entering or leaving ESTABLISHED
    #[inline(always)]
    pub fn on_state_change<S: SockReader + ?Sized>(&self, sock: &S, new_state: u8) -> ProbeOutcome {
        if !self.config.probe_enabled(PROBE_STATE_CHANGE) {
            return ProbeOutcome::Ignored;
        }

        let view = SockView::new(sock, self.layout);

        // The new state is not applied to the object yet
        let kind = match classify_transition(view.state(), new_state) {
            Some(kind) => kind,
            None => return ProbeOutcome::Ignored,
        };

        if is_filtered(self.filter, view.ports()) {
            // connect records unfiltered, drop what it left behind
            if self.config.tracks_identity() {
                self.table.remove(view.handle());
            }
            return ProbeOutcome::Filtered;
        }

        let correlation = match kind {
            EventKind::ConnectionClosed => Correlation {
                consume: true,
                required: false,
                divisor: self.config.close_delta_divisor(),
            },
            _ => Correlation {
                consume: self.config.start_retention() == StartRetention::UntilEstablished,
                required: true,
                divisor: NSEC_PER_USEC,
            },
        };

        self.emit(&view, kind, correlation)
    }

    /// ACK-processing: snapshot the counters of an established connection
    #[inline(always)]
    pub fn on_ack<S: SockReader + ?Sized>(&self, sock: &S) -> ProbeOutcome {
        if !self.config.probe_enabled(PROBE_ACK) {
            return ProbeOutcome::Ignored;
        }

        let view = SockView::new(sock, self.layout);
        if is_filtered(self.filter, view.ports()) {
            return ProbeOutcome::Filtered;
        }

        let correlation = Correlation {
            consume: false,
            required: false,
            divisor: NSEC_PER_USEC,
        };
        self.emit(&view, EventKind::MetricsSnapshot, correlation)
    }

    #[inline(always)]
    fn emit<S: SockReader + ?Sized>(
        &self,
        view: &SockView<'_, S>,
        kind: EventKind,
        correlation: Correlation,
    ) -> ProbeOutcome {
        let family = view.family();
        let route = match (self.config.record_layout(), family) {
            (RecordLayout::Unified, _) | (RecordLayout::PerFamily, AF_INET6) => Route::Wide,
            (RecordLayout::PerFamily, AF_INET) => Route::Narrow,
            _ => return ProbeOutcome::Ignored,
        };

        let start = if self.config.tracks_identity() {
            let found = if correlation.consume {
                self.table.take(view.handle())
            } else {
                self.table.lookup(view.handle())
            };
            if found.is_none() && correlation.required {
                return ProbeOutcome::Missed;
            }
            found
        } else {
            None
        };

        let emit = EmitContext {
            kind,
            now_ns: self.env.now_ns(),
            family,
            start: start.as_ref(),
            delta_divisor: correlation.divisor,
        };

        match route {
            Route::Narrow => {
                let record: Ipv4EventRecord = build_record(view, &emit);
                self.output.publish_v4(&record);
            }
            Route::Wide => {
                let record: Ipv6EventRecord = build_record(view, &emit);
                self.output.publish_v6(&record);
            }
        }

        ProbeOutcome::Emitted(kind)
    }
}

/// How an emission uses the correlation table
#[derive(Clone, Copy)]
struct Correlation {
    /// Remove the start record instead of only reading it
    consume: bool,
    /// Emit nothing when no start record exists
    required: bool,
    /// Nanoseconds to delta units
    divisor: u64,
}

/// Record shape an emission is published as
#[derive(Clone, Copy)]
enum Route {
    /// 32-bit addresses on the IPv4 channel
    Narrow,
    /// 128-bit addresses on the IPv6 channel
    Wide,
}
