//! Record building
//!
//! Shapes one connection object into a fixed-size [`EventRecord`]. The
//! record is assembled entirely on the stack and handed to the output
//! channel in one piece.

use crate::classify::EventKind;
use crate::sock::{SockReader, SockView};
use crate::types::{ns_to_us, EventRecord, StartRecord};

/// Address slot of a record layout
pub trait AddressSlot: Copy + Default {
    /// Read (local, remote) addresses from the connection object
    fn read<S: SockReader + ?Sized>(view: &SockView<'_, S>) -> (Self, Self);
}

impl AddressSlot for u32 {
    #[inline(always)]
    fn read<S: SockReader + ?Sized>(view: &SockView<'_, S>) -> (Self, Self) {
        view.ipv4_addrs()
    }
}

impl AddressSlot for [u32; 4] {
    #[inline(always)]
    fn read<S: SockReader + ?Sized>(view: &SockView<'_, S>) -> (Self, Self) {
        view.ipv6_addrs()
    }
}

/// Everything about one emission that does not come from the socket
#[derive(Clone, Copy, Debug)]
pub struct EmitContext<'a> {
    pub kind: EventKind,
    pub now_ns: u64,
    pub family: u16,
    /// Start record found in the correlation table, if identity is tracked
    pub start: Option<&'a StartRecord>,
    /// Divisor turning the elapsed nanoseconds into the record's delta
    pub delta_divisor: u64,
}

/// Build a record from a classified event and its connection object
#[inline(always)]
pub fn build_record<A: AddressSlot, S: SockReader + ?Sized>(
    view: &SockView<'_, S>,
    emit: &EmitContext<'_>,
) -> EventRecord<A> {
    let mut record = EventRecord::<A>::zeroed();
    let (saddr, daddr) = A::read(view);

    record.event_type = emit.kind.code();
    record.ts_us = ns_to_us(emit.now_ns);
    record.saddr = saddr;
    record.daddr = daddr;
    record.family = emit.family as u64;
    record.ports = view.ports().pack();
    record.metrics = view.metrics();

    if let Some(start) = emit.start {
        record.pid = start.pid as u64;
        record.task = start.task;
        record.delta_us = start.elapsed(emit.now_ns, emit.delta_divisor);
    }

    record
}
