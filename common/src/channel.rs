//! Output channel contract
//!
//! The kernel implementation is a pair of perf event arrays, one stream per
//! CPU. Publishing is fire-and-forget: when the reader falls behind the
//! record is dropped and never retried.

use crate::types::{Ipv4EventRecord, Ipv6EventRecord};

pub trait OutputChannel {
    /// Publish a record with 32-bit addresses
    fn publish_v4(&self, record: &Ipv4EventRecord);

    /// Publish a record with 128-bit addresses
    fn publish_v6(&self, record: &Ipv6EventRecord);
}
