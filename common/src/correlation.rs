//! Correlation table contract
//!
//! Maps a connection handle to the [`StartRecord`] captured when the
//! connect was issued. The storage is provided by the host (a BPF hash map
//! in the kernel) and must be safe for concurrent use: several CPUs may
//! insert, read and delete at the same time, so callers never assume an
//! entry is unchanged since they last read it.

use crate::types::StartRecord;

/// Outcome of [`CorrelationTable::record`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordStatus {
    /// Entry inserted or overwritten
    Stored,
    /// Storage exhausted, the connection proceeds without timing correlation
    Full,
}

pub trait CorrelationTable {
    /// Insert or overwrite the start record for `handle`.
    ///
    /// Overwriting is legal when a handle is reused.
    fn record(&self, handle: u64, start: &StartRecord) -> RecordStatus;

    /// Look up the start record for `handle` without removing it
    fn lookup(&self, handle: u64) -> Option<StartRecord>;

    /// Remove `handle` from the table
    fn remove(&self, handle: u64);

    /// Look up and remove the start record for `handle`
    #[inline(always)]
    fn take(&self, handle: u64) -> Option<StartRecord> {
        let start = self.lookup(handle)?;
        self.remove(handle);
        Some(start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTable;

    fn start(ts_ns: u64) -> StartRecord {
        StartRecord::new(ts_ns, 42, *b"curl\0\0\0\0\0\0\0\0\0\0\0\0")
    }

    #[test]
    fn take_returns_what_was_recorded() {
        let table = FakeTable::default();
        let s = start(1_000);

        assert_eq!(table.record(0xdead, &s), RecordStatus::Stored);
        assert_eq!(table.take(0xdead), Some(s));
        assert_eq!(table.take(0xdead), None);
    }

    #[test]
    fn lookup_keeps_the_entry() {
        let table = FakeTable::default();
        table.record(1, &start(5));

        assert_eq!(table.lookup(1), Some(start(5)));
        assert_eq!(table.lookup(1), Some(start(5)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn record_overwrites_on_handle_reuse() {
        let table = FakeTable::default();
        table.record(1, &start(5));
        table.record(1, &start(9));

        assert_eq!(table.take(1), Some(start(9)));
    }

    #[test]
    fn missing_handle_is_a_miss() {
        let table = FakeTable::default();
        table.record(1, &start(5));

        assert_eq!(table.take(2), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn full_table_reports_silent_failure() {
        let table = FakeTable::with_capacity(1);

        assert_eq!(table.record(1, &start(1)), RecordStatus::Stored);
        assert_eq!(table.record(2, &start(2)), RecordStatus::Full);
        // Existing keys can still be overwritten
        assert_eq!(table.record(1, &start(3)), RecordStatus::Stored);
        assert_eq!(table.lookup(2), None);
    }
}
