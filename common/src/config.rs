//! Pipeline configuration shared with the kernel program
//!
//! The daemon writes one [`PipelineConfig`] into the CONFIG array map before
//! attaching any probe. The kernel falls back to [`PipelineConfig::DEFAULT`]
//! when the slot was never written.

use crate::constants::*;

/// Record layout selection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordLayout {
    /// IPv4 records on the v4 channel, IPv6 records on the v6 channel
    PerFamily,
    /// Every record on the v6 channel, family carried in a side field
    Unified,
}

/// When a start record leaves the correlation table
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartRetention {
    /// Taken by the opened event
    UntilEstablished,
    /// Read by opened and metrics events, taken by the closed event
    UntilClosed,
}

/// Fixed-layout configuration read by every probe invocation
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Active probe sites (PROBE_* bits)
    pub probes: u32,
    /// LAYOUT_PER_FAMILY or LAYOUT_UNIFIED
    pub layout: u32,
    /// Non-zero to correlate events with connect-time identity
    pub track_identity: u32,
    /// RETAIN_UNTIL_ESTABLISHED or RETAIN_UNTIL_CLOSED
    pub retention: u32,
    /// Non-zero to divide the connect-to-close delta by 100
    pub legacy_close_delta: u32,
    /// Padding for alignment
    pub _padding: u32,
}

impl PipelineConfig {
    pub const DEFAULT: Self = Self {
        probes: PROBE_ALL,
        layout: LAYOUT_UNIFIED,
        track_identity: 1,
        retention: RETAIN_UNTIL_ESTABLISHED,
        legacy_close_delta: 1,
        _padding: 0,
    };

    #[inline(always)]
    pub fn probe_enabled(&self, probe: u32) -> bool {
        self.probes & probe != 0
    }

    #[inline(always)]
    pub fn record_layout(&self) -> RecordLayout {
        if self.layout == LAYOUT_PER_FAMILY {
            RecordLayout::PerFamily
        } else {
            RecordLayout::Unified
        }
    }

    #[inline(always)]
    pub fn tracks_identity(&self) -> bool {
        self.track_identity != 0
    }

    #[inline(always)]
    pub fn start_retention(&self) -> StartRetention {
        if self.retention == RETAIN_UNTIL_CLOSED {
            StartRetention::UntilClosed
        } else {
            StartRetention::UntilEstablished
        }
    }

    /// Divisor applied to the connect-to-close delta
    #[inline(always)]
    pub fn close_delta_divisor(&self) -> u64 {
        if self.legacy_close_delta != 0 {
            LEGACY_CLOSE_DELTA_DIVISOR
        } else {
            NSEC_PER_USEC
        }
    }

    pub fn with_layout(mut self, layout: RecordLayout) -> Self {
        self.layout = match layout {
            RecordLayout::PerFamily => LAYOUT_PER_FAMILY,
            RecordLayout::Unified => LAYOUT_UNIFIED,
        };
        self
    }

    pub fn with_retention(mut self, retention: StartRetention) -> Self {
        self.retention = match retention {
            StartRetention::UntilEstablished => RETAIN_UNTIL_ESTABLISHED,
            StartRetention::UntilClosed => RETAIN_UNTIL_CLOSED,
        };
        self
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(feature = "userspace")]
unsafe impl aya::Pod for PipelineConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_enables_everything_and_keeps_legacy_close_unit() {
        let config = PipelineConfig::default();

        assert!(config.probe_enabled(PROBE_CONNECT));
        assert!(config.probe_enabled(PROBE_STATE_CHANGE));
        assert!(config.probe_enabled(PROBE_ACK));
        assert!(config.tracks_identity());
        assert_eq!(config.record_layout(), RecordLayout::Unified);
        assert_eq!(config.start_retention(), StartRetention::UntilEstablished);
        assert_eq!(config.close_delta_divisor(), 100);
    }

    #[test]
    fn builders_round_trip_through_raw_fields() {
        let config = PipelineConfig::default()
            .with_layout(RecordLayout::PerFamily)
            .with_retention(StartRetention::UntilClosed);

        assert_eq!(config.layout, LAYOUT_PER_FAMILY);
        assert_eq!(config.record_layout(), RecordLayout::PerFamily);
        assert_eq!(config.start_retention(), StartRetention::UntilClosed);
    }
}
