//! Event classification
//!
//! Decides, before any counters are read, whether a probe firing becomes a
//! record and of which kind.

use crate::constants::*;
use crate::types::PortPair;

/// Kind of event a probe firing represents
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// Connect issued, only ever recorded in the correlation table
    ConnectIssued,
    ConnectionOpened,
    ConnectionClosed,
    MetricsSnapshot,
}

impl EventKind {
    /// Value written to `EventRecord.event_type`
    #[inline(always)]
    pub fn code(self) -> u64 {
        match self {
            EventKind::ConnectionOpened => EVENT_CONNECTION_OPENED,
            EventKind::ConnectionClosed => EVENT_CONNECTION_CLOSED,
            EventKind::MetricsSnapshot => EVENT_METRICS_SNAPSHOT,
            EventKind::ConnectIssued => EVENT_CONNECT_ISSUED,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            EVENT_CONNECTION_OPENED => Some(EventKind::ConnectionOpened),
            EVENT_CONNECTION_CLOSED => Some(EventKind::ConnectionClosed),
            EVENT_METRICS_SNAPSHOT => Some(EventKind::MetricsSnapshot),
            EVENT_CONNECT_ISSUED => Some(EventKind::ConnectIssued),
            _ => None,
        }
    }

    /// Whether records of this kind reach the output channel
    pub fn is_visible(self) -> bool {
        !matches!(self, EventKind::ConnectIssued)
    }
}

/// Classify a tcp_set_state firing.
///
/// `current` is the state still applied to the object, `next` the state
/// being set. Only transitions into or out of ESTABLISHED are reported.
#[inline(always)]
pub fn classify_transition(current: u8, next: u8) -> Option<EventKind> {
    if next == TCP_ESTABLISHED {
        Some(EventKind::ConnectionOpened)
    } else if current == TCP_ESTABLISHED {
        Some(EventKind::ConnectionClosed)
    } else {
        None
    }
}

/// Set of ports whose traffic produces no events
pub trait PortFilter {
    fn is_excluded(&self, port: u16) -> bool;
}

impl PortFilter for [u16] {
    fn is_excluded(&self, port: u16) -> bool {
        self.contains(&port)
    }
}

/// True when either end of the connection uses an excluded port
#[inline(always)]
pub fn is_filtered<F: PortFilter + ?Sized>(filter: &F, ports: PortPair) -> bool {
    filter.is_excluded(ports.remote) || filter.is_excluded(ports.local)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [u8; 12] = [
        TCP_ESTABLISHED,
        TCP_SYN_SENT,
        TCP_SYN_RECV,
        TCP_FIN_WAIT1,
        TCP_FIN_WAIT2,
        TCP_TIME_WAIT,
        TCP_CLOSE,
        TCP_CLOSE_WAIT,
        TCP_LAST_ACK,
        TCP_LISTEN,
        TCP_CLOSING,
        TCP_NEW_SYN_RECV,
    ];

    #[test]
    fn into_established_is_opened() {
        assert_eq!(
            classify_transition(TCP_SYN_SENT, TCP_ESTABLISHED),
            Some(EventKind::ConnectionOpened)
        );
        assert_eq!(
            classify_transition(TCP_SYN_RECV, TCP_ESTABLISHED),
            Some(EventKind::ConnectionOpened)
        );
    }

    #[test]
    fn out_of_established_is_closed() {
        assert_eq!(
            classify_transition(TCP_ESTABLISHED, TCP_FIN_WAIT1),
            Some(EventKind::ConnectionClosed)
        );
        assert_eq!(
            classify_transition(TCP_ESTABLISHED, TCP_CLOSE_WAIT),
            Some(EventKind::ConnectionClosed)
        );
    }

    #[test]
    fn transitions_away_from_established_are_ignored() {
        for current in ALL_STATES {
            for next in ALL_STATES {
                if current != TCP_ESTABLISHED && next != TCP_ESTABLISHED {
                    assert_eq!(classify_transition(current, next), None, "{current} -> {next}");
                }
            }
        }
    }

    #[test]
    fn filter_matches_either_port() {
        let excluded: &[u16] = &[ADMIN_PORT];

        assert!(is_filtered(excluded, PortPair { local: 50000, remote: 22 }));
        assert!(is_filtered(excluded, PortPair { local: 22, remote: 50000 }));
        assert!(!is_filtered(excluded, PortPair { local: 50000, remote: 443 }));
    }

    #[test]
    fn event_codes_round_trip() {
        for kind in [
            EventKind::ConnectIssued,
            EventKind::ConnectionOpened,
            EventKind::ConnectionClosed,
            EventKind::MetricsSnapshot,
        ] {
            assert_eq!(EventKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(EventKind::from_code(99), None);
        assert!(!EventKind::ConnectIssued.is_visible());
    }
}
