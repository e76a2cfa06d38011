//! Shared constants for the tcpexpose probes
//!
//! These constants are used by both the kernel program and the userspace
//! daemon so both sides agree on map sizes, event kinds and counters.

// ============================================================================
// BPF Map Sizes
// ============================================================================

/// Maximum number of in-flight connection attempts held in the correlation table
pub const MAX_CONNECTIONS: u32 = 10240;

/// Maximum number of ports the administrative filter can hold
pub const MAX_EXCLUDED_PORTS: u32 = 64;

/// Length of the kernel's task name buffer (linux/sched.h)
pub const TASK_COMM_LEN: usize = 16;

// ============================================================================
// Event Kinds (for EventRecord.event_type)
// ============================================================================

/// Connection entered ESTABLISHED
pub const EVENT_CONNECTION_OPENED: u64 = 0;

/// Connection left ESTABLISHED
pub const EVENT_CONNECTION_CLOSED: u64 = 1;

/// Counter snapshot taken on the ACK-processing path
pub const EVENT_METRICS_SNAPSHOT: u64 = 2;

/// Connect attempt issued. Recorded in the correlation table, never emitted.
pub const EVENT_CONNECT_ISSUED: u64 = 3;

// ============================================================================
// TCP States (include/net/tcp_states.h)
// ============================================================================

pub const TCP_ESTABLISHED: u8 = 1;
pub const TCP_SYN_SENT: u8 = 2;
pub const TCP_SYN_RECV: u8 = 3;
pub const TCP_FIN_WAIT1: u8 = 4;
pub const TCP_FIN_WAIT2: u8 = 5;
pub const TCP_TIME_WAIT: u8 = 6;
pub const TCP_CLOSE: u8 = 7;
pub const TCP_CLOSE_WAIT: u8 = 8;
pub const TCP_LAST_ACK: u8 = 9;
pub const TCP_LISTEN: u8 = 10;
pub const TCP_CLOSING: u8 = 11;
pub const TCP_NEW_SYN_RECV: u8 = 12;

// ============================================================================
// Address Families
// ============================================================================

/// IPv4 address family
pub const AF_INET: u16 = 2;

/// IPv6 address family
pub const AF_INET6: u16 = 10;

// ============================================================================
// Filtering
// ============================================================================

/// Administrative port excluded from every probe site by default (ssh)
pub const ADMIN_PORT: u16 = 22;

// ============================================================================
// Time Units
// ============================================================================

/// Divisor turning monotonic nanoseconds into microseconds
pub const NSEC_PER_USEC: u64 = 1_000;

/// Divisor historically applied to the connect-to-close delta.
///
/// Every other site divides by [`NSEC_PER_USEC`]; this one yields values
/// ten times larger than the declared microsecond unit. Kept selectable
/// until readers confirm which unit they expect.
pub const LEGACY_CLOSE_DELTA_DIVISOR: u64 = 100;

// ============================================================================
// Pipeline Configuration Values
// ============================================================================

/// connect-issued probe (tcp_v4_connect / tcp_v6_connect)
pub const PROBE_CONNECT: u32 = 1 << 0;

/// state-transition probe (tcp_set_state)
pub const PROBE_STATE_CHANGE: u32 = 1 << 1;

/// ACK-processing probe (tcp_rcv_established)
pub const PROBE_ACK: u32 = 1 << 2;

/// Every probe site
pub const PROBE_ALL: u32 = PROBE_CONNECT | PROBE_STATE_CHANGE | PROBE_ACK;

/// IPv4 records on the v4 channel, IPv6 records on the v6 channel
pub const LAYOUT_PER_FAMILY: u32 = 0;

/// Every record on the v6 channel with 128-bit addresses
pub const LAYOUT_UNIFIED: u32 = 1;

/// Start record removed when the connection is opened
pub const RETAIN_UNTIL_ESTABLISHED: u32 = 0;

/// Start record kept until the connection is closed
pub const RETAIN_UNTIL_CLOSED: u32 = 1;

// ============================================================================
// Statistics Counter Indices (for STATS map)
// ============================================================================

/// connect-issued probe firings
pub const STAT_CONNECT_EVENTS: u32 = 0;

/// state-transition probe firings
pub const STAT_STATE_EVENTS: u32 = 1;

/// ACK-processing probe firings
pub const STAT_ACK_EVENTS: u32 = 2;

/// Start records written to the correlation table
pub const STAT_START_RECORDED: u32 = 3;

/// Start records lost because the correlation table was full
pub const STAT_TABLE_FULL: u32 = 4;

/// Firings suppressed by the port filter
pub const STAT_FILTERED: u32 = 5;

/// Firings without a matching start record
pub const STAT_CORRELATION_MISS: u32 = 6;

/// connection-opened records published
pub const STAT_OPENED: u32 = 7;

/// connection-closed records published
pub const STAT_CLOSED: u32 = 8;

/// metrics-snapshot records published
pub const STAT_SNAPSHOTS: u32 = 9;

/// Firings whose socket argument could not be read
pub const STAT_INVALID_SOCKETS: u32 = 10;

/// Total number of statistics counters
pub const MAX_STATS: u32 = 11;
