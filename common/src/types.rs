//! Shared data structures between kernel and userspace
//!
//! These structures must be repr(C) to ensure consistent memory layout
//! between the eBPF program and the reader. Every record field is a u64
//! (or an array of u32 for addresses) so the layout has no implicit padding.

use crate::constants::{NSEC_PER_USEC, TASK_COMM_LEN};

/// Throughput, windowing and RTT counters copied from `struct tcp_sock`
///
/// Each field is an unmodified snapshot of the kernel counter, widened to
/// u64. `srtt_us` stays left-shifted by 3 as the kernel stores it.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsBlock {
    // Throughput
    /// How many inbound bytes were acked
    pub rx_b: u64,
    /// How many outbound bytes were acked
    pub tx_b: u64,
    pub segs_out: u64,
    pub segs_in: u64,
    /// Timestamp of last received ACK (jiffies)
    pub rcv_tstamp: u64,
    /// Timestamp of last sent data packet (jiffies)
    pub lsndtime: u64,

    // Windowing
    /// Sequence for window update
    pub snd_wl1: u64,
    /// The window we expect to receive
    pub snd_wnd: u64,
    /// Maximal window ever seen from peer
    pub max_window: u64,
    /// Cached effective mss, not including SACKS
    pub mss_cache: u64,
    /// Maximal window to advertise
    pub window_clamp: u64,
    /// Current window clamp
    pub rcv_ssthresh: u64,
    /// Packets which are "in flight"
    pub packets_out: u64,
    /// Retransmitted packets out
    pub retrans_out: u64,
    /// max packets_out in last window
    pub max_packets_out: u64,
    /// Right edge of max_packets_out flight
    pub max_packets_seq: u64,

    // RTT
    /// Smoothed round trip time << 3 in usecs
    pub srtt_us: u64,
    /// Medium deviation
    pub mdev_us: u64,
    /// Maximal mdev for the last rtt period
    pub mdev_max_us: u64,
}

/// Event record published on an output channel
///
/// `A` is the address slot: `u32` for the IPv4 layout, `[u32; 4]` for the
/// IPv6 and unified layouts. Addresses keep the kernel's network byte order.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventRecord<A> {
    /// Event kind (see EVENT_* constants)
    pub event_type: u64,
    /// Monotonic timestamp in microseconds
    pub ts_us: u64,
    /// Process that issued the connect, 0 without identity tracking
    pub pid: u64,
    /// Local address
    pub saddr: A,
    /// Remote address
    pub daddr: A,
    /// Address family of the socket (AF_INET / AF_INET6)
    pub family: u64,
    /// Remote port in the low 32 bits, local port in the high 32 bits
    pub ports: u64,
    /// Time since the connect was issued, 0 without identity tracking
    pub delta_us: u64,
    /// Name of the process that issued the connect
    pub task: [u8; TASK_COMM_LEN],
    pub metrics: MetricsBlock,
}

/// Record with two 32-bit addresses
pub type Ipv4EventRecord = EventRecord<u32>;

/// Record with two 128-bit addresses (IPv6 and unified layouts)
pub type Ipv6EventRecord = EventRecord<[u32; 4]>;

impl<A: Copy + Default> EventRecord<A> {
    /// A record with every field zero-filled
    pub fn zeroed() -> Self {
        Self {
            event_type: 0,
            ts_us: 0,
            pid: 0,
            saddr: A::default(),
            daddr: A::default(),
            family: 0,
            ports: 0,
            delta_us: 0,
            task: [0; TASK_COMM_LEN],
            metrics: MetricsBlock::default(),
        }
    }

    /// Unpacked port pair
    pub fn port_pair(&self) -> PortPair {
        PortPair::unpack(self.ports)
    }
}

/// Connect-time metadata kept in the correlation table
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StartRecord {
    /// Monotonic timestamp of the connect attempt (nanoseconds)
    pub ts_ns: u64,
    /// Process ID that issued the connect
    pub pid: u32,
    /// Padding for alignment
    pub _padding: u32,
    /// Name of the process that issued the connect
    pub task: [u8; TASK_COMM_LEN],
}

impl StartRecord {
    pub fn new(ts_ns: u64, pid: u32, task: [u8; TASK_COMM_LEN]) -> Self {
        Self {
            ts_ns,
            pid,
            _padding: 0,
            task,
        }
    }

    /// Microseconds elapsed between the connect and `now_ns`, using `divisor`
    /// to turn nanoseconds into the record's unit
    #[inline(always)]
    pub fn elapsed(&self, now_ns: u64, divisor: u64) -> u64 {
        now_ns.saturating_sub(self.ts_ns) / divisor
    }
}

/// Local and remote port of a connection, both in host byte order
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PortPair {
    pub local: u16,
    pub remote: u16,
}

impl PortPair {
    /// Build from the raw socket fields: `skc_dport` is network order,
    /// `skc_num` is already host order
    #[inline(always)]
    pub fn from_sock_fields(dport_be: u16, num: u16) -> Self {
        Self {
            local: num,
            remote: u16::from_be(dport_be),
        }
    }

    /// Remote port in the low 32 bits, local port shifted into the high 32 bits
    #[inline(always)]
    pub fn pack(self) -> u64 {
        (self.remote as u64) + ((self.local as u64) << 32)
    }

    pub fn unpack(ports: u64) -> Self {
        Self {
            local: (ports >> 32) as u16,
            remote: (ports & 0xFFFF_FFFF) as u16,
        }
    }
}

/// Convert a monotonic nanosecond reading to microseconds
#[inline(always)]
pub fn ns_to_us(ns: u64) -> u64 {
    ns / NSEC_PER_USEC
}

// Compile-time layout checks, the reader decodes these byte for byte
const _: () = {
    assert!(core::mem::size_of::<MetricsBlock>() == 19 * 8);
    assert!(core::mem::size_of::<Ipv4EventRecord>() == 56 + TASK_COMM_LEN + 19 * 8);
    assert!(core::mem::size_of::<Ipv6EventRecord>() == 80 + TASK_COMM_LEN + 19 * 8);
    assert!(core::mem::size_of::<StartRecord>() == 16 + TASK_COMM_LEN);
    assert!(core::mem::size_of::<Ipv4EventRecord>() % core::mem::align_of::<Ipv4EventRecord>() == 0);
    assert!(core::mem::size_of::<Ipv6EventRecord>() % core::mem::align_of::<Ipv6EventRecord>() == 0);
};

// Implement Aya's Pod trait for userspace usage
#[cfg(feature = "userspace")]
mod userspace_impls {
    use super::*;

    unsafe impl aya::Pod for Ipv4EventRecord {}
    unsafe impl aya::Pod for Ipv6EventRecord {}
    unsafe impl aya::Pod for StartRecord {}
}
