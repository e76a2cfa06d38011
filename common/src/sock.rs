//! Access to kernel connection objects
//!
//! The pipeline never dereferences a `struct sock` directly. It goes through
//! [`SockReader`], whose reads may fail when the object is freed or unmapped,
//! and through a [`SockLayout`] table of field offsets so the same code runs
//! against any kernel build whose offsets are known.

use crate::types::{MetricsBlock, PortPair};

/// Safe-copy access to one kernel connection object
pub trait SockReader {
    /// Opaque identity of the object, used only as a correlation key
    fn handle(&self) -> u64;

    /// Copy a `T` from `offset` bytes into the object.
    ///
    /// Returns `None` when the memory cannot be read.
    fn read_at<T: Copy>(&self, offset: u32) -> Option<T>;
}

/// Byte offsets of the `sock_common` and `tcp_sock` fields the pipeline reads
///
/// `sock_common` offsets are stable across kernels. The `tcp_sock` defaults
/// describe the reference x86_64 build and should be regenerated with
/// `pahole -C tcp_sock vmlinux` for other kernels.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SockLayout {
    // struct sock_common
    pub skc_daddr: u32,
    pub skc_rcv_saddr: u32,
    pub skc_dport: u32,
    pub skc_num: u32,
    pub skc_family: u32,
    pub skc_state: u32,
    pub skc_v6_daddr: u32,
    pub skc_v6_rcv_saddr: u32,

    // struct tcp_sock, u64 counters
    pub bytes_received: u32,
    pub bytes_acked: u32,

    // struct tcp_sock, u32 counters
    pub segs_out: u32,
    pub segs_in: u32,
    pub rcv_tstamp: u32,
    pub lsndtime: u32,
    pub snd_wl1: u32,
    pub snd_wnd: u32,
    pub max_window: u32,
    pub mss_cache: u32,
    pub window_clamp: u32,
    pub rcv_ssthresh: u32,
    pub packets_out: u32,
    pub retrans_out: u32,
    pub max_packets_out: u32,
    pub max_packets_seq: u32,
    pub srtt_us: u32,
    pub mdev_us: u32,
    pub mdev_max_us: u32,
}

impl SockLayout {
    pub const DEFAULT: Self = Self {
        skc_daddr: 0,
        skc_rcv_saddr: 4,
        skc_dport: 12,
        skc_num: 14,
        skc_family: 16,
        skc_state: 18,
        skc_v6_daddr: 56,
        skc_v6_rcv_saddr: 72,

        bytes_received: 1592,
        bytes_acked: 1720,

        segs_out: 1600,
        segs_in: 1560,
        rcv_tstamp: 1664,
        lsndtime: 1676,
        snd_wl1: 1632,
        snd_wnd: 1636,
        max_window: 1640,
        mss_cache: 1644,
        window_clamp: 1648,
        rcv_ssthresh: 1652,
        packets_out: 1760,
        retrans_out: 1764,
        max_packets_out: 1768,
        max_packets_seq: 1772,
        srtt_us: 1744,
        mdev_us: 1748,
        mdev_max_us: 1752,
    };
}

impl Default for SockLayout {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// A connection object paired with the offsets needed to read it
///
/// Every accessor falls back to zero when its read fails, so one bad field
/// never aborts the rest of a record.
pub struct SockView<'a, S: SockReader + ?Sized> {
    sock: &'a S,
    layout: &'a SockLayout,
}

impl<'a, S: SockReader + ?Sized> SockView<'a, S> {
    #[inline(always)]
    pub fn new(sock: &'a S, layout: &'a SockLayout) -> Self {
        Self { sock, layout }
    }

    #[inline(always)]
    pub fn handle(&self) -> u64 {
        self.sock.handle()
    }

    #[inline(always)]
    fn read<T: Copy + Default>(&self, offset: u32) -> T {
        self.sock.read_at::<T>(offset).unwrap_or_default()
    }

    #[inline(always)]
    fn counter32(&self, offset: u32) -> u64 {
        self.read::<u32>(offset) as u64
    }

    #[inline(always)]
    pub fn family(&self) -> u16 {
        self.read(self.layout.skc_family)
    }

    /// State currently applied to the object
    #[inline(always)]
    pub fn state(&self) -> u8 {
        self.read(self.layout.skc_state)
    }

    #[inline(always)]
    pub fn ports(&self) -> PortPair {
        let dport: u16 = self.read(self.layout.skc_dport);
        let num: u16 = self.read(self.layout.skc_num);
        PortPair::from_sock_fields(dport, num)
    }

    /// (local, remote) IPv4 addresses in network byte order
    #[inline(always)]
    pub fn ipv4_addrs(&self) -> (u32, u32) {
        (
            self.read(self.layout.skc_rcv_saddr),
            self.read(self.layout.skc_daddr),
        )
    }

    /// (local, remote) IPv6 addresses as four network-order words each
    #[inline(always)]
    pub fn ipv6_addrs(&self) -> ([u32; 4], [u32; 4]) {
        (
            self.read(self.layout.skc_v6_rcv_saddr),
            self.read(self.layout.skc_v6_daddr),
        )
    }

    /// Snapshot of every counter in the metrics block
    #[inline(always)]
    pub fn metrics(&self) -> MetricsBlock {
        let l = self.layout;
        MetricsBlock {
            rx_b: self.read::<u64>(l.bytes_received),
            tx_b: self.read::<u64>(l.bytes_acked),
            segs_out: self.counter32(l.segs_out),
            segs_in: self.counter32(l.segs_in),
            rcv_tstamp: self.counter32(l.rcv_tstamp),
            lsndtime: self.counter32(l.lsndtime),

            snd_wl1: self.counter32(l.snd_wl1),
            snd_wnd: self.counter32(l.snd_wnd),
            max_window: self.counter32(l.max_window),
            mss_cache: self.counter32(l.mss_cache),
            window_clamp: self.counter32(l.window_clamp),
            rcv_ssthresh: self.counter32(l.rcv_ssthresh),
            packets_out: self.counter32(l.packets_out),
            retrans_out: self.counter32(l.retrans_out),
            max_packets_out: self.counter32(l.max_packets_out),
            max_packets_seq: self.counter32(l.max_packets_seq),

            srtt_us: self.counter32(l.srtt_us),
            mdev_us: self.counter32(l.mdev_us),
            mdev_max_us: self.counter32(l.mdev_max_us),
        }
    }
}

#[cfg(feature = "userspace")]
unsafe impl aya::Pod for SockLayout {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSock;

    #[test]
    fn reads_ports_and_addresses() {
        let layout = SockLayout::DEFAULT;
        let sock = FakeSock::ipv4(&layout, 7, [10, 0, 0, 1], [10, 0, 0, 2], 40000, 443);
        let view = SockView::new(&sock, &layout);

        assert_eq!(view.handle(), 7);
        assert_eq!(view.ports(), PortPair { local: 40000, remote: 443 });
        assert_eq!(
            view.ipv4_addrs(),
            (
                u32::from_ne_bytes([10, 0, 0, 1]),
                u32::from_ne_bytes([10, 0, 0, 2])
            )
        );
    }

    #[test]
    fn unreadable_fields_default_to_zero() {
        let layout = SockLayout::DEFAULT;
        // Only sock_common is mapped; every tcp_sock counter is out of range
        let mut sock = FakeSock::ipv4(&layout, 7, [10, 0, 0, 1], [10, 0, 0, 2], 40000, 443);
        sock.truncate(128);
        let view = SockView::new(&sock, &layout);

        assert_eq!(view.metrics(), MetricsBlock::default());
        assert_eq!(view.ports().remote, 443);
    }

    #[test]
    fn metrics_are_copied_verbatim() {
        let layout = SockLayout::DEFAULT;
        let mut sock = FakeSock::ipv4(&layout, 7, [10, 0, 0, 1], [10, 0, 0, 2], 40000, 443);
        sock.write(layout.bytes_received, 1000u64);
        sock.write(layout.bytes_acked, 2000u64);
        sock.write(layout.srtt_us, 8 * 250u32);
        sock.write(layout.max_packets_seq, u32::MAX);
        let view = SockView::new(&sock, &layout);

        let metrics = view.metrics();
        assert_eq!(metrics.rx_b, 1000);
        assert_eq!(metrics.tx_b, 2000);
        assert_eq!(metrics.srtt_us, 2000);
        assert_eq!(metrics.max_packets_seq, u32::MAX as u64);
        assert_eq!(metrics.segs_in, 0);
    }
}
