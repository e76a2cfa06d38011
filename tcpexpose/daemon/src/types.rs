//! Userspace type definitions
//!
//! Kernel records arrive as raw bytes on the perf buffers. This module
//! decodes them into [`DecodedEvent`], the form every exporter and the
//! connection tracker work with.
//!
//! ## Organization
//!
//! - **Kernel Types**: fixed layouts shared with the eBPF program
//! - **Userspace Types**: decoded events and snapshots used for export

use anyhow::{bail, ensure, Result};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

// ============================================================================
// Kernel Types (from eBPF programs)
// ============================================================================

pub mod kernel {
    //! Types shared between the kernel eBPF program and userspace
    //!
    //! Re-exported from tcpexpose-common; they must stay binary compatible
    //! with the records the eBPF program publishes.

    pub use tcpexpose_common::constants;
    pub use tcpexpose_common::types::{
        EventRecord, Ipv4EventRecord, Ipv6EventRecord, MetricsBlock, PortPair,
    };
}

use kernel::{constants::*, EventRecord, Ipv4EventRecord, Ipv6EventRecord, MetricsBlock, PortPair};

/// Lifecycle event visible to consumers
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    Opened,
    Closed,
    Metrics,
}

impl LifecycleEvent {
    pub fn label(self) -> &'static str {
        match self {
            LifecycleEvent::Opened => "OPEN",
            LifecycleEvent::Closed => "CLOSE",
            LifecycleEvent::Metrics => "METRICS",
        }
    }
}

impl TryFrom<u64> for LifecycleEvent {
    type Error = anyhow::Error;

    fn try_from(code: u64) -> Result<Self> {
        match code {
            EVENT_CONNECTION_OPENED => Ok(LifecycleEvent::Opened),
            EVENT_CONNECTION_CLOSED => Ok(LifecycleEvent::Closed),
            EVENT_METRICS_SNAPSHOT => Ok(LifecycleEvent::Metrics),
            other => bail!("Unknown event type code: {}", other),
        }
    }
}

/// Counters sampled from the connection at emission time
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub segs_out: u64,
    pub segs_in: u64,
    pub rcv_tstamp: u64,
    pub lsndtime: u64,
    pub snd_wl1: u64,
    pub snd_wnd: u64,
    pub max_window: u64,
    pub mss_cache: u64,
    pub window_clamp: u64,
    pub rcv_ssthresh: u64,
    pub packets_out: u64,
    pub retrans_out: u64,
    pub max_packets_out: u64,
    pub max_packets_seq: u64,
    /// Smoothed RTT, shifted left by 3 as the kernel keeps it
    pub srtt_us: u64,
    pub mdev_us: u64,
    pub mdev_max_us: u64,
}

impl From<&MetricsBlock> for MetricsSnapshot {
    fn from(m: &MetricsBlock) -> Self {
        Self {
            rx_bytes: m.rx_b,
            tx_bytes: m.tx_b,
            segs_out: m.segs_out,
            segs_in: m.segs_in,
            rcv_tstamp: m.rcv_tstamp,
            lsndtime: m.lsndtime,
            snd_wl1: m.snd_wl1,
            snd_wnd: m.snd_wnd,
            max_window: m.max_window,
            mss_cache: m.mss_cache,
            window_clamp: m.window_clamp,
            rcv_ssthresh: m.rcv_ssthresh,
            packets_out: m.packets_out,
            retrans_out: m.retrans_out,
            max_packets_out: m.max_packets_out,
            max_packets_seq: m.max_packets_seq,
            srtt_us: m.srtt_us,
            mdev_us: m.mdev_us,
            mdev_max_us: m.mdev_max_us,
        }
    }
}

/// One record read from a perf buffer
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DecodedEvent {
    pub event: LifecycleEvent,
    /// Monotonic kernel time in microseconds
    pub ts_us: u64,
    pub pid: u32,
    pub comm: String,
    pub family: u16,
    pub saddr: IpAddr,
    pub daddr: IpAddr,
    /// Local port
    pub sport: u16,
    /// Remote port
    pub dport: u16,
    /// Microseconds since the connect, 0 when not correlated
    pub delta_us: u64,
    pub metrics: MetricsSnapshot,
}

impl DecodedEvent {
    pub fn quartet(&self) -> Quartet {
        Quartet {
            saddr: self.saddr,
            sport: self.sport,
            daddr: self.daddr,
            dport: self.dport,
        }
    }

    /// 4 or 6, after v4-mapped addresses have been collapsed
    pub fn ip_version(&self) -> u8 {
        match self.daddr {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 6,
        }
    }

    fn from_record<A: Copy + Default>(record: &EventRecord<A>, saddr: IpAddr, daddr: IpAddr) -> Result<Self> {
        let event = LifecycleEvent::try_from(record.event_type)?;
        let PortPair { local, remote } = record.port_pair();

        Ok(Self {
            event,
            ts_us: record.ts_us,
            pid: record.pid as u32,
            comm: comm_to_string(&record.task),
            family: record.family as u16,
            saddr,
            daddr,
            sport: local,
            dport: remote,
            delta_us: record.delta_us,
            metrics: MetricsSnapshot::from(&record.metrics),
        })
    }
}

/// Decode a record from the EVENTS_V4 channel
pub fn decode_v4(buf: &[u8]) -> Result<DecodedEvent> {
    let record: Ipv4EventRecord = read_record(buf)?;
    DecodedEvent::from_record(
        &record,
        IpAddr::V4(ipv4_from_raw(record.saddr)),
        IpAddr::V4(ipv4_from_raw(record.daddr)),
    )
}

/// Decode a record from the EVENTS_V6 channel
pub fn decode_v6(buf: &[u8]) -> Result<DecodedEvent> {
    let record: Ipv6EventRecord = read_record(buf)?;
    let family = record.family as u16;
    DecodedEvent::from_record(
        &record,
        ip_from_words(record.saddr, family),
        ip_from_words(record.daddr, family),
    )
}

fn read_record<T: Copy>(buf: &[u8]) -> Result<T> {
    ensure!(
        buf.len() >= std::mem::size_of::<T>(),
        "Short record: {} bytes, expected {}",
        buf.len(),
        std::mem::size_of::<T>()
    );
    let ptr = buf.as_ptr() as *const T;
    Ok(unsafe { ptr.read_unaligned() })
}

/// Addresses are copied from the kernel in network order
pub fn ipv4_from_raw(raw: u32) -> Ipv4Addr {
    Ipv4Addr::from(raw.to_ne_bytes())
}

/// 128-bit address as four words in memory order; collapsed to IPv4 when
/// the socket is AF_INET or the address is v4-mapped
pub fn ip_from_words(words: [u32; 4], family: u16) -> IpAddr {
    let mut bytes = [0u8; 16];
    for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_ne_bytes());
    }
    let addr = Ipv6Addr::from(bytes);

    match addr.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None if family == AF_INET && bytes[..12].iter().all(|b| *b == 0) => {
            IpAddr::V4(Ipv4Addr::new(bytes[12], bytes[13], bytes[14], bytes[15]))
        }
        None => IpAddr::V6(addr),
    }
}

fn comm_to_string(task: &[u8]) -> String {
    let end = task.iter().position(|b| *b == 0).unwrap_or(task.len());
    String::from_utf8_lossy(&task[..end]).into_owned()
}

/// Address and port quartet identifying a connection in userspace
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quartet {
    pub saddr: IpAddr,
    pub sport: u16,
    pub daddr: IpAddr,
    pub dport: u16,
}

impl fmt::Display for Quartet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}",
            std::net::SocketAddr::new(self.saddr, self.sport),
            std::net::SocketAddr::new(self.daddr, self.dport)
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn as_bytes<T>(record: &T) -> Vec<u8> {
        let ptr = record as *const T as *const u8;
        unsafe { std::slice::from_raw_parts(ptr, std::mem::size_of::<T>()) }.to_vec()
    }

    fn task(name: &str) -> [u8; TASK_COMM_LEN] {
        let mut task = [0u8; TASK_COMM_LEN];
        task[..name.len()].copy_from_slice(name.as_bytes());
        task
    }

    pub(crate) fn v4_record(event_type: u64, lport: u16, rport: u16) -> Vec<u8> {
        let mut record = Ipv4EventRecord::zeroed();
        record.event_type = event_type;
        record.ts_us = 5_000;
        record.pid = 4242;
        record.saddr = u32::from_ne_bytes([10, 0, 0, 1]);
        record.daddr = u32::from_ne_bytes([93, 184, 216, 34]);
        record.family = AF_INET as u64;
        record.ports = PortPair { local: lport, remote: rport }.pack();
        record.delta_us = 1_500;
        record.task = task("curl");
        record.metrics.srtt_us = 800;
        as_bytes(&record)
    }

    pub(crate) fn v6_record(event_type: u64, daddr: [u8; 16], family: u16) -> Vec<u8> {
        let words = |bytes: [u8; 16]| {
            let mut words = [0u32; 4];
            for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
                *word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
            words
        };

        let mut record = Ipv6EventRecord::zeroed();
        record.event_type = event_type;
        record.pid = 7;
        record.saddr = words(Ipv6Addr::LOCALHOST.octets());
        record.daddr = words(daddr);
        record.family = family as u64;
        record.ports = PortPair { local: 40000, remote: 443 }.pack();
        record.task = task("wget");
        as_bytes(&record)
    }

    #[test]
    fn decodes_ipv4_record() {
        let event = decode_v4(&v4_record(EVENT_CONNECTION_OPENED, 51000, 443)).unwrap();

        assert_eq!(event.event, LifecycleEvent::Opened);
        assert_eq!(event.pid, 4242);
        assert_eq!(event.comm, "curl");
        assert_eq!(event.saddr, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(event.daddr, IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)));
        assert_eq!(event.sport, 51000);
        assert_eq!(event.dport, 443);
        assert_eq!(event.delta_us, 1_500);
        assert_eq!(event.metrics.srtt_us, 800);
        assert_eq!(event.ip_version(), 4);
    }

    #[test]
    fn decodes_ipv6_record() {
        let daddr: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let event = decode_v6(&v6_record(EVENT_METRICS_SNAPSHOT, daddr.octets(), AF_INET6)).unwrap();

        assert_eq!(event.event, LifecycleEvent::Metrics);
        assert_eq!(event.saddr, IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(event.daddr, IpAddr::V6(daddr));
        assert_eq!(event.dport, 443);
        assert_eq!(event.sport, 40000);
        assert_eq!(event.comm, "wget");
    }

    #[test]
    fn collapses_v4_mapped_addresses() {
        let mapped: Ipv6Addr = "::ffff:192.0.2.7".parse().unwrap();
        let event = decode_v6(&v6_record(EVENT_CONNECTION_CLOSED, mapped.octets(), AF_INET6)).unwrap();

        assert_eq!(event.daddr, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7)));
        assert_eq!(event.ip_version(), 4);
    }

    #[test]
    fn rejects_short_and_unknown_records() {
        let record = v4_record(EVENT_CONNECTION_OPENED, 1, 2);
        assert!(decode_v4(&record[..record.len() - 1]).is_err());

        // connect-issued never leaves the kernel
        assert!(decode_v4(&v4_record(EVENT_CONNECT_ISSUED, 1, 2)).is_err());
    }

    #[test]
    fn quartet_display() {
        let event = decode_v4(&v4_record(EVENT_CONNECTION_OPENED, 51000, 80)).unwrap();
        assert_eq!(event.quartet().to_string(), "10.0.0.1:51000 -> 93.184.216.34:80");
    }
}
