//! Event processing from eBPF perf buffers
//!
//! Reads records from the per-CPU perf buffers of both output channels,
//! decodes them and forwards them to the main loop over an mpsc channel.

use crate::types::{decode_v4, decode_v6, DecodedEvent};
use anyhow::Result;
use aya::{
    maps::{perf::AsyncPerfEventArray, MapData},
    util::online_cpus,
};
use bytes::BytesMut;
use log::{debug, info, warn};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tcpexpose_common::{Ipv4EventRecord, Ipv6EventRecord};
use tokio::sync::mpsc;

/// Output channel a perf array belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    V4,
    V6,
}

impl Channel {
    pub fn map_name(self) -> &'static str {
        match self {
            Channel::V4 => "EVENTS_V4",
            Channel::V6 => "EVENTS_V6",
        }
    }

    fn record_size(self) -> usize {
        match self {
            Channel::V4 => std::mem::size_of::<Ipv4EventRecord>(),
            Channel::V6 => std::mem::size_of::<Ipv6EventRecord>(),
        }
    }

    pub fn decode(self, buf: &[u8]) -> Result<DecodedEvent> {
        match self {
            Channel::V4 => decode_v4(buf),
            Channel::V6 => decode_v6(buf),
        }
    }
}

/// Event processor that reads from perf buffers
pub struct EventProcessor {
    sender: mpsc::Sender<DecodedEvent>,
    lost: Arc<AtomicU64>,
}

impl EventProcessor {
    /// Create a new event processor
    ///
    /// # Arguments
    ///
    /// * `sender` - Channel decoded events are forwarded to
    pub fn new(sender: mpsc::Sender<DecodedEvent>) -> Self {
        Self {
            sender,
            lost: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Samples the kernel dropped because a perf buffer was full
    pub fn lost_events(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    /// Spawn per-CPU event readers for one output channel
    ///
    /// Creates a task for each CPU to read events from its perf buffer.
    pub fn spawn_cpu_readers(
        &self,
        mut perf_array: AsyncPerfEventArray<MapData>,
        channel: Channel,
    ) -> Result<()> {
        let cpus = online_cpus()?;
        info!(
            "Spawning {} readers for {} CPUs",
            channel.map_name(),
            cpus.len()
        );

        for cpu_id in cpus {
            let mut buf = perf_array.open(cpu_id, None)?;
            let sender = self.sender.clone();
            let lost = Arc::clone(&self.lost);

            tokio::spawn(async move {
                let mut buffers = (0..10)
                    .map(|_| BytesMut::with_capacity(channel.record_size()))
                    .collect::<Vec<_>>();

                loop {
                    let events = match buf.read_events(&mut buffers).await {
                        Ok(events) => events,
                        Err(e) => {
                            warn!("Error reading {} on CPU {}: {}", channel.map_name(), cpu_id, e);
                            continue;
                        }
                    };

                    if events.lost > 0 {
                        lost.fetch_add(events.lost as u64, Ordering::Relaxed);
                        warn!("Lost {} events on CPU {}", events.lost, cpu_id);
                    }

                    for buf in buffers.iter_mut().take(events.read) {
                        let event = match channel.decode(buf) {
                            Ok(event) => event,
                            Err(e) => {
                                debug!("Dropping undecodable record on CPU {}: {}", cpu_id, e);
                                continue;
                            }
                        };

                        if sender.send(event).await.is_err() {
                            // receiver gone, shutting down
                            return;
                        }
                    }
                }
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{tests::v4_record, LifecycleEvent};
    use tcpexpose_common::constants::*;

    #[tokio::test]
    async fn test_event_processor_creation() {
        let (tx, mut rx) = mpsc::channel(4);
        let processor = EventProcessor::new(tx);

        assert_eq!(processor.lost_events(), 0);

        processor
            .sender
            .send(Channel::V4.decode(&v4_record(EVENT_CONNECTION_CLOSED, 1, 2)).unwrap())
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event, LifecycleEvent::Closed);
    }

    #[test]
    fn channels_name_their_maps() {
        assert_eq!(Channel::V4.map_name(), "EVENTS_V4");
        assert_eq!(Channel::V6.map_name(), "EVENTS_V6");
        assert!(Channel::V6.record_size() > Channel::V4.record_size());
        assert!(Channel::V6.decode(&v4_record(EVENT_CONNECTION_OPENED, 1, 2)).is_err());
    }
}
