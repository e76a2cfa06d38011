//! eBPF program loader
//!
//! Loads the tcpexpose object, writes the daemon settings into its
//! configuration maps and attaches the kprobes.

use crate::config::{ProbeSet, Settings};
use anyhow::{Context, Result};
use aya::{
    maps::{perf::AsyncPerfEventArray, Array, HashMap, MapData, PerCpuArray},
    programs::KProbe,
    Bpf,
};
use log::{debug, info, warn};
use serde::Serialize;
use std::path::PathBuf;
use tcpexpose_common::{constants::*, PipelineConfig, SockLayout, StartRecord};

/// Counters summed across CPUs from the STATS map
#[derive(Serialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct ProbeStats {
    pub connect_events: u64,
    pub state_events: u64,
    pub ack_events: u64,
    pub start_recorded: u64,
    pub table_full: u64,
    pub filtered: u64,
    pub correlation_miss: u64,
    pub opened: u64,
    pub closed: u64,
    pub snapshots: u64,
    pub invalid_sockets: u64,
}

impl ProbeStats {
    fn from_counters(counters: &[u64; MAX_STATS as usize]) -> Self {
        Self {
            connect_events: counters[STAT_CONNECT_EVENTS as usize],
            state_events: counters[STAT_STATE_EVENTS as usize],
            ack_events: counters[STAT_ACK_EVENTS as usize],
            start_recorded: counters[STAT_START_RECORDED as usize],
            table_full: counters[STAT_TABLE_FULL as usize],
            filtered: counters[STAT_FILTERED as usize],
            correlation_miss: counters[STAT_CORRELATION_MISS as usize],
            opened: counters[STAT_OPENED as usize],
            closed: counters[STAT_CLOSED as usize],
            snapshots: counters[STAT_SNAPSHOTS as usize],
            invalid_sockets: counters[STAT_INVALID_SOCKETS as usize],
        }
    }
}

/// eBPF program loader and manager
pub struct ProbeLoader {
    ebpf: Bpf,
}

impl ProbeLoader {
    /// Load eBPF program from file or embedded bytecode
    ///
    /// # Arguments
    ///
    /// * `path` - Optional path to eBPF object file. If None, uses embedded bytecode.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        info!("Loading eBPF program...");

        let ebpf = if let Some(obj_path) = path {
            info!("Loading eBPF object from: {:?}", obj_path);
            let data = std::fs::read(&obj_path)
                .with_context(|| format!("Failed to read eBPF object file: {:?}", obj_path))?;
            Bpf::load(&data).context("Failed to load eBPF program")?
        } else {
            #[cfg(feature = "embedded")]
            {
                info!("Loading embedded eBPF program...");
                let data = include_bytes!(concat!(
                    env!("CARGO_MANIFEST_DIR"),
                    "/../../target/bpfel-unknown-none/release/tcpexpose"
                ));
                Bpf::load(data).context("Failed to load embedded eBPF program")?
            }
            #[cfg(not(feature = "embedded"))]
            {
                anyhow::bail!(
                    "No eBPF object file provided. Use --ebpf-object or compile with 'embedded' feature"
                );
            }
        };

        info!("eBPF program loaded successfully");

        Ok(Self { ebpf })
    }

    /// Write settings into the CONFIG, SOCK_LAYOUT and EXCLUDED_PORTS maps
    pub fn configure(&mut self, settings: &Settings) -> Result<()> {
        let config = settings.pipeline_config();
        let layout = settings.sock_layout()?;

        let mut config_map: Array<_, PipelineConfig> = Array::try_from(
            self.ebpf
                .map_mut("CONFIG")
                .context("CONFIG map not found in eBPF object")?,
        )?;
        config_map
            .set(0, config, 0)
            .context("Failed to write CONFIG map")?;
        debug!("Pipeline config: {:?}", config);

        let mut layout_map: Array<_, SockLayout> = Array::try_from(
            self.ebpf
                .map_mut("SOCK_LAYOUT")
                .context("SOCK_LAYOUT map not found in eBPF object")?,
        )?;
        layout_map
            .set(0, layout, 0)
            .context("Failed to write SOCK_LAYOUT map")?;

        let mut ports: HashMap<_, u16, u8> = HashMap::try_from(
            self.ebpf
                .map_mut("EXCLUDED_PORTS")
                .context("EXCLUDED_PORTS map not found in eBPF object")?,
        )?;
        let stale: Vec<u16> = ports.keys().filter_map(|key| key.ok()).collect();
        for port in stale {
            ports.remove(&port)?;
        }
        for &port in &settings.excluded_ports {
            ports
                .insert(port, 1, 0)
                .with_context(|| format!("Failed to exclude port {}", port))?;
        }

        info!(
            "Configured probes: excluded ports {:?}, layout {:?}, identity tracking {}",
            settings.excluded_ports, settings.layout, settings.track_identity
        );
        Ok(())
    }

    /// Drop every entry of the START correlation table
    ///
    /// # Returns
    ///
    /// Number of entries removed
    pub fn reset_correlation(&mut self) -> Result<usize> {
        let mut start: HashMap<_, u64, StartRecord> = HashMap::try_from(
            self.ebpf
                .map_mut("START")
                .context("START map not found in eBPF object")?,
        )?;

        let handles: Vec<u64> = start.keys().filter_map(|key| key.ok()).collect();
        for handle in &handles {
            start.remove(handle)?;
        }

        debug!("Correlation table reset, {} entries removed", handles.len());
        Ok(handles.len())
    }

    /// Attach the enabled kprobes
    ///
    /// Attaches to:
    /// - tcp_v4_connect, tcp_v6_connect (connect)
    /// - tcp_set_state (state_change)
    /// - tcp_rcv_established (ack)
    pub fn attach(&mut self, probes: &ProbeSet) -> Result<()> {
        info!("Attaching kprobes...");

        if probes.connect {
            let program = self.kprobe("trace_connect")?;
            program
                .attach("tcp_v4_connect", 0)
                .context("Failed to attach tcp_v4_connect kprobe")?;
            info!("  ✓ Attached to tcp_v4_connect");

            // IPv6 may be compiled out of the running kernel
            match program.attach("tcp_v6_connect", 0) {
                Ok(_) => info!("  ✓ Attached to tcp_v6_connect"),
                Err(e) => warn!("  ⚠ Failed to attach tcp_v6_connect (not available on this kernel): {}", e),
            }
        }

        if probes.state_change {
            self.kprobe("trace_tcp_set_state")?
                .attach("tcp_set_state", 0)
                .context("Failed to attach tcp_set_state kprobe")?;
            info!("  ✓ Attached to tcp_set_state");
        }

        if probes.ack {
            self.kprobe("trace_tcp_rcv_established")?
                .attach("tcp_rcv_established", 0)
                .context("Failed to attach tcp_rcv_established kprobe")?;
            info!("  ✓ Attached to tcp_rcv_established");
        }

        info!("All kprobes attached successfully");
        Ok(())
    }

    fn kprobe(&mut self, name: &str) -> Result<&mut KProbe> {
        let program: &mut KProbe = self
            .ebpf
            .program_mut(name)
            .with_context(|| format!("{} program not found in eBPF object", name))?
            .try_into()
            .with_context(|| format!("Failed to get {} as KProbe", name))?;
        program
            .load()
            .with_context(|| format!("Failed to load {}", name))?;
        Ok(program)
    }

    /// Take ownership of one of the output perf arrays
    ///
    /// # Arguments
    ///
    /// * `name` - EVENTS_V4 or EVENTS_V6
    pub fn take_output(&mut self, name: &str) -> Result<AsyncPerfEventArray<MapData>> {
        let map = self
            .ebpf
            .take_map(name)
            .with_context(|| format!("{} map not found in eBPF object", name))?;

        AsyncPerfEventArray::try_from(map)
            .with_context(|| format!("Failed to create AsyncPerfEventArray from {} map", name))
    }

    /// Sum the per-CPU STATS counters
    pub fn read_stats(&self) -> Result<ProbeStats> {
        let stats: PerCpuArray<_, u64> = PerCpuArray::try_from(
            self.ebpf
                .map("STATS")
                .context("STATS map not found in eBPF object")?,
        )?;

        let mut counters = [0u64; MAX_STATS as usize];
        for (index, counter) in counters.iter_mut().enumerate() {
            let values = stats
                .get(&(index as u32), 0)
                .with_context(|| format!("Failed to read STATS[{}]", index))?;
            *counter = values.iter().sum();
        }

        Ok(ProbeStats::from_counters(&counters))
    }
}
