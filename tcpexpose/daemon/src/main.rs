//! tcpexpose - Userspace Program
//!
//! Loads the tcpexpose eBPF program, configures and attaches its kprobes,
//! and streams TCP connection lifecycle events with their throughput,
//! window and RTT counters.
//!
//! ## Usage
//!
//! ```bash
//! # Stream JSON lines to stdout until interrupted
//! sudo ./tcpexpose --ebpf-object path/to/tcpexpose
//!
//! # Text table for 60 seconds, also excluding NFS traffic
//! sudo ./tcpexpose --duration 60 --format text --exclude-port 2049
//!
//! # Settings file plus a run summary
//! sudo ./tcpexpose --config tcpexpose.json --summary summary.json
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use std::{path::PathBuf, pin::pin, time::Duration};
use tcpexpose_userspace::{
    config::{LayoutSetting, Settings},
    events::{Channel, EventProcessor},
    exporter::{open_output, ExporterType, SummaryExporter},
    loader::ProbeLoader,
    tracker::{ConnectionTracker, TrackerSummary},
};
use tokio::{
    signal,
    sync::mpsc,
    time::{interval, sleep, Instant},
};

/// TCP connection lifecycle and metrics probe using eBPF
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// JSON settings file
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Path to eBPF object file (if not embedded)
    #[clap(long)]
    ebpf_object: Option<PathBuf>,

    /// Duration to run the probe (in seconds, 0 = infinite)
    #[clap(short, long, default_value_t = 0)]
    duration: u64,

    /// Event output format
    #[clap(short, long, value_enum, default_value_t = ExporterType::Json)]
    format: ExporterType,

    /// Event output file (stdout if omitted)
    #[clap(short, long)]
    output: Option<PathBuf>,

    /// Write a JSON run summary to this file on shutdown
    #[clap(long)]
    summary: Option<PathBuf>,

    /// Additional port to exclude (repeatable)
    #[clap(long = "exclude-port")]
    exclude_ports: Vec<u16>,

    /// Record layout override
    #[clap(long, value_enum)]
    layout: Option<LayoutSetting>,

    /// Do not correlate events with the connecting process
    #[clap(long)]
    no_identity: bool,

    /// Verbose logging
    #[clap(short, long)]
    verbose: bool,

    /// Progress reporting interval in seconds (0 = off)
    #[clap(long, default_value_t = 10)]
    progress_interval: u64,

    /// Capacity of the queue between perf readers and the exporter
    #[clap(long, default_value_t = 4096)]
    queue_size: usize,
}

impl Args {
    /// Settings file first, then command line overrides
    fn settings(&self) -> Result<Settings> {
        let mut settings = Settings::load(self.config.as_deref())?;

        settings.excluded_ports.extend(self.exclude_ports.iter().copied());
        if let Some(layout) = self.layout {
            settings.layout = layout;
        }
        if self.no_identity {
            settings.track_identity = false;
        }

        settings.validate().context("Invalid settings")?;
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so stdout stays a clean event stream
    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    let settings = args.settings()?;

    info!("Starting tcpexpose...");
    info!(
        "   Duration: {} seconds",
        if args.duration == 0 {
            "infinite".to_string()
        } else {
            args.duration.to_string()
        }
    );
    info!("   Format: {:?}", args.format);
    info!("   Excluded ports: {:?}", settings.excluded_ports);

    let mut loader = ProbeLoader::load(args.ebpf_object.clone())?;
    loader.configure(&settings)?;
    let stale = loader.reset_correlation()?;
    if stale > 0 {
        info!("Dropped {} stale correlation entries", stale);
    }
    loader.attach(&settings.probes)?;

    let (tx, mut rx) = mpsc::channel(args.queue_size.max(1));
    let processor = EventProcessor::new(tx);
    for channel in [Channel::V4, Channel::V6] {
        let perf_array = loader.take_output(channel.map_name())?;
        processor.spawn_cpu_readers(perf_array, channel)?;
    }

    let mut exporter = args.format.exporter(open_output(args.output.as_deref())?);
    let mut tracker = ConnectionTracker::new();

    info!("Collecting events...");

    let start_time = Instant::now();
    let mut deadline = pin!(async {
        match args.duration {
            0 => std::future::pending::<()>().await,
            secs => sleep(Duration::from_secs(secs)).await,
        }
    });
    let mut ticker = interval(Duration::from_secs(args.progress_interval.max(1)));
    ticker.tick().await;

    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                tracker.publish(&event);
                if let Err(e) = exporter.export(&event) {
                    error!("Failed to export event: {:#}", e);
                    break;
                }
            }
            _ = &mut deadline => {
                info!("Duration reached, shutting down...");
                break;
            }
            _ = signal::ctrl_c() => {
                info!("Interrupted, shutting down...");
                break;
            }
            _ = ticker.tick(), if args.progress_interval > 0 => {
                exporter.flush()?;
                info!(
                    "📈 Progress: {} events, {} open connections, {} lost",
                    tracker.event_count(),
                    tracker.open_count(),
                    processor.lost_events()
                );
            }
        }
    }

    exporter.flush()?;

    let summary = tracker.summary(start_time.elapsed().as_secs(), processor.lost_events());
    print_summary(&summary);

    match loader.read_stats() {
        Ok(stats) => info!("Kernel counters: {:?}", stats),
        Err(e) => error!("Failed to read kernel counters: {:#}", e),
    }

    if let Some(path) = &args.summary {
        SummaryExporter::new(path.clone()).export(&summary)?;
        info!("Summary written to {:?}", path);
    }

    Ok(())
}

fn print_summary(summary: &TrackerSummary) {
    info!("");
    info!("============================================");
    info!("             Summary Report");
    info!("============================================");
    info!("");
    info!("  Total events:       {}", summary.total_events);
    info!("    opened:           {}", summary.events.opened);
    info!("    closed:           {}", summary.events.closed);
    info!("    metrics:          {}", summary.events.metrics);
    info!("  Untracked events:   {}", summary.untracked_events);
    info!("  Evicted connections: {}", summary.evicted_connections);
    info!("  Lost events:        {}", summary.lost_events);
    info!("  Open connections:   {}", summary.open_connections.len());
    info!("  Duration:           {} seconds", summary.duration_seconds);
    info!("");
    info!("  Connect latency (μs):");
    info!("    p50:  {:>10.2}", summary.connect_latency_us.p50);
    info!("    p90:  {:>10.2}", summary.connect_latency_us.p90);
    info!("    p99:  {:>10.2}", summary.connect_latency_us.p99);
    info!("");
    info!("============================================");
}
