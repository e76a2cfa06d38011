//! Event exporters
//!
//! Decoded events are streamed as JSON lines or as a text table; the run
//! summary is written once at shutdown.

use crate::{tracker::TrackerSummary, types::DecodedEvent};
use anyhow::{Context, Result};
use clap::ValueEnum;
use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

/// Trait for per-event exporters
pub trait EventExporter {
    /// Export one event
    fn export(&mut self, event: &DecodedEvent) -> Result<()>;

    /// Flush buffered output
    fn flush(&mut self) -> Result<()>;
}

/// Export format type
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExporterType {
    /// One JSON object per line
    Json,
    /// Column-aligned text table
    Text,
}

impl ExporterType {
    pub fn exporter(self, out: Box<dyn Write + Send>) -> Box<dyn EventExporter + Send> {
        match self {
            ExporterType::Json => Box::new(JsonLinesExporter::new(out)),
            ExporterType::Text => Box::new(TextExporter::new(out)),
        }
    }
}

/// Open the event output, stdout when no path is given
pub fn open_output(path: Option<&Path>) -> Result<Box<dyn Write + Send>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create output file: {:?}", path))?;
            Ok(Box::new(BufWriter::new(file)))
        }
        None => Ok(Box::new(io::stdout())),
    }
}

/// JSON lines exporter
pub struct JsonLinesExporter<W: Write> {
    out: W,
}

impl<W: Write> JsonLinesExporter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write> EventExporter for JsonLinesExporter<W> {
    fn export(&mut self, event: &DecodedEvent) -> Result<()> {
        serde_json::to_writer(&mut self.out, event)?;
        self.out.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// Text table exporter
pub struct TextExporter<W: Write> {
    out: W,
    header_written: bool,
}

impl<W: Write> TextExporter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            header_written: false,
        }
    }
}

impl<W: Write> EventExporter for TextExporter<W> {
    fn export(&mut self, event: &DecodedEvent) -> Result<()> {
        if !self.header_written {
            writeln!(
                self.out,
                "{:<8} {:<6} {:<12} {:<2} {:<39} {:<39} {:<5} {}",
                "EVENT", "PID", "COMM", "IP", "SADDR", "DADDR", "DPORT", "LAT(ms)"
            )?;
            self.header_written = true;
        }

        writeln!(
            self.out,
            "{:<8} {:<6} {:<12.12} {:<2} {:<39} {:<39} {:<5} {:.2}",
            event.event.label(),
            event.pid,
            event.comm,
            event.ip_version(),
            event.saddr.to_string(),
            event.daddr.to_string(),
            event.dport,
            event.delta_us as f64 / 1000.0
        )?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// Writes the run summary as pretty JSON
pub struct SummaryExporter {
    output_path: PathBuf,
}

impl SummaryExporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self { output_path }
    }

    pub fn export(&self, summary: &TrackerSummary) -> Result<()> {
        let json = serde_json::to_string_pretty(summary)?;

        let mut file = File::create(&self.output_path)
            .with_context(|| format!("Failed to create summary file: {:?}", self.output_path))?;
        file.write_all(json.as_bytes())
            .with_context(|| format!("Failed to write summary file: {:?}", self.output_path))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        tracker::ConnectionTracker,
        types::{decode_v4, tests::v4_record, LifecycleEvent},
    };
    use tcpexpose_common::constants::*;

    fn opened() -> DecodedEvent {
        decode_v4(&v4_record(EVENT_CONNECTION_OPENED, 51000, 443)).unwrap()
    }

    #[test]
    fn json_lines_round_trip() {
        let mut buf = Vec::new();
        {
            let mut exporter = JsonLinesExporter::new(&mut buf);
            exporter.export(&opened()).unwrap();
            exporter.export(&opened()).unwrap();
            exporter.flush().unwrap();
        }

        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: DecodedEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.event, LifecycleEvent::Opened);
        assert_eq!(parsed.dport, 443);
        assert!(lines[0].contains("\"event\":\"opened\""));
    }

    #[test]
    fn text_table_has_header_once() {
        let mut buf = Vec::new();
        {
            let mut exporter = TextExporter::new(&mut buf);
            exporter.export(&opened()).unwrap();
            exporter.export(&opened()).unwrap();
        }

        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("EVENT"));
        assert!(lines[0].ends_with("LAT(ms)"));
        assert!(lines[1].starts_with("OPEN"));
        assert!(lines[1].contains("curl"));
        assert!(lines[1].contains("93.184.216.34"));
        assert!(lines[1].ends_with("1.50"));
    }

    #[test]
    fn summary_written_as_json() {
        let mut tracker = ConnectionTracker::new();
        tracker.publish(&opened());

        let path = std::env::temp_dir().join(format!("tcpexpose-summary-{}.json", std::process::id()));
        SummaryExporter::new(path.clone())
            .export(&tracker.summary(5, 0))
            .unwrap();

        let data = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).ok();
        let value: serde_json::Value = serde_json::from_str(&data).unwrap();
        assert_eq!(value["total_events"], 1);
        assert_eq!(value["open_connections"].as_array().unwrap().len(), 1);
    }
}
