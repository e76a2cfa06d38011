//! Daemon settings
//!
//! Settings come from an optional JSON file, then command line overrides.
//! They are validated before anything is loaded into the kernel and turned
//! into the fixed-layout values the eBPF program reads from its maps.

use anyhow::{bail, ensure, Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
};
use tcpexpose_common::{
    constants::*, PipelineConfig, RecordLayout, SockLayout, StartRetention,
};

/// Record layout published by the kernel program
#[derive(Serialize, Deserialize, ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LayoutSetting {
    /// 32-bit addresses for IPv4, 128-bit for IPv6
    PerFamily,
    /// 128-bit addresses for every record
    Unified,
}

/// When a connect-time start record is dropped
#[derive(Serialize, Deserialize, ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetentionSetting {
    UntilEstablished,
    UntilClosed,
}

/// Probe sites to attach
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ProbeSet {
    /// tcp_v4_connect / tcp_v6_connect
    pub connect: bool,
    /// tcp_set_state
    pub state_change: bool,
    /// tcp_rcv_established
    pub ack: bool,
}

impl Default for ProbeSet {
    fn default() -> Self {
        Self {
            connect: true,
            state_change: true,
            ack: true,
        }
    }
}

impl ProbeSet {
    pub fn bits(&self) -> u32 {
        let mut bits = 0;
        if self.connect {
            bits |= PROBE_CONNECT;
        }
        if self.state_change {
            bits |= PROBE_STATE_CHANGE;
        }
        if self.ack {
            bits |= PROBE_ACK;
        }
        bits
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Traffic to or from these ports produces no events
    pub excluded_ports: BTreeSet<u16>,
    pub probes: ProbeSet,
    pub layout: LayoutSetting,
    /// Correlate events with the process that issued the connect
    pub track_identity: bool,
    pub retention: RetentionSetting,
    /// Divide the connect-to-close delta by 100 instead of 1000
    pub legacy_close_delta: bool,
    /// Offset overrides keyed by field name, see [`SockLayout`]
    pub sock_layout: BTreeMap<String, u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            excluded_ports: BTreeSet::from([ADMIN_PORT]),
            probes: ProbeSet::default(),
            layout: LayoutSetting::Unified,
            track_identity: true,
            retention: RetentionSetting::UntilEstablished,
            legacy_close_delta: true,
            sock_layout: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file, or the defaults when no file is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {:?}", path))?;
        Self::from_json(&data).with_context(|| format!("Invalid settings file: {:?}", path))
    }

    pub fn from_json(data: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(data).context("Failed to parse settings")?;
        Ok(settings)
    }

    /// Reject combinations the kernel program cannot honour
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.probes.state_change || self.probes.ack,
            "At least one of the state_change or ack probes must be enabled"
        );
        ensure!(
            !self.track_identity || self.probes.connect,
            "track_identity requires the connect probe"
        );
        ensure!(
            self.excluded_ports.len() <= MAX_EXCLUDED_PORTS as usize,
            "At most {} excluded ports are supported, got {}",
            MAX_EXCLUDED_PORTS,
            self.excluded_ports.len()
        );
        self.sock_layout()?;
        Ok(())
    }

    /// Configuration written to the CONFIG map
    pub fn pipeline_config(&self) -> PipelineConfig {
        let layout = match self.layout {
            LayoutSetting::PerFamily => RecordLayout::PerFamily,
            LayoutSetting::Unified => RecordLayout::Unified,
        };
        let retention = match self.retention {
            RetentionSetting::UntilEstablished => StartRetention::UntilEstablished,
            RetentionSetting::UntilClosed => StartRetention::UntilClosed,
        };

        let mut config = PipelineConfig::DEFAULT
            .with_layout(layout)
            .with_retention(retention);
        config.probes = self.probes.bits();
        config.track_identity = self.track_identity as u32;
        config.legacy_close_delta = self.legacy_close_delta as u32;
        config
    }

    /// Structure offsets written to the SOCK_LAYOUT map
    pub fn sock_layout(&self) -> Result<SockLayout> {
        let mut layout = SockLayout::DEFAULT;
        for (field, &offset) in &self.sock_layout {
            *layout_field(&mut layout, field)? = offset;
        }
        Ok(layout)
    }
}

fn layout_field<'a>(layout: &'a mut SockLayout, field: &str) -> Result<&'a mut u32> {
    let slot = match field {
        "skc_daddr" => &mut layout.skc_daddr,
        "skc_rcv_saddr" => &mut layout.skc_rcv_saddr,
        "skc_dport" => &mut layout.skc_dport,
        "skc_num" => &mut layout.skc_num,
        "skc_family" => &mut layout.skc_family,
        "skc_state" => &mut layout.skc_state,
        "skc_v6_daddr" => &mut layout.skc_v6_daddr,
        "skc_v6_rcv_saddr" => &mut layout.skc_v6_rcv_saddr,
        "bytes_received" => &mut layout.bytes_received,
        "bytes_acked" => &mut layout.bytes_acked,
        "segs_out" => &mut layout.segs_out,
        "segs_in" => &mut layout.segs_in,
        "rcv_tstamp" => &mut layout.rcv_tstamp,
        "lsndtime" => &mut layout.lsndtime,
        "snd_wl1" => &mut layout.snd_wl1,
        "snd_wnd" => &mut layout.snd_wnd,
        "max_window" => &mut layout.max_window,
        "mss_cache" => &mut layout.mss_cache,
        "window_clamp" => &mut layout.window_clamp,
        "rcv_ssthresh" => &mut layout.rcv_ssthresh,
        "packets_out" => &mut layout.packets_out,
        "retrans_out" => &mut layout.retrans_out,
        "max_packets_out" => &mut layout.max_packets_out,
        "max_packets_seq" => &mut layout.max_packets_seq,
        "srtt_us" => &mut layout.srtt_us,
        "mdev_us" => &mut layout.mdev_us,
        "mdev_max_us" => &mut layout.mdev_max_us,
        other => bail!("Unknown sock_layout field: {}", other),
    };
    Ok(slot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_exclude_ssh_and_track_identity() {
        let settings = Settings::default();

        assert_eq!(settings.excluded_ports, BTreeSet::from([22]));
        assert!(settings.track_identity);
        settings.validate().unwrap();

        let config = settings.pipeline_config();
        assert_eq!(config, PipelineConfig::DEFAULT);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let settings = Settings::from_json(
            r#"{
                "excluded_ports": [22, 2049],
                "layout": "per_family",
                "probes": { "ack": false },
                "sock_layout": { "srtt_us": 1800 }
            }"#,
        )
        .unwrap();

        assert_eq!(settings.excluded_ports, BTreeSet::from([22, 2049]));
        assert!(settings.probes.connect);
        assert!(!settings.probes.ack);
        assert_eq!(settings.retention, RetentionSetting::UntilEstablished);

        let config = settings.pipeline_config();
        assert_eq!(config.layout, LAYOUT_PER_FAMILY);
        assert_eq!(config.probes, PROBE_CONNECT | PROBE_STATE_CHANGE);

        let layout = settings.sock_layout().unwrap();
        assert_eq!(layout.srtt_us, 1800);
        assert_eq!(layout.skc_family, SockLayout::DEFAULT.skc_family);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Settings::from_json(r#"{ "excluded_port": [22] }"#).is_err());

        let settings = Settings::from_json(r#"{ "sock_layout": { "srtt": 1 } }"#).unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn identity_tracking_needs_connect_probe() {
        let mut settings = Settings::default();
        settings.probes.connect = false;
        assert!(settings.validate().is_err());

        settings.track_identity = false;
        settings.validate().unwrap();
        assert_eq!(settings.pipeline_config().track_identity, 0);
    }

    #[test]
    fn needs_an_emitting_probe() {
        let mut settings = Settings::default();
        settings.probes.state_change = false;
        settings.probes.ack = false;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn excluded_ports_bounded_by_map_size() {
        let mut settings = Settings::default();
        settings.excluded_ports = (1..=MAX_EXCLUDED_PORTS as u16 + 1).collect();
        assert!(settings.validate().is_err());
    }
}
