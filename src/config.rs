//! Per-node local configuration, stored in the node's app-data directory
//! (never in the farm root).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::storage;

/// Protocol version stamped on `farm.json` and every heartbeat.
pub const PROTOCOL_VERSION: u32 = 1;

/// Peers drifting more than this from the local clock get a skew warning.
pub const CLOCK_SKEW_WARN_MS: i64 = 30_000;

pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", from = "u8")]
pub enum TimingPreset {
    /// Low-latency local network share.
    LocalNas,
    /// Consumer cloud-sync drive (Dropbox, OneDrive, ...).
    CloudFs,
    Custom,
}

impl From<TimingPreset> for u8 {
    fn from(p: TimingPreset) -> u8 {
        match p {
            TimingPreset::LocalNas => 0,
            TimingPreset::CloudFs => 1,
            TimingPreset::Custom => 2,
        }
    }
}

impl From<u8> for TimingPreset {
    fn from(v: u8) -> Self {
        match v {
            0 => TimingPreset::LocalNas,
            1 => TimingPreset::CloudFs,
            _ => TimingPreset::Custom,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    pub heartbeat_interval_ms: u64,
    pub scan_interval_ms: u64,
    pub claim_settle_ms: u64,
    /// Consecutive stale scans before a peer is declared dead.
    pub dead_threshold_scans: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingPreset::LocalNas.timing()
    }
}

impl TimingPreset {
    pub fn timing(self) -> TimingConfig {
        match self {
            // Death at ~9s.
            TimingPreset::LocalNas => TimingConfig {
                heartbeat_interval_ms: 5000,
                scan_interval_ms: 3000,
                claim_settle_ms: 3000,
                dead_threshold_scans: 3,
            },
            // Death at ~20s.
            TimingPreset::CloudFs => TimingConfig {
                heartbeat_interval_ms: 10_000,
                scan_interval_ms: 5000,
                claim_settle_ms: 5000,
                dead_threshold_scans: 4,
            },
            TimingPreset::Custom => TimingConfig {
                heartbeat_interval_ms: 5000,
                scan_interval_ms: 3000,
                claim_settle_ms: 3000,
                dead_threshold_scans: 3,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shared filesystem mount point; the farm root lives underneath it.
    pub sync_root: String,

    pub timing_preset: TimingPreset,
    pub timing: TimingConfig,

    /// Node tags for job targeting.
    pub tags: Vec<String>,

    pub is_coordinator: bool,

    pub auto_start_agent: bool,

    /// Multicast fast path; the filesystem stays authoritative.
    pub udp_enabled: bool,
    pub udp_port: u16,

    // UI preferences, carried so a dashboard sharing this file round-trips.
    pub show_notifications: bool,
    pub font_scale: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sync_root: String::new(),
            timing_preset: TimingPreset::LocalNas,
            timing: TimingPreset::LocalNas.timing(),
            tags: Vec::new(),
            is_coordinator: false,
            auto_start_agent: true,
            udp_enabled: true,
            udp_port: 4242,
            show_notifications: true,
            font_scale: 1.0,
        }
    }
}

impl Config {
    /// Load the config, falling back to defaults when the file is missing
    /// or fails to parse. A broken config must never keep the node from
    /// starting.
    pub fn load(path: &Path) -> Self {
        match storage::read_json::<Config>(path) {
            Some(mut cfg) => {
                if cfg.timing_preset != TimingPreset::Custom {
                    cfg.timing = cfg.timing_preset.timing();
                }
                cfg
            }
            None => {
                tracing::info!(path = %path.display(), "No usable config, using defaults");
                Config::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> crate::Result<()> {
        if let Some(parent) = path.parent() {
            storage::ensure_dir(parent);
        }
        storage::write_json(path, self)
    }

    /// Effective timing: preset values unless the preset is Custom.
    pub fn effective_timing(&self) -> TimingConfig {
        match self.timing_preset {
            TimingPreset::Custom => self.timing,
            preset => preset.timing(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_serialize_as_integers() {
        let mut config = Config::default();
        config.timing_preset = TimingPreset::CloudFs;
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["timing_preset"], 1);

        let back: Config = serde_json::from_value(value).unwrap();
        assert_eq!(back.timing_preset, TimingPreset::CloudFs);
    }

    #[test]
    fn preset_timings_match_the_protocol_tables() {
        let local = TimingPreset::LocalNas.timing();
        assert_eq!(
            (
                local.heartbeat_interval_ms,
                local.scan_interval_ms,
                local.claim_settle_ms,
                local.dead_threshold_scans
            ),
            (5000, 3000, 3000, 3)
        );

        let cloud = TimingPreset::CloudFs.timing();
        assert_eq!(
            (
                cloud.heartbeat_interval_ms,
                cloud.scan_interval_ms,
                cloud.claim_settle_ms,
                cloud.dead_threshold_scans
            ),
            (10_000, 5000, 5000, 4)
        );
    }

    #[test]
    fn load_falls_back_to_defaults_on_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{oops").unwrap();

        let config = Config::load(&path);
        assert_eq!(config.timing_preset, TimingPreset::LocalNas);
        assert!(config.udp_enabled);
        assert_eq!(config.udp_port, 4242);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.sync_root = "/mnt/farm".to_string();
        config.is_coordinator = true;
        config.tags = vec!["gpu".to_string()];
        config.save(&path).unwrap();

        let back = Config::load(&path);
        assert_eq!(back.sync_root, "/mnt/farm");
        assert!(back.is_coordinator);
        assert_eq!(back.tags, vec!["gpu".to_string()]);
    }
}
