//! Node presence records and derived liveness state.

pub mod engine;

pub use engine::HeartbeatEngine;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Active,
    Stopped,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Active => write!(f, "active"),
            NodeState::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderState {
    Idle,
    Rendering,
}

/// On-disk heartbeat schema, written atomically to
/// `nodes/<node_id>/heartbeat.json` and overwritten on every beat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(rename = "_version", default = "default_version")]
    pub version: u32,
    pub node_id: String,
    pub hostname: String,
    pub os: String,
    pub app_version: String,
    pub protocol_version: u32,
    /// Strictly advances on every beat of a live node; peers derive
    /// liveness from this, never from timestamps.
    pub seq: u64,
    pub timestamp_ms: i64,
    pub node_state: NodeState,
    pub render_state: RenderState,
    #[serde(default)]
    pub active_job: Option<String>,
    #[serde(default)]
    pub active_frames: Option<String>,
    pub gpu_name: String,
    pub cpu_cores: u32,
    pub ram_gb: u64,
    pub tags: Vec<String>,
    pub is_coordinator: bool,
}

fn default_version() -> u32 {
    1
}

/// A peer as this node currently understands it: the last heartbeat read
/// plus staleness bookkeeping.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub heartbeat: Heartbeat,
    pub is_local: bool,
    /// Assume dead until the seq proves otherwise.
    pub is_dead: bool,
    /// Consecutive scans with an unchanged seq.
    pub stale_count: u32,
    pub last_seen_seq: u64,
    pub clock_skew_warning: bool,
    pub skew_ms: i64,
    /// Dispatch may repossess this node's chunks. Set one scan after death
    /// so an in-flight completion report still lands first.
    pub reclaim_eligible: bool,
}

impl NodeInfo {
    fn first_seen(heartbeat: Heartbeat, is_local: bool) -> Self {
        let last_seen_seq = heartbeat.seq;
        Self {
            heartbeat,
            is_local,
            is_dead: !is_local,
            stale_count: 0,
            last_seen_seq,
            clock_skew_warning: false,
            skew_ms: 0,
            reclaim_eligible: !is_local,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_activity_serializes_as_null() {
        let hb = Heartbeat {
            version: 1,
            node_id: "aabbccddeeff".to_string(),
            hostname: "render01".to_string(),
            os: "linux".to_string(),
            app_version: "0.1.0".to_string(),
            protocol_version: 1,
            seq: 7,
            timestamp_ms: 1,
            node_state: NodeState::Active,
            render_state: RenderState::Idle,
            active_job: None,
            active_frames: None,
            gpu_name: String::new(),
            cpu_cores: 8,
            ram_gb: 32,
            tags: vec![],
            is_coordinator: false,
        };

        let value = serde_json::to_value(&hb).unwrap();
        assert!(value["active_job"].is_null());
        assert!(value["active_frames"].is_null());
        assert_eq!(value["node_state"], "active");
        assert_eq!(value["render_state"], "idle");
        assert_eq!(value["seq"], 7);
        assert_eq!(value["_version"], 1);
    }

    #[test]
    fn heartbeat_with_nulls_parses() {
        let hb: Heartbeat = serde_json::from_value(serde_json::json!({
            "node_id": "aabbccddeeff",
            "hostname": "render01",
            "os": "linux",
            "app_version": "0.1.0",
            "protocol_version": 1,
            "seq": 3,
            "timestamp_ms": 1700000000000i64,
            "node_state": "active",
            "render_state": "rendering",
            "active_job": "my-shot",
            "active_frames": null,
            "gpu_name": "",
            "cpu_cores": 8,
            "ram_gb": 32,
            "tags": ["gpu"],
            "is_coordinator": true,
        }))
        .unwrap();
        assert_eq!(hb.active_job.as_deref(), Some("my-shot"));
        assert!(hb.active_frames.is_none());
        assert_eq!(hb.render_state, RenderState::Rendering);
    }
}
