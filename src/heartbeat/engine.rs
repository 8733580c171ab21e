//! Heartbeat engine: writes this node's beat on a fixed cadence, scans all
//! peers' heartbeat files, and derives liveness and clock skew.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::config::{APP_VERSION, CLOCK_SKEW_WARN_MS, PROTOCOL_VERSION, TimingConfig};
use crate::identity::NodeIdentity;
use crate::logging::MonitorLog;
use crate::wake::DatagramWake;
use crate::{now_ms, storage};

use super::{Heartbeat, NodeInfo, NodeState, RenderState};

struct State {
    timing: TimingConfig,
    tags: Vec<String>,
    is_coordinator: bool,
    node_state: NodeState,
    render_state: RenderState,
    active_job: String,
    active_frames: String,
    seq: u64,
    nodes: HashMap<String, NodeInfo>,
}

pub struct HeartbeatEngine {
    nodes_dir: PathBuf,
    node_id: String,
    hostname: String,
    os: String,
    gpu_name: String,
    cpu_cores: u32,
    ram_gb: u64,
    log: Arc<MonitorLog>,
    wake: Option<Arc<DatagramWake>>,
    state: Mutex<State>,
    local_clock_skew: AtomicBool,
}

impl HeartbeatEngine {
    pub fn new(
        farm_path: &Path,
        identity: &NodeIdentity,
        timing: TimingConfig,
        tags: Vec<String>,
        is_coordinator: bool,
        log: Arc<MonitorLog>,
        wake: Option<Arc<DatagramWake>>,
    ) -> Arc<Self> {
        let sys = identity.system();
        Arc::new(Self {
            nodes_dir: farm_path.join("nodes"),
            node_id: identity.node_id().to_string(),
            hostname: sys.hostname.clone(),
            os: sys.os.clone(),
            gpu_name: sys.gpu_name.clone(),
            cpu_cores: sys.cpu_cores,
            ram_gb: sys.ram_mb / 1024,
            log,
            wake,
            state: Mutex::new(State {
                timing,
                tags,
                is_coordinator,
                node_state: NodeState::Active,
                render_state: RenderState::Idle,
                active_job: String::new(),
                active_frames: String::new(),
                seq: 0,
                nodes: HashMap::new(),
            }),
            local_clock_skew: AtomicBool::new(false),
        })
    }

    /// Write the first beat and take the first peer scan synchronously, then
    /// hand the cadence to a background worker.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        self.beat_once();
        self.scan_once();

        let timing = self.state.lock().timing;
        self.log.info(
            "health",
            format!(
                "Started (heartbeat={}ms, scan={}ms, dead_scans={})",
                timing.heartbeat_interval_ms, timing.scan_interval_ms, timing.dead_threshold_scans
            ),
        );

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run(cancel).await;
        });
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut last_beat = Instant::now();
        let mut last_scan = Instant::now();

        loop {
            let timing = self.state.lock().timing;
            let beat_every = Duration::from_millis(timing.heartbeat_interval_ms);
            let scan_every = Duration::from_millis(timing.scan_interval_ms);

            if last_beat.elapsed() >= beat_every {
                self.beat_once();
                last_beat = Instant::now();
            }
            if last_scan.elapsed() >= scan_every {
                self.scan_once();
                last_scan = Instant::now();
            }

            let to_beat = beat_every.saturating_sub(last_beat.elapsed());
            let to_scan = scan_every.saturating_sub(last_scan.elapsed());
            let sleep = to_beat.min(to_scan).min(Duration::from_millis(500)).max(Duration::from_millis(10));

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(sleep) => {}
            }
        }
    }

    /// Advance the seq and rewrite this node's heartbeat file.
    pub fn beat_once(&self) {
        let (hb, announce) = {
            let mut state = self.state.lock();
            state.seq += 1;
            let hb = self.build_heartbeat(&state);

            let entry = state
                .nodes
                .entry(self.node_id.clone())
                .or_insert_with(|| NodeInfo::first_seen(hb.clone(), true));
            entry.heartbeat = hb.clone();
            entry.is_local = true;
            entry.is_dead = false;
            entry.reclaim_eligible = false;
            entry.stale_count = 0;
            entry.last_seen_seq = hb.seq;

            (hb, self.wake.clone())
        };

        let path = self.nodes_dir.join(&self.node_id).join("heartbeat.json");
        if storage::write_json(&path, &hb).is_err() {
            self.log
                .error("health", format!("Failed to write heartbeat (seq={})", hb.seq));
        }

        if let Some(wake) = announce {
            wake.announce(&json!({
                "kind": "heartbeat",
                "from": self.node_id,
                "seq": hb.seq,
                "node_state": hb.node_state,
                "render_state": hb.render_state,
            }));
        }
    }

    /// One extra beat with `node_state=stopped`, written synchronously on
    /// shutdown so peers see a clean exit instead of a staleness timeout.
    pub fn write_final_heartbeat(&self) {
        let hb = {
            let mut state = self.state.lock();
            state.seq += 1;
            let mut hb = self.build_heartbeat(&state);
            hb.node_state = NodeState::Stopped;
            hb
        };

        let path = self.nodes_dir.join(&self.node_id).join("heartbeat.json");
        let _ = storage::write_json(&path, &hb);
        self.log.info("health", "Stopped");
    }

    /// Read every peer's heartbeat file, then run the staleness and
    /// clock-skew passes.
    pub fn scan_once(&self) {
        let Ok(entries) = std::fs::read_dir(&self.nodes_dir) else {
            return;
        };

        let mut read: Vec<(String, Heartbeat)> = Vec::new();
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let peer_id = entry.file_name().to_string_lossy().to_string();
            let hb_path = entry.path().join("heartbeat.json");
            if let Some(hb) = storage::read_json::<Heartbeat>(&hb_path) {
                read.push((peer_id, hb));
            }
        }

        let mut state = self.state.lock();
        for (peer_id, hb) in read {
            let is_local = peer_id == self.node_id;
            match state.nodes.entry(peer_id) {
                std::collections::hash_map::Entry::Occupied(mut entry) => {
                    let info = entry.get_mut();
                    info.heartbeat = hb;
                    info.is_local = is_local;
                }
                std::collections::hash_map::Entry::Vacant(entry) => {
                    // Seed last_seen_seq with the current value: an old but
                    // well-formed file must not look live until its seq
                    // advances under our own observation.
                    entry.insert(NodeInfo::first_seen(hb, is_local));
                }
            }
        }

        self.detect_staleness(&mut state);
        self.detect_clock_skew(&mut state);
    }

    fn detect_staleness(&self, state: &mut State) {
        let threshold = state.timing.dead_threshold_scans;
        let mut newly_dead: Vec<String> = Vec::new();

        for (id, info) in state.nodes.iter_mut() {
            if info.is_local {
                continue;
            }

            // A peer that announced its own stop is gone, no grace needed.
            if info.heartbeat.node_state == NodeState::Stopped {
                info.is_dead = true;
                info.reclaim_eligible = true;
                continue;
            }

            if info.heartbeat.seq == info.last_seen_seq {
                info.stale_count += 1;
            } else {
                info.stale_count = 0;
                info.is_dead = false;
                info.reclaim_eligible = false;
            }
            info.last_seen_seq = info.heartbeat.seq;

            if info.stale_count >= threshold {
                if !info.is_dead {
                    info.is_dead = true;
                    // Grace period: chunks become reclaimable one scan later.
                    info.reclaim_eligible = false;
                    newly_dead.push(id.clone());
                } else {
                    info.reclaim_eligible = true;
                }
            }
        }

        for id in newly_dead {
            let stale = state.nodes[&id].stale_count;
            self.log
                .warn("health", format!("Node DEAD: {id} (stale for {stale} scans)"));
        }
    }

    fn detect_clock_skew(&self, state: &mut State) {
        let my_now = now_ms();
        let mut skewed = 0usize;
        let mut alive = 0usize;

        for info in state.nodes.values_mut() {
            if info.is_local || info.is_dead {
                continue;
            }
            alive += 1;
            info.skew_ms = my_now - info.heartbeat.timestamp_ms;
            info.clock_skew_warning = info.skew_ms.abs() > CLOCK_SKEW_WARN_MS;
            if info.clock_skew_warning {
                skewed += 1;
            }
        }

        // If the majority of alive peers look skewed, the outlier is us.
        self.local_clock_skew
            .store(alive > 0 && skewed > alive / 2, Ordering::Relaxed);
    }

    fn build_heartbeat(&self, state: &State) -> Heartbeat {
        Heartbeat {
            version: 1,
            node_id: self.node_id.clone(),
            hostname: self.hostname.clone(),
            os: self.os.clone(),
            app_version: APP_VERSION.to_string(),
            protocol_version: PROTOCOL_VERSION,
            seq: state.seq,
            timestamp_ms: now_ms(),
            node_state: state.node_state,
            render_state: state.render_state,
            active_job: (!state.active_job.is_empty()).then(|| state.active_job.clone()),
            active_frames: (!state.active_frames.is_empty()).then(|| state.active_frames.clone()),
            gpu_name: self.gpu_name.clone(),
            cpu_cores: self.cpu_cores,
            ram_gb: self.ram_gb,
            tags: state.tags.clone(),
            is_coordinator: state.is_coordinator,
        }
    }

    // --- Snapshots and live updates ---

    pub fn node_snapshot(&self) -> Vec<NodeInfo> {
        self.state.lock().nodes.values().cloned().collect()
    }

    pub fn has_local_clock_skew(&self) -> bool {
        self.local_clock_skew.load(Ordering::Relaxed)
    }

    pub fn update_timing(&self, timing: TimingConfig) {
        self.state.lock().timing = timing;
    }

    pub fn set_tags(&self, tags: Vec<String>) {
        self.state.lock().tags = tags;
    }

    pub fn set_is_coordinator(&self, coordinator: bool) {
        self.state.lock().is_coordinator = coordinator;
    }

    pub fn set_node_state(&self, node_state: NodeState) {
        self.state.lock().node_state = node_state;
    }

    /// Picked up by the next beat; peers follow render progress through it.
    pub fn set_render_state(&self, render_state: RenderState, active_job: &str, active_frames: &str) {
        let mut state = self.state.lock();
        state.render_state = render_state;
        state.active_job = active_job.to_string();
        state.active_frames = active_frames.to_string();
    }
}
