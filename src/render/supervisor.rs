//! Render supervisor: accepts one chunk at a time from dispatch, drives
//! the agent, emits event files and stdout logs, and reports the outcome.

use std::collections::{BTreeSet, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;

use crate::agent::AgentLink;
use crate::dispatch::ChunkOutcome;
use crate::jobs::{ChunkRange, JobManifest};
use crate::logging::MonitorLog;
use crate::render::messages::{
    AbortMessage, AgentToMonitor, CommandSpec, MonitorToAgent, TaskMessage, TaskOutputDetection,
};
use crate::{now_ms, storage};

struct PendingDispatch {
    manifest: JobManifest,
    chunk: ChunkRange,
}

struct ActiveRender {
    manifest: JobManifest,
    chunk: ChunkRange,
    ack_received: bool,
    progress_pct: f32,
    started: Instant,
    stdout_buffer: Vec<String>,
    /// `<range>_<dispatch_ts>.log`, fixed at dispatch time.
    stdout_log_name: String,
    completed_frames: BTreeSet<i32>,
}

pub struct RenderSupervisor {
    farm_path: PathBuf,
    node_id: String,
    node_os: String,
    log: Arc<MonitorLog>,
    agent: Arc<AgentLink>,

    queue: VecDeque<PendingDispatch>,
    active: Option<ActiveRender>,
    stopped: bool,

    event_seq: u64,
    event_seq_loaded: bool,

    completions: Vec<(String, ChunkRange, ChunkOutcome)>,
}

impl RenderSupervisor {
    pub fn new(
        farm_path: &Path,
        node_id: &str,
        node_os: &str,
        log: Arc<MonitorLog>,
        agent: Arc<AgentLink>,
    ) -> Self {
        log.info("render", format!("Initialized for node {node_id}"));
        Self {
            farm_path: farm_path.to_path_buf(),
            node_id: node_id.to_string(),
            node_os: node_os.to_string(),
            log,
            agent,
            queue: VecDeque::new(),
            active: None,
            stopped: false,
            event_seq: 0,
            event_seq_loaded: false,
            completions: Vec::new(),
        }
    }

    // --- Inputs ---

    pub fn queue_dispatch(&mut self, manifest: JobManifest, chunk: ChunkRange) {
        self.log.info(
            "render",
            format!("Queued dispatch: job={} chunk={}", manifest.job_id, chunk.range_str()),
        );
        self.queue.push_back(PendingDispatch { manifest, chunk });
    }

    /// Drop queued (not yet started) chunks for a job.
    pub fn purge_job(&mut self, job_id: &str) {
        self.queue.retain(|p| p.manifest.job_id != job_id);
    }

    pub fn set_stopped(&mut self, stopped: bool) {
        self.stopped = stopped;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    // --- Tick ---

    /// Start the next queued chunk when idle; detect agent loss mid-render.
    pub fn update(&mut self) {
        if self.active.is_none() {
            if let Some(pending) = self.queue.pop_front() {
                if self.stopped {
                    self.log
                        .info("render", "Stopped - skipping dispatch, abandoning chunk");
                    self.completions.push((
                        pending.manifest.job_id.clone(),
                        pending.chunk,
                        ChunkOutcome::Abandoned,
                    ));
                } else if !self.agent.is_connected() {
                    self.log.warn("render", "Agent not connected, re-queuing dispatch");
                    self.queue.push_front(pending);
                } else {
                    self.log.info(
                        "render",
                        format!(
                            "Starting render: job={} chunk={}",
                            pending.manifest.job_id,
                            pending.chunk.range_str()
                        ),
                    );
                    self.begin_render(pending);
                }
            }
        }

        if self.active.is_some() && !self.agent.is_connected() {
            self.log.error("render", "Agent disconnected during render!");
            self.flush_stdout();
            let chunk = self.active.as_ref().map(|ar| ar.chunk).unwrap_or_default();
            self.emit_event("chunk_failed", &chunk, &chunk.range_str(), json!({"error": "Agent disconnected"}));
            self.fail_active("Agent disconnected during render");
        }
    }

    fn begin_render(&mut self, pending: PendingDispatch) {
        let stdout_log_name = format!("{}_{}.log", pending.chunk.range_str(), now_ms());

        let ar = ActiveRender {
            manifest: pending.manifest,
            chunk: pending.chunk,
            ack_received: false,
            progress_pct: 0.0,
            started: Instant::now(),
            stdout_buffer: Vec::new(),
            stdout_log_name,
            completed_frames: BTreeSet::new(),
        };

        // The renderer cannot create its own output directory on every DCC.
        if let Some(dir) = ar.manifest.output_dir.as_deref().filter(|d| !d.is_empty()) {
            if let Err(e) = std::fs::create_dir_all(dir) {
                self.log
                    .warn("render", format!("Failed to create output dir: {dir} ({e})"));
            }
        }

        let task = build_task(&ar.manifest, &ar.chunk, &self.node_os);
        self.log.info(
            "render",
            format!(
                "Dispatching chunk {} for job {}",
                ar.chunk.range_str(),
                ar.manifest.job_id
            ),
        );

        self.active = Some(ar);
        self.agent.send(MonitorToAgent::Task(task));
    }

    // --- Agent messages ---

    pub fn handle_agent_message(&mut self, msg: AgentToMonitor) {
        if self.active.is_none() {
            self.log
                .warn("render", "Received agent message with no active render, ignoring");
            return;
        }

        match msg {
            AgentToMonitor::Ack(_) => {
                let Some(chunk) = self.active.as_mut().map(|ar| {
                    ar.ack_received = true;
                    ar.started = Instant::now();
                    ar.chunk
                }) else {
                    return;
                };
                self.emit_event("chunk_started", &chunk, &chunk.range_str(), json!({}));
                self.log
                    .info("render", format!("Chunk {} acknowledged", chunk.range_str()));
            }
            AgentToMonitor::Progress(p) => {
                if let Some(ar) = self.active.as_mut() {
                    ar.progress_pct = p.progress_pct;
                }
            }
            AgentToMonitor::Stdout(s) => {
                if let Some(ar) = self.active.as_mut() {
                    ar.stdout_buffer.extend(s.lines);
                }
                self.flush_stdout();
            }
            AgentToMonitor::FrameCompleted(fc) => {
                if fc.frame >= 0 {
                    let Some(job_id) = self.active.as_mut().map(|ar| {
                        ar.completed_frames.insert(fc.frame);
                        ar.manifest.job_id.clone()
                    }) else {
                        return;
                    };
                    let chunk = ChunkRange::new(fc.frame, fc.frame);
                    // Per-frame events carry the single frame number.
                    self.emit_event(
                        "frame_finished",
                        &chunk,
                        &format!("{:06}", fc.frame),
                        json!({}),
                    );
                    self.log.info(
                        "render",
                        format!("Frame {} finished for job {job_id}", fc.frame),
                    );
                }
            }
            AgentToMonitor::Completed(done) => {
                self.flush_stdout();
                let Some((job_id, chunk)) = self
                    .active
                    .as_ref()
                    .map(|ar| (ar.manifest.job_id.clone(), ar.chunk))
                else {
                    return;
                };
                self.emit_event(
                    "chunk_finished",
                    &chunk,
                    &chunk.range_str(),
                    json!({
                        "elapsed_ms": done.elapsed_ms,
                        "exit_code": done.exit_code,
                        "output_file": done.output_file,
                    }),
                );
                self.log.info(
                    "render",
                    format!(
                        "Chunk {} completed for job {job_id} (exit_code={}, elapsed={}ms)",
                        chunk.range_str(),
                        done.exit_code,
                        done.elapsed_ms
                    ),
                );
                self.active = None;
                self.completions.push((job_id, chunk, ChunkOutcome::Completed));
            }
            AgentToMonitor::Failed(failed) => {
                self.flush_stdout();
                let Some(chunk) = self.active.as_ref().map(|ar| ar.chunk) else {
                    return;
                };
                self.emit_event(
                    "chunk_failed",
                    &chunk,
                    &chunk.range_str(),
                    json!({
                        "exit_code": failed.exit_code,
                        "error": failed.error,
                    }),
                );
                self.fail_active(&failed.error);
            }
            // Status and Pong are consumed by the agent link.
            AgentToMonitor::Status(_) | AgentToMonitor::Pong => {}
        }
    }

    // --- Abort ---

    /// Kill the in-flight render (pause, cancel, reassign, force exit).
    pub fn abort_current(&mut self, reason: &str) {
        let Some(ar) = &self.active else {
            return;
        };
        let chunk = ar.chunk;
        let job_id = ar.manifest.job_id.clone();

        self.log.warn(
            "render",
            format!("Aborting render: job={job_id} chunk={} reason={reason}", chunk.range_str()),
        );

        // The agent owns the renderer PID and does the killing.
        self.agent.send(MonitorToAgent::Abort(AbortMessage {
            reason: reason.to_string(),
        }));

        self.flush_stdout();
        self.emit_event("chunk_failed", &chunk, &chunk.range_str(), json!({"error": reason}));
        self.fail_active(reason);
    }

    fn fail_active(&mut self, error: &str) {
        let Some(ar) = self.active.take() else {
            return;
        };
        self.log.error(
            "render",
            format!(
                "Chunk {} FAILED for job {}: {error}",
                ar.chunk.range_str(),
                ar.manifest.job_id
            ),
        );
        self.completions
            .push((ar.manifest.job_id, ar.chunk, ChunkOutcome::Failed));
    }

    // --- Outputs ---

    pub fn take_completions(&mut self) -> Vec<(String, ChunkRange, ChunkOutcome)> {
        std::mem::take(&mut self.completions)
    }

    pub fn is_rendering(&self) -> bool {
        self.active.is_some()
    }

    pub fn current_job_id(&self) -> Option<&str> {
        self.active.as_ref().map(|ar| ar.manifest.job_id.as_str())
    }

    pub fn current_chunk(&self) -> Option<ChunkRange> {
        self.active.as_ref().map(|ar| ar.chunk)
    }

    pub fn current_chunk_label(&self) -> String {
        self.active
            .as_ref()
            .map(|ar| ar.chunk.label())
            .unwrap_or_default()
    }

    pub fn current_progress(&self) -> f32 {
        self.active.as_ref().map_or(0.0, |ar| ar.progress_pct)
    }

    /// True once the agent confirmed the active task.
    pub fn is_acknowledged(&self) -> bool {
        self.active.as_ref().is_some_and(|ar| ar.ack_received)
    }

    pub fn completed_frame_count(&self) -> usize {
        self.active.as_ref().map_or(0, |ar| ar.completed_frames.len())
    }

    pub fn elapsed_secs(&self) -> u64 {
        self.active
            .as_ref()
            .map_or(0, |ar| ar.started.elapsed().as_secs())
    }

    // --- Event files ---

    fn emit_event(
        &mut self,
        event_type: &str,
        chunk: &ChunkRange,
        filename_range: &str,
        extra: serde_json::Value,
    ) {
        let Some(job_id) = self.active.as_ref().map(|ar| ar.manifest.job_id.clone()) else {
            return;
        };
        let events_dir = self
            .farm_path
            .join("jobs")
            .join(&job_id)
            .join("events")
            .join(&self.node_id);
        storage::ensure_dir(&events_dir);

        let seq = self.next_event_seq();

        let mut event = json!({
            "_version": 1,
            "node_id": self.node_id,
            "seq": seq,
            "frame_start": chunk.frame_start,
            "frame_end": chunk.frame_end,
            "type": event_type,
            "timestamp_ms": now_ms(),
        });
        if let (Some(obj), Some(extra)) = (event.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }

        let name = format!("{seq:06}_{event_type}_{filename_range}.json");
        let _ = storage::write_json(&events_dir.join(name), &event);
    }

    /// Event sequence numbers stay monotonic across restarts: the first
    /// emission scans the job's existing event files for the high mark.
    fn next_event_seq(&mut self) -> u64 {
        if !self.event_seq_loaded {
            if let Some(ar) = &self.active {
                let events_dir = self
                    .farm_path
                    .join("jobs")
                    .join(&ar.manifest.job_id)
                    .join("events")
                    .join(&self.node_id);
                if let Ok(entries) = std::fs::read_dir(&events_dir) {
                    for entry in entries.flatten() {
                        let name = entry.file_name().to_string_lossy().to_string();
                        if name.len() >= 6 {
                            if let Ok(s) = name[..6].parse::<u64>() {
                                self.event_seq = self.event_seq.max(s);
                            }
                        }
                    }
                }
            }
            self.event_seq_loaded = true;
        }
        self.event_seq += 1;
        self.event_seq
    }

    // --- Stdout capture ---

    /// Append buffered lines to the chunk's stdout log and flush so peers
    /// can follow through the sync layer.
    fn flush_stdout(&mut self) {
        let Some(ar) = self.active.as_mut() else {
            return;
        };
        if ar.stdout_buffer.is_empty() {
            return;
        }

        let stdout_dir = self
            .farm_path
            .join("jobs")
            .join(&ar.manifest.job_id)
            .join("stdout")
            .join(&self.node_id);
        storage::ensure_dir(&stdout_dir);
        let log_path = stdout_dir.join(&ar.stdout_log_name);

        match std::fs::OpenOptions::new().create(true).append(true).open(&log_path) {
            Ok(mut f) => {
                for line in &ar.stdout_buffer {
                    let _ = writeln!(f, "{line}");
                }
                let _ = f.flush();
                ar.stdout_buffer.clear();
            }
            Err(e) => {
                self.log.error(
                    "render",
                    format!("Failed to open stdout log {}: {e}", log_path.display()),
                );
            }
        }
    }
}

// --- Task construction ---

fn build_task(manifest: &JobManifest, chunk: &ChunkRange, node_os: &str) -> TaskMessage {
    let executable = manifest.cmd_for_os(node_os).unwrap_or("").to_string();

    let mut args = Vec::new();
    for f in &manifest.flags {
        if !f.flag.is_empty() {
            args.push(substitute_tokens(&f.flag, chunk));
        }
        if let Some(value) = &f.value {
            args.push(substitute_tokens(value, chunk));
        }
    }

    let progress = (!manifest.progress.is_empty()).then(|| manifest.progress.clone());
    let output_detection = manifest
        .output_detection
        .stdout_regex
        .as_ref()
        .map(|regex| TaskOutputDetection {
            regex: regex.clone(),
            capture_group: manifest.output_detection.path_group,
        });

    let working_dir = manifest
        .process
        .working_dir
        .as_ref()
        .map(|d| substitute_tokens(d, chunk))
        .filter(|d| !d.is_empty());

    TaskMessage {
        job_id: manifest.job_id.clone(),
        frame_start: chunk.frame_start,
        frame_end: chunk.frame_end,
        command: CommandSpec { executable, args },
        working_dir,
        environment: manifest.environment.clone(),
        progress,
        output_detection,
        timeout_seconds: manifest.timeout_seconds,
    }
}

/// `{frame}` is an alias for `{chunk_start}`; the renderer interprets its
/// own frame padding inside already-resolved output paths.
pub fn substitute_tokens(input: &str, chunk: &ChunkRange) -> String {
    input
        .replace("{frame}", &chunk.frame_start.to_string())
        .replace("{chunk_start}", &chunk.frame_start.to_string())
        .replace("{chunk_end}", &chunk.frame_end.to_string())
}
