//! Node orchestrator: wires every component together and runs the main
//! loop that ticks dispatch and render supervision.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::AgentLink;
use crate::command::{Action, CommandChannel, CommandKind};
use crate::config::Config;
use crate::dispatch::{ChunkOutcome, DispatchEngine};
use crate::farm;
use crate::heartbeat::{HeartbeatEngine, NodeState, RenderState};
use crate::identity::NodeIdentity;
use crate::jobs::{ChunkRange, JobManifest, JobState, JobStore, TemplateStore};
use crate::logging::MonitorLog;
use crate::render::messages::AgentToMonitor;
use crate::render::RenderSupervisor;
use crate::submission::SubmissionIntake;
use crate::wake::DatagramWake;
use crate::{now_ms, storage, FarmError, Result};

const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// A running node with every component started. Ticked from `run`, or
/// manually by tests.
pub struct NodeRuntime {
    pub farm_path: PathBuf,
    app_data_dir: PathBuf,
    config: Config,
    node_id: String,
    hostname: String,

    log: Arc<MonitorLog>,
    heartbeats: Arc<HeartbeatEngine>,
    commands: Arc<CommandChannel>,
    jobs: Arc<JobStore>,
    templates: Arc<TemplateStore>,
    agent: Arc<AgentLink>,
    agent_rx: mpsc::UnboundedReceiver<AgentToMonitor>,
    supervisor: RenderSupervisor,
    dispatch: Option<DispatchEngine>,
    #[allow(dead_code)]
    intake: Option<Arc<SubmissionIntake>>,

    node_stopped: bool,
    /// Worker-side completions waiting for a visible coordinator.
    pending_completions: Vec<(String, ChunkRange, ChunkOutcome)>,
}

impl NodeRuntime {
    /// Bootstrap the farm and start every component. Background workers
    /// stop when `cancel` fires; the caller drives the tick loop.
    pub async fn start(
        config: Config,
        identity: NodeIdentity,
        app_data_dir: PathBuf,
        log: Arc<MonitorLog>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let sync_root = PathBuf::from(&config.sync_root);
        let farm_path = farm::init(&sync_root, identity.node_id(), &log)?;
        log.start_file_logging(&farm_path, identity.node_id());

        let timing = config.effective_timing();
        let node_id = identity.node_id().to_string();
        let os = identity.system().os.clone();
        let hostname = identity.system().hostname.clone();

        let wake = if config.udp_enabled {
            DatagramWake::start(&node_id, config.udp_port, cancel.clone()).await
        } else {
            None
        };

        let heartbeats = HeartbeatEngine::new(
            &farm_path,
            &identity,
            timing,
            config.tags.clone(),
            config.is_coordinator,
            Arc::clone(&log),
            wake.clone(),
        );
        heartbeats.start(cancel.clone());

        let commands = CommandChannel::new(&farm_path, &node_id, Arc::clone(&log), wake.clone());
        commands.start(cancel.clone());

        let jobs = JobStore::new(&farm_path, Arc::clone(&log));
        jobs.start(cancel.clone());

        let templates = TemplateStore::new(&farm_path, Arc::clone(&log));
        templates.start(cancel.clone());

        let (agent, agent_rx) =
            AgentLink::start(&app_data_dir, &node_id, Arc::clone(&log), cancel.clone())?;
        if config.auto_start_agent {
            agent.spawn_agent();
        }

        let supervisor = RenderSupervisor::new(
            &farm_path,
            &node_id,
            &os,
            Arc::clone(&log),
            Arc::clone(&agent),
        );

        let (dispatch, intake) = if config.is_coordinator {
            // Exactly one coordinator per farm; a second one refusing to
            // start beats two of them fighting over dispatch tables. A
            // single scan cannot prove liveness by seq yet, so a peer
            // coordinator counts as present while its heartbeat is younger
            // than the staleness window.
            let liveness_window_ms =
                timing.dead_threshold_scans as i64 * timing.heartbeat_interval_ms as i64 * 2;
            for info in heartbeats.node_snapshot() {
                let recent = now_ms() - info.heartbeat.timestamp_ms < liveness_window_ms;
                if !info.is_local
                    && info.heartbeat.is_coordinator
                    && info.heartbeat.node_state == NodeState::Active
                    && recent
                {
                    log.error(
                        "farm",
                        format!(
                            "Another coordinator is already active: {} ({})",
                            info.heartbeat.hostname, info.heartbeat.node_id
                        ),
                    );
                    return Err(FarmError::CoordinatorConflict {
                        hostname: info.heartbeat.hostname.clone(),
                        node_id: info.heartbeat.node_id.clone(),
                    });
                }
            }

            let dispatch = DispatchEngine::new(
                &farm_path,
                &node_id,
                timing,
                Arc::clone(&log),
                Arc::clone(&commands),
            );

            let intake = SubmissionIntake::new(
                &farm_path,
                &node_id,
                &os,
                Arc::clone(&log),
                Arc::clone(&templates),
                Arc::clone(&jobs),
                wake.clone(),
            );
            intake.start(cancel.clone());

            log.info("farm", "Started as coordinator");
            (Some(dispatch), Some(intake))
        } else {
            log.info("farm", "Started as worker");
            (None, None)
        };

        log.info("farm", format!("Farm started at: {}", farm_path.display()));

        Ok(Self {
            farm_path,
            app_data_dir,
            config,
            node_id,
            hostname,
            log,
            heartbeats,
            commands,
            jobs,
            templates,
            agent,
            agent_rx,
            supervisor,
            dispatch,
            intake,
            node_stopped: false,
            pending_completions: Vec::new(),
        })
    }

    /// Tick loop until shutdown.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(TICK_INTERVAL) => {}
            }
            self.tick();
        }
        self.shutdown().await;
    }

    /// One main-loop iteration. Everything here is synchronous; async
    /// inputs arrive through channels drained at the top.
    pub fn tick(&mut self) {
        while let Ok(msg) = self.agent_rx.try_recv() {
            self.supervisor.handle_agent_message(msg);
        }

        for action in self.commands.pop_actions() {
            self.route_action(action);
        }

        self.check_submit_request();

        if let Some(mut dispatch) = self.dispatch.take() {
            let nodes = self.heartbeats.node_snapshot();
            let jobs = self.jobs.job_snapshot();
            for local in dispatch.tick(&nodes, &jobs) {
                self.supervisor.queue_dispatch(local.manifest, local.chunk);
            }
            self.dispatch = Some(dispatch);
        }

        self.supervisor.update();
        self.route_completions();

        if !self.config.is_coordinator && !self.pending_completions.is_empty() {
            self.flush_pending_completions();
        }

        // Mirror render state into the heartbeat so peers (and the
        // coordinator's stale-assignment check) can see it.
        if self.supervisor.is_rendering() {
            let job = self.supervisor.current_job_id().unwrap_or("").to_string();
            let label = self.supervisor.current_chunk_label();
            self.heartbeats
                .set_render_state(RenderState::Rendering, &job, &label);
        } else {
            self.heartbeats.set_render_state(RenderState::Idle, "", "");
        }
    }

    pub async fn shutdown(mut self) {
        if self.supervisor.is_rendering() {
            self.supervisor.abort_current("Node shutting down");
        }
        self.route_completions();

        if let Some(dispatch) = &mut self.dispatch {
            dispatch.stop();
        }

        self.agent.shutdown().await;
        self.heartbeats.write_final_heartbeat();
        self.log.stop_file_logging();
        self.log.info("farm", "Shutdown complete");
    }

    // --- Command routing ---

    fn route_action(&mut self, action: Action) {
        match action.kind {
            CommandKind::AssignChunk => self.handle_assign_chunk(&action),
            CommandKind::AbortChunk => {
                if self.supervisor.current_job_id() == Some(action.job_id.as_str()) {
                    self.supervisor
                        .abort_current(&format!("Coordinator abort: {}", action.reason));
                }
                self.supervisor.purge_job(&action.job_id);
            }
            CommandKind::ChunkCompleted | CommandKind::ChunkFailed => {
                if let Some(dispatch) = &mut self.dispatch {
                    dispatch.queue_worker_report(action);
                }
            }
            CommandKind::StopJob => {
                if self.supervisor.current_job_id() == Some(action.job_id.as_str()) {
                    self.supervisor
                        .abort_current(&format!("Remote stop: {}", action.reason));
                }
                self.supervisor.purge_job(&action.job_id);
            }
            CommandKind::StopAll => self.set_node_stopped(true),
            CommandKind::ResumeAll => self.set_node_stopped(false),
        }
    }

    fn handle_assign_chunk(&mut self, action: &Action) {
        if self.supervisor.is_rendering() {
            // Already busy; the coordinator's view was stale.
            self.report_to_coordinator(
                &action.job_id,
                ChunkRange::new(action.frame_start, action.frame_end),
                CommandKind::ChunkFailed,
                "worker_busy",
            );
            return;
        }

        let manifest_path = self
            .farm_path
            .join("jobs")
            .join(&action.job_id)
            .join("manifest.json");
        let Some(manifest) = storage::read_json::<JobManifest>(&manifest_path) else {
            self.log.error(
                "farm",
                format!("Can't read manifest for assigned job: {}", action.job_id),
            );
            self.report_to_coordinator(
                &action.job_id,
                ChunkRange::new(action.frame_start, action.frame_end),
                CommandKind::ChunkFailed,
                "manifest_read_failed",
            );
            return;
        };

        let chunk = ChunkRange::new(action.frame_start, action.frame_end);
        self.log.info(
            "farm",
            format!("Accepted assignment: job={} chunk={}", action.job_id, chunk.range_str()),
        );
        self.supervisor.queue_dispatch(manifest, chunk);
    }

    // --- Completion routing ---

    fn route_completions(&mut self) {
        for (job_id, chunk, outcome) in self.supervisor.take_completions() {
            if let Some(dispatch) = &mut self.dispatch {
                dispatch.queue_local_completion(&job_id, chunk, outcome);
            } else {
                let kind = if outcome == ChunkOutcome::Completed {
                    CommandKind::ChunkCompleted
                } else {
                    CommandKind::ChunkFailed
                };
                match self.find_coordinator() {
                    Some(coord) => {
                        self.commands.send_command(
                            &coord,
                            kind,
                            &job_id,
                            &outcome_reason(outcome),
                            chunk.frame_start,
                            chunk.frame_end,
                        );
                    }
                    None => {
                        self.log.warn(
                            "farm",
                            "No coordinator found, buffering completion for retry",
                        );
                        self.pending_completions.push((job_id, chunk, outcome));
                    }
                }
            }
        }
    }

    fn flush_pending_completions(&mut self) {
        let Some(coord) = self.find_coordinator() else {
            return;
        };
        let pending = std::mem::take(&mut self.pending_completions);
        let count = pending.len();
        for (job_id, chunk, outcome) in pending {
            let kind = if outcome == ChunkOutcome::Completed {
                CommandKind::ChunkCompleted
            } else {
                CommandKind::ChunkFailed
            };
            self.commands.send_command(
                &coord,
                kind,
                &job_id,
                &outcome_reason(outcome),
                chunk.frame_start,
                chunk.frame_end,
            );
        }
        self.log.info(
            "farm",
            format!("Flushed {count} buffered completion(s) to coordinator"),
        );
    }

    fn find_coordinator(&self) -> Option<String> {
        self.heartbeats
            .node_snapshot()
            .into_iter()
            .find(|n| !n.is_dead && n.heartbeat.is_coordinator)
            .map(|n| n.heartbeat.node_id)
    }

    // --- Node state ---

    pub fn set_node_stopped(&mut self, stopped: bool) {
        self.node_stopped = stopped;
        if stopped {
            if self.supervisor.is_rendering() {
                self.supervisor.abort_current("Node stopped");
            }
            self.supervisor.set_stopped(true);
            if let Some(dispatch) = &mut self.dispatch {
                dispatch.set_node_active(false);
            }
            self.heartbeats.set_node_state(NodeState::Stopped);
            self.log.info("farm", "Node state: Stopped");
        } else {
            self.supervisor.set_stopped(false);
            if let Some(dispatch) = &mut self.dispatch {
                dispatch.set_node_active(true);
            }
            self.heartbeats.set_node_state(NodeState::Active);
            self.log.info("farm", "Node state: Active");
        }
    }

    pub fn is_node_stopped(&self) -> bool {
        self.node_stopped
    }

    // --- Job controls ---

    fn current_priority(&self, job_id: &str) -> i32 {
        self.jobs
            .job_snapshot()
            .iter()
            .find(|j| j.manifest.job_id == job_id)
            .map_or(50, |j| j.current_priority)
    }

    pub fn pause_job(&mut self, job_id: &str) {
        let priority = self.current_priority(job_id);
        let _ = self
            .jobs
            .write_state_entry(job_id, JobState::Paused, priority, &self.node_id);

        if self.supervisor.current_job_id() == Some(job_id) {
            self.supervisor.abort_current("Job paused");
        }
        self.supervisor.purge_job(job_id);
        self.route_completions();

        if let Some(dispatch) = &mut self.dispatch {
            dispatch.handle_job_state_change(job_id, JobState::Paused, &self.jobs.job_snapshot());
        }

        self.notify_peers(CommandKind::StopJob, job_id, "user_request");
        self.log.info("job", format!("Paused job: {job_id}"));
    }

    pub fn resume_job(&mut self, job_id: &str) {
        let priority = self.current_priority(job_id);
        let _ = self
            .jobs
            .write_state_entry(job_id, JobState::Active, priority, &self.node_id);
        self.jobs.scan_once();

        if let Some(dispatch) = &mut self.dispatch {
            dispatch.handle_job_state_change(job_id, JobState::Active, &self.jobs.job_snapshot());
        }
        self.log.info("job", format!("Resumed job: {job_id}"));
    }

    pub fn cancel_job(&mut self, job_id: &str) {
        let _ = self
            .jobs
            .write_state_entry(job_id, JobState::Cancelled, 0, &self.node_id);

        if self.supervisor.current_job_id() == Some(job_id) {
            self.supervisor.abort_current("Job cancelled");
        }
        self.supervisor.purge_job(job_id);
        self.route_completions();

        if let Some(dispatch) = &mut self.dispatch {
            dispatch.handle_job_state_change(job_id, JobState::Cancelled, &self.jobs.job_snapshot());
        }

        self.notify_peers(CommandKind::StopJob, job_id, "job_cancelled");
        self.log.info("job", format!("Cancelled job: {job_id}"));
    }

    pub fn delete_job(&mut self, job_id: &str) {
        self.cancel_job(job_id);
        if let Err(e) = self.jobs.delete_job(job_id) {
            self.log.error("job", format!("Failed to delete job dir: {e}"));
        }
    }

    pub fn requeue_job(&mut self, job_id: &str) -> Option<String> {
        match self.jobs.requeue_job(job_id, &self.node_id) {
            Ok(slug) => Some(slug),
            Err(e) => {
                self.log.error("job", format!("Failed to requeue job {job_id}: {e}"));
                None
            }
        }
    }

    pub fn reassign_chunk(&mut self, job_id: &str, frame_start: i32, frame_end: i32) {
        if let Some(dispatch) = &mut self.dispatch {
            dispatch.reassign_chunk(job_id, frame_start, frame_end);
        }
    }

    pub fn retry_failed_chunk(&mut self, job_id: &str, frame_start: i32, frame_end: i32) {
        if let Some(dispatch) = &mut self.dispatch {
            dispatch.retry_failed_chunk(job_id, frame_start, frame_end);
        }
    }

    fn notify_peers(&self, kind: CommandKind, job_id: &str, reason: &str) {
        for info in self.heartbeats.node_snapshot() {
            if info.is_local || info.is_dead {
                continue;
            }
            self.commands
                .send_command(&info.heartbeat.node_id, kind, job_id, reason, 0, 0);
        }
    }

    fn report_to_coordinator(
        &self,
        job_id: &str,
        chunk: ChunkRange,
        kind: CommandKind,
        reason: &str,
    ) {
        if let Some(coord) = self.find_coordinator() {
            self.commands
                .send_command(&coord, kind, job_id, reason, chunk.frame_start, chunk.frame_end);
        }
    }

    // --- Single-shot CLI submission hand-off ---

    /// A second process invocation drops `submit_request.json` into the
    /// app-data directory; convert it into a farm submission file.
    fn check_submit_request(&mut self) {
        let request_path = self.app_data_dir.join("submit_request.json");
        if !request_path.exists() {
            return;
        }

        let value = storage::read_json_value(&request_path);
        // Delete immediately to prevent re-processing.
        let _ = std::fs::remove_file(&request_path);

        let Some(value) = value else {
            return;
        };
        let file = value.get("file").and_then(|v| v.as_str()).unwrap_or("");
        let template_id = value
            .get("template_id")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if file.is_empty() {
            return;
        }

        self.log
            .info("farm", format!("Submit request received via CLI: {file}"));
        self.submit_file(file, template_id);
    }

    /// Write a submission for `file` into the farm's submissions inbox,
    /// targeting `template_id` (or the only template with a file flag).
    pub fn submit_file(&self, file: &str, template_id: &str) {
        let templates = self.templates.template_snapshot();
        let tmpl = if template_id.is_empty() {
            templates
                .iter()
                .find(|t| t.valid && t.flags.iter().any(|f| f.flag_type == "file"))
        } else {
            templates
                .iter()
                .find(|t| t.valid && t.template_id == template_id)
        };
        let Some(tmpl) = tmpl else {
            self.log.error(
                "farm",
                format!("No usable template for CLI submission (template_id={template_id:?})"),
            );
            return;
        };

        let Some(file_flag_id) = tmpl
            .flags
            .iter()
            .find(|f| f.flag_type == "file" && !f.id.is_empty())
            .map(|f| f.id.clone())
        else {
            self.log.error(
                "farm",
                format!("Template {} has no file flag for CLI submission", tmpl.template_id),
            );
            return;
        };

        let job_name = Path::new(file)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "cli-submit".to_string());

        let submission = json!({
            "template_id": tmpl.template_id,
            "job_name": job_name,
            "submitted_by_host": self.hostname,
            "overrides": { file_flag_id: file },
        });

        let name = format!("{}.{}.json", now_ms(), self.hostname);
        let path = self.farm_path.join("submissions").join(name);
        match storage::write_json(&path, &submission) {
            Ok(()) => self.log.info("farm", format!("Submission written: {}", path.display())),
            Err(e) => self.log.error("farm", format!("Failed to write submission: {e}")),
        }
    }

    // --- Component access (dashboard surface and tests) ---

    pub fn heartbeats(&self) -> &Arc<HeartbeatEngine> {
        &self.heartbeats
    }

    pub fn commands(&self) -> &Arc<CommandChannel> {
        &self.commands
    }

    pub fn jobs(&self) -> &Arc<JobStore> {
        &self.jobs
    }

    pub fn templates(&self) -> &Arc<TemplateStore> {
        &self.templates
    }

    pub fn supervisor_mut(&mut self) -> &mut RenderSupervisor {
        &mut self.supervisor
    }

    pub fn dispatch_mut(&mut self) -> Option<&mut DispatchEngine> {
        self.dispatch.as_mut()
    }

    pub fn log(&self) -> &Arc<MonitorLog> {
        &self.log
    }
}

fn outcome_reason(outcome: ChunkOutcome) -> String {
    match outcome {
        ChunkOutcome::Completed => "completed".to_string(),
        ChunkOutcome::Failed => "failed".to_string(),
        ChunkOutcome::Abandoned => "abandoned".to_string(),
    }
}
