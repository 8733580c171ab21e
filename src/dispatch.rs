//! Coordinator dispatch engine.
//!
//! Owns the per-job chunk tables, assigns pending chunks to idle workers,
//! reclaims assignments from dead or stalled workers, and declares jobs
//! complete. Runs synchronously on the node's main-loop tick; asynchronous
//! inputs (local render outcomes, worker reports) arrive through internal
//! queues. The engine never touches a render supervisor directly: local
//! work is returned from `tick` for the caller to queue, remote work goes
//! out as `assign_chunk` commands.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::command::{Action, CommandChannel, CommandKind};
use crate::config::TimingConfig;
use crate::heartbeat::{NodeInfo, NodeState, RenderState};
use crate::jobs::{
    ChunkRange, ChunkState, DispatchTable, JobInfo, JobManifest, JobState, JobStateEntry,
};
use crate::logging::MonitorLog;
use crate::{now_ms, storage};

const WRITE_THROTTLE_MS: u64 = 2000;

/// What became of a dispatched chunk, as reported by a render supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    Completed,
    Failed,
    /// Never started (node stopped before dispatch); reverts without
    /// costing a retry.
    Abandoned,
}

/// Chunk handed to the local render supervisor by the caller of `tick`.
#[derive(Debug, Clone)]
pub struct LocalDispatch {
    pub manifest: JobManifest,
    pub chunk: ChunkRange,
}

#[derive(Debug, Clone)]
struct Assignment {
    job_id: String,
    chunk: ChunkRange,
    assigned_at_ms: i64,
}

pub struct DispatchEngine {
    farm_path: PathBuf,
    node_id: String,
    timing: TimingConfig,
    node_active: bool,
    recovered: bool,

    log: Arc<MonitorLog>,
    commands: Arc<CommandChannel>,

    /// nodeId -> in-flight assignment, mirroring each `assigned` chunk.
    assignments: HashMap<String, Assignment>,
    tables: HashMap<String, DispatchTable>,
    dirty: HashSet<String>,
    completion_written: HashSet<String>,

    local_completions: VecDeque<(String, ChunkRange, ChunkOutcome)>,
    worker_reports: VecDeque<Action>,

    last_write: Option<Instant>,
}

impl DispatchEngine {
    pub fn new(
        farm_path: &Path,
        node_id: &str,
        timing: TimingConfig,
        log: Arc<MonitorLog>,
        commands: Arc<CommandChannel>,
    ) -> Self {
        log.info("dispatch", "Started as coordinator");
        Self {
            farm_path: farm_path.to_path_buf(),
            node_id: node_id.to_string(),
            timing,
            node_active: true,
            recovered: false,
            log,
            commands,
            assignments: HashMap::new(),
            tables: HashMap::new(),
            dirty: HashSet::new(),
            completion_written: HashSet::new(),
            local_completions: VecDeque::new(),
            worker_reports: VecDeque::new(),
            last_write: None,
        }
    }

    // --- Inbound queues ---

    pub fn queue_local_completion(&mut self, job_id: &str, chunk: ChunkRange, outcome: ChunkOutcome) {
        self.local_completions
            .push_back((job_id.to_string(), chunk, outcome));
    }

    /// Route a worker report (`chunk_completed` / `chunk_failed`) parsed
    /// from the command channel.
    pub fn queue_worker_report(&mut self, action: Action) {
        if matches!(action.kind, CommandKind::ChunkCompleted | CommandKind::ChunkFailed) {
            self.worker_reports.push_back(action);
        }
    }

    // --- Live config ---

    pub fn update_timing(&mut self, timing: TimingConfig) {
        self.timing = timing;
    }

    pub fn set_node_active(&mut self, active: bool) {
        self.node_active = active;
    }

    // --- Main cycle ---

    /// One dispatch cycle. Steps always run in this order; returns the
    /// chunks assigned to this node for the caller to queue locally.
    pub fn tick(&mut self, nodes: &[NodeInfo], jobs: &[JobInfo]) -> Vec<LocalDispatch> {
        if !self.recovered {
            self.recover_from_disk(nodes, jobs);
            self.recovered = true;
        }

        for job in jobs {
            if job.current_state == JobState::Active && !self.tables.contains_key(&job.manifest.job_id)
            {
                self.init_table(&job.manifest);
            }
        }

        self.process_local_completions(jobs);
        self.process_worker_reports(jobs);
        self.detect_stale_assignments(nodes, jobs);
        self.check_job_completions(jobs);

        let local = if self.node_active {
            self.assign_work(nodes, jobs)
        } else {
            Vec::new()
        };

        self.write_dirty_tables(false);
        local
    }

    /// Flush anything dirty and stop. Tables are recovered from disk on the
    /// next coordinator start.
    pub fn stop(&mut self) {
        self.write_dirty_tables(true);
        self.log.info("dispatch", "Stopped");
    }

    fn init_table(&mut self, manifest: &JobManifest) {
        let table = DispatchTable::for_manifest(&self.node_id, manifest, now_ms());
        self.log.info(
            "dispatch",
            format!(
                "Init dispatch table: job={} chunks={}",
                manifest.job_id,
                table.chunks.len()
            ),
        );
        self.tables.insert(manifest.job_id.clone(), table);
        self.dirty.insert(manifest.job_id.clone());
    }

    fn max_retries_for(jobs: &[JobInfo], job_id: &str) -> u32 {
        jobs.iter()
            .find(|j| j.manifest.job_id == job_id)
            .map(|j| j.manifest.max_retries)
            .unwrap_or(3)
    }

    /// The single chunk-transition point: local outcomes, worker reports,
    /// and stale reclaims all pass through here so self-dispatch failures
    /// behave exactly like remote ones.
    fn apply_chunk_outcome(
        table: &mut DispatchTable,
        chunk: &ChunkRange,
        outcome: ChunkOutcome,
        max_retries: u32,
    ) -> bool {
        let Some(c) = table.chunk_mut(chunk) else {
            return false;
        };

        match outcome {
            ChunkOutcome::Completed => {
                c.state = ChunkState::Completed;
                c.completed_at_ms = now_ms();
            }
            ChunkOutcome::Failed => {
                c.retry_count += 1;
                if c.retry_count >= max_retries {
                    c.state = ChunkState::Failed;
                    c.assigned_to.clear();
                    c.assigned_at_ms = 0;
                } else {
                    c.revert_to_pending();
                }
            }
            ChunkOutcome::Abandoned => {
                c.revert_to_pending();
            }
        }
        true
    }

    fn process_local_completions(&mut self, jobs: &[JobInfo]) {
        while let Some((job_id, chunk, outcome)) = self.local_completions.pop_front() {
            let max_retries = Self::max_retries_for(jobs, &job_id);
            if let Some(table) = self.tables.get_mut(&job_id) {
                if Self::apply_chunk_outcome(table, &chunk, outcome, max_retries) {
                    self.dirty.insert(job_id.clone());
                }
            }

            if self
                .assignments
                .get(&self.node_id)
                .is_some_and(|a| a.job_id == job_id)
            {
                self.assignments.remove(&self.node_id);
            }

            self.log.info(
                "dispatch",
                format!("Local {outcome:?}: job={job_id} chunk={}", chunk.range_str()),
            );
        }
    }

    fn process_worker_reports(&mut self, jobs: &[JobInfo]) {
        while let Some(action) = self.worker_reports.pop_front() {
            let chunk = ChunkRange::new(action.frame_start, action.frame_end);
            let outcome = if action.kind == CommandKind::ChunkCompleted {
                ChunkOutcome::Completed
            } else {
                ChunkOutcome::Failed
            };

            let max_retries = Self::max_retries_for(jobs, &action.job_id);
            if let Some(table) = self.tables.get_mut(&action.job_id) {
                if Self::apply_chunk_outcome(table, &chunk, outcome, max_retries) {
                    self.dirty.insert(action.job_id.clone());
                }
            }

            if self
                .assignments
                .get(&action.from_node_id)
                .is_some_and(|a| a.job_id == action.job_id)
            {
                self.assignments.remove(&action.from_node_id);
            }

            self.log.info(
                "dispatch",
                format!("Worker {} from {}: job={}", action.kind, action.from_node_id, action.job_id),
            );
        }
    }

    fn is_node_dead(node_id: &str, nodes: &[NodeInfo]) -> bool {
        nodes
            .iter()
            .find(|n| n.heartbeat.node_id == node_id)
            .map_or(true, |n| n.is_dead && n.reclaim_eligible)
    }

    fn detect_stale_assignments(&mut self, nodes: &[NodeInfo], jobs: &[JobInfo]) {
        let now = now_ms();

        // Generous window: command propagation + inbox poll + render start.
        let stale_ms = (self.timing.dead_threshold_scans as i64
            * self.timing.heartbeat_interval_ms as i64
            * 2)
        .max(60_000);

        let mut reclaim: Vec<String> = Vec::new();
        for (node_id, assignment) in &self.assignments {
            if *node_id == self.node_id {
                continue;
            }

            if Self::is_node_dead(node_id, nodes) {
                reclaim.push(node_id.clone());
                continue;
            }

            let age = now - assignment.assigned_at_ms;
            if age > stale_ms {
                let rendering_this_job = nodes
                    .iter()
                    .find(|n| n.heartbeat.node_id == *node_id)
                    .is_some_and(|n| {
                        n.heartbeat.render_state == RenderState::Rendering
                            && n.heartbeat.active_job.as_deref() == Some(assignment.job_id.as_str())
                    });

                if !rendering_this_job {
                    self.log.warn(
                        "dispatch",
                        format!(
                            "Stale assignment to {node_id} chunk={} job={} (age={}s, worker not rendering)",
                            assignment.chunk.range_str(),
                            assignment.job_id,
                            age / 1000
                        ),
                    );
                    reclaim.push(node_id.clone());
                }
            }
        }

        for node_id in reclaim {
            let Some(assignment) = self.assignments.remove(&node_id) else {
                continue;
            };
            let max_retries = Self::max_retries_for(jobs, &assignment.job_id);
            if let Some(table) = self.tables.get_mut(&assignment.job_id) {
                let assigned = table
                    .chunk_mut(&assignment.chunk)
                    .is_some_and(|c| c.state == ChunkState::Assigned);
                if assigned
                    && Self::apply_chunk_outcome(
                        table,
                        &assignment.chunk,
                        ChunkOutcome::Failed,
                        max_retries,
                    )
                {
                    self.dirty.insert(assignment.job_id.clone());
                    self.log.warn(
                        "dispatch",
                        format!(
                            "Reassigning chunk {} from {node_id} for job {}",
                            assignment.chunk.range_str(),
                            assignment.job_id
                        ),
                    );
                }
            }
        }
    }

    fn check_job_completions(&mut self, jobs: &[JobInfo]) {
        for job in jobs {
            if job.current_state != JobState::Active {
                continue;
            }
            let job_id = &job.manifest.job_id;
            if self.completion_written.contains(job_id) {
                continue;
            }
            let Some(table) = self.tables.get(job_id) else {
                continue;
            };
            if !table.all_completed() {
                continue;
            }

            let ts = now_ms();
            let entry = JobStateEntry {
                version: 1,
                state: JobState::Completed,
                priority: 0,
                node_id: self.node_id.clone(),
                timestamp_ms: ts,
            };
            let state_dir = self.farm_path.join("jobs").join(job_id).join("state");
            storage::ensure_dir(&state_dir);
            let name = format!("{ts}_{}.json", self.node_id);
            if storage::write_json(&state_dir.join(name), &entry).is_ok() {
                self.completion_written.insert(job_id.clone());
                self.log.info("dispatch", format!("JOB COMPLETED: {job_id}"));
            }
        }
    }

    fn assign_work(&mut self, nodes: &[NodeInfo], jobs: &[JobInfo]) -> Vec<LocalDispatch> {
        let mut local = Vec::new();

        let idle_workers: Vec<&NodeInfo> = nodes
            .iter()
            .filter(|n| {
                !n.is_dead
                    && n.heartbeat.node_state == NodeState::Active
                    && n.heartbeat.render_state == RenderState::Idle
                    && !self.assignments.contains_key(&n.heartbeat.node_id)
            })
            .collect();
        if idle_workers.is_empty() {
            return local;
        }

        let mut active_jobs: Vec<&JobInfo> = jobs
            .iter()
            .filter(|j| j.current_state == JobState::Active)
            .collect();
        active_jobs.sort_by(|a, b| b.current_priority.cmp(&a.current_priority));

        for worker in idle_workers {
            let worker_id = &worker.heartbeat.node_id;
            let worker_os = &worker.heartbeat.os;
            let worker_tags = &worker.heartbeat.tags;

            for job in &active_jobs {
                let job_id = &job.manifest.job_id;

                if job.manifest.cmd_for_os(worker_os).is_none() {
                    continue;
                }
                if !has_required_tags(&job.manifest.tags_required, worker_tags) {
                    self.log.warn(
                        "dispatch",
                        format!(
                            "Tag mismatch: job '{job_id}' requires [{}], worker {worker_id} has [{}]",
                            job.manifest.tags_required.join(","),
                            worker_tags.join(",")
                        ),
                    );
                    continue;
                }

                let Some(table) = self.tables.get_mut(job_id) else {
                    continue;
                };
                let Some(chunk) = table
                    .chunks
                    .iter_mut()
                    .find(|c| c.state == ChunkState::Pending)
                else {
                    continue;
                };

                chunk.state = ChunkState::Assigned;
                chunk.assigned_to = worker_id.clone();
                chunk.assigned_at_ms = now_ms();
                let range = chunk.range();
                let assigned_at_ms = chunk.assigned_at_ms;
                self.dirty.insert(job_id.clone());

                self.assignments.insert(
                    worker_id.clone(),
                    Assignment {
                        job_id: job_id.clone(),
                        chunk: range,
                        assigned_at_ms,
                    },
                );

                if worker_id == &self.node_id {
                    local.push(LocalDispatch {
                        manifest: job.manifest.clone(),
                        chunk: range,
                    });
                    self.log.info(
                        "dispatch",
                        format!("Self-assigned: job={job_id} chunk={}", range.range_str()),
                    );
                } else {
                    self.commands.send_command(
                        worker_id,
                        CommandKind::AssignChunk,
                        job_id,
                        "coordinator_dispatch",
                        range.frame_start,
                        range.frame_end,
                    );
                    self.log.info(
                        "dispatch",
                        format!("Assigned to {worker_id}: job={job_id} chunk={}", range.range_str()),
                    );
                }

                // One assignment per worker per cycle.
                break;
            }
        }

        local
    }

    fn write_dirty_tables(&mut self, force: bool) {
        if self.dirty.is_empty() {
            return;
        }
        if !force {
            if let Some(last) = self.last_write {
                if last.elapsed().as_millis() < WRITE_THROTTLE_MS as u128 {
                    return;
                }
            }
        }
        self.last_write = Some(Instant::now());

        for job_id in self.dirty.drain() {
            let Some(table) = self.tables.get_mut(&job_id) else {
                continue;
            };
            table.updated_at_ms = now_ms();
            table.coordinator_id = self.node_id.clone();

            let path = self.farm_path.join("jobs").join(&job_id).join("dispatch.json");
            if let Err(e) = storage::write_json(&path, table) {
                self.log
                    .error("dispatch", format!("Failed to write dispatch.json for {job_id}: {e}"));
            }
        }
    }

    // --- Job state changes and manual controls ---

    /// React to a job leaving or re-entering the active state.
    pub fn handle_job_state_change(&mut self, job_id: &str, new_state: JobState, jobs: &[JobInfo]) {
        match new_state {
            JobState::Paused | JobState::Cancelled => {
                let holders: Vec<String> = self
                    .assignments
                    .iter()
                    .filter(|(_, a)| a.job_id == job_id)
                    .map(|(n, _)| n.clone())
                    .collect();

                for node_id in holders {
                    if node_id != self.node_id {
                        if let Some(a) = self.assignments.get(&node_id) {
                            self.commands.send_command(
                                &node_id,
                                CommandKind::AbortChunk,
                                job_id,
                                &format!("job_{new_state}"),
                                a.chunk.frame_start,
                                a.chunk.frame_end,
                            );
                        }
                    }
                    self.assignments.remove(&node_id);
                }

                if let Some(table) = self.tables.get_mut(job_id) {
                    for chunk in &mut table.chunks {
                        if chunk.state == ChunkState::Assigned {
                            chunk.revert_to_pending();
                        }
                    }
                    self.dirty.insert(job_id.to_string());
                }
            }
            JobState::Active => {
                // Resume. The table may have been cleaned up; rebuild from
                // the manifest and let assign_work pick up the pending
                // chunks.
                if !self.tables.contains_key(job_id) {
                    if let Some(job) = jobs.iter().find(|j| j.manifest.job_id == job_id) {
                        self.init_table(&job.manifest);
                    }
                }
            }
            _ => {}
        }
    }

    /// Pull an assigned chunk back from its holder and re-queue it.
    pub fn reassign_chunk(&mut self, job_id: &str, frame_start: i32, frame_end: i32) {
        let range = ChunkRange::new(frame_start, frame_end);
        let Some(table) = self.tables.get_mut(job_id) else {
            return;
        };
        let Some(chunk) = table
            .chunks
            .iter_mut()
            .find(|c| c.matches(&range) && c.state == ChunkState::Assigned)
        else {
            return;
        };

        let holder = chunk.assigned_to.clone();
        chunk.revert_to_pending();
        self.dirty.insert(job_id.to_string());

        if !holder.is_empty() {
            // Self-assigned chunks go through our own inbox so the abort
            // takes the same path as a remote one.
            self.commands.send_command(
                &holder,
                CommandKind::AbortChunk,
                job_id,
                "coordinator_reassign",
                frame_start,
                frame_end,
            );
            self.assignments.remove(&holder);
        }

        self.log.info(
            "dispatch",
            format!("Manual reassign: job={job_id} chunk={frame_start}-{frame_end}"),
        );
    }

    /// Put a failed chunk back in play. `retry_count` is kept so the retry
    /// ceiling still applies.
    pub fn retry_failed_chunk(&mut self, job_id: &str, frame_start: i32, frame_end: i32) {
        let range = ChunkRange::new(frame_start, frame_end);
        let Some(table) = self.tables.get_mut(job_id) else {
            return;
        };
        let Some(chunk) = table
            .chunks
            .iter_mut()
            .find(|c| c.matches(&range) && c.state == ChunkState::Failed)
        else {
            return;
        };

        chunk.revert_to_pending();
        self.dirty.insert(job_id.to_string());
        self.log.info(
            "dispatch",
            format!("Manual retry: job={job_id} chunk={frame_start}-{frame_end}"),
        );
    }

    // --- Recovery ---

    /// Replay dispatch tables from disk at coordinator startup: dead
    /// holders' chunks revert to pending, live holders are re-tracked so
    /// the stale timer covers them.
    fn recover_from_disk(&mut self, nodes: &[NodeInfo], jobs: &[JobInfo]) {
        for job in jobs {
            if job.current_state != JobState::Active {
                continue;
            }
            let job_id = &job.manifest.job_id;
            let path = self.farm_path.join("jobs").join(job_id).join("dispatch.json");
            let Some(mut table) = storage::read_json::<DispatchTable>(&path) else {
                continue;
            };

            for chunk in &mut table.chunks {
                if chunk.state != ChunkState::Assigned {
                    continue;
                }
                if chunk.assigned_to.is_empty() || Self::is_node_dead(&chunk.assigned_to, nodes) {
                    chunk.revert_to_pending();
                } else {
                    self.assignments.insert(
                        chunk.assigned_to.clone(),
                        Assignment {
                            job_id: job_id.clone(),
                            chunk: chunk.range(),
                            assigned_at_ms: chunk.assigned_at_ms,
                        },
                    );
                }
            }

            self.tables.insert(job_id.clone(), table);
            self.dirty.insert(job_id.clone());
            self.log.info("dispatch", format!("Recovered dispatch table: {job_id}"));
        }
    }

    // --- Introspection (consumers and tests) ---

    pub fn table(&self, job_id: &str) -> Option<&DispatchTable> {
        self.tables.get(job_id)
    }

    pub fn assignment_for(&self, node_id: &str) -> Option<(String, ChunkRange)> {
        self.assignments
            .get(node_id)
            .map(|a| (a.job_id.clone(), a.chunk))
    }

    pub fn assignment_count(&self) -> usize {
        self.assignments.len()
    }
}

fn has_required_tags(required: &[String], node_tags: &[String]) -> bool {
    required.iter().all(|r| node_tags.contains(r))
}
