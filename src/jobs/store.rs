//! Job discovery and mutation.
//!
//! The store scans `jobs/*` on a cooldown, reading each job's manifest and
//! its newest state entry. Writers flip an invalidation flag so the next
//! scan happens promptly. All mutation goes through write-then-rename.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::logging::MonitorLog;
use crate::{now_ms, storage, FarmError, Result};

use super::types::{JobInfo, JobManifest, JobState, JobStateEntry};

const SCAN_COOLDOWN: Duration = Duration::from_secs(3);

struct ScanState {
    jobs: Vec<JobInfo>,
    last_scan: Option<Instant>,
}

pub struct JobStore {
    farm_path: PathBuf,
    log: Arc<MonitorLog>,
    state: Mutex<ScanState>,
    invalidated: AtomicBool,
}

impl JobStore {
    pub fn new(farm_path: &Path, log: Arc<MonitorLog>) -> Arc<Self> {
        Arc::new(Self {
            farm_path: farm_path.to_path_buf(),
            log,
            state: Mutex::new(ScanState {
                jobs: Vec::new(),
                last_scan: None,
            }),
            invalidated: AtomicBool::new(false),
        })
    }

    /// First scan runs synchronously so the first snapshot is populated;
    /// the worker then rescans on the cooldown.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        self.scan_once();

        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                }
                store.scan();
            }
        });
    }

    /// Rescan if the cooldown elapsed or a writer invalidated the snapshot.
    pub fn scan(&self) {
        let due = {
            let state = self.state.lock();
            state
                .last_scan
                .is_none_or(|t| t.elapsed() >= SCAN_COOLDOWN)
        };
        if due || self.invalidated.swap(false, Ordering::Relaxed) {
            self.scan_once();
        }
    }

    /// Unconditional scan of the jobs directory.
    pub fn scan_once(&self) {
        let jobs_dir = self.farm_path.join("jobs");
        let mut jobs: Vec<JobInfo> = Vec::new();

        if let Ok(entries) = std::fs::read_dir(&jobs_dir) {
            for entry in entries.flatten() {
                let job_dir = entry.path();
                if !job_dir.is_dir() {
                    continue;
                }

                let Some(manifest) =
                    storage::read_json::<JobManifest>(&job_dir.join("manifest.json"))
                else {
                    continue;
                };

                let (current_state, current_priority) = read_latest_state(&job_dir)
                    .unwrap_or((JobState::Active, 50));

                jobs.push(JobInfo {
                    manifest,
                    current_state,
                    current_priority,
                });
            }
        }

        // Priority desc, then oldest first: deterministic FIFO within a
        // priority class.
        jobs.sort_by(|a, b| {
            b.current_priority
                .cmp(&a.current_priority)
                .then(a.manifest.submitted_at_ms.cmp(&b.manifest.submitted_at_ms))
        });

        let mut state = self.state.lock();
        state.jobs = jobs;
        state.last_scan = Some(Instant::now());
    }

    pub fn job_snapshot(&self) -> Vec<JobInfo> {
        self.state.lock().jobs.clone()
    }

    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::Relaxed);
    }

    /// Materialise a baked manifest as a job: create the directory tree,
    /// write the manifest, then the initial `active` state entry.
    pub fn submit_job(&self, manifest: &JobManifest, priority: i32) -> Result<String> {
        let job_dir = self.farm_path.join("jobs").join(&manifest.job_id);

        std::fs::create_dir_all(job_dir.join("state"))?;
        std::fs::create_dir_all(job_dir.join("events"))?;

        let manifest_path = job_dir.join("manifest.json");
        if manifest_path.exists() {
            self.log.error(
                "job",
                format!("Manifest already exists: {}", manifest_path.display()),
            );
            return Err(FarmError::JobExists(manifest.job_id.clone()));
        }

        storage::write_json(&manifest_path, manifest)?;

        let ts = now_ms();
        let entry = JobStateEntry {
            version: 1,
            state: JobState::Active,
            priority,
            node_id: manifest.submitted_by.clone(),
            timestamp_ms: ts,
        };
        let state_name = format!("{ts}_{}.json", manifest.submitted_by);
        storage::write_json(&job_dir.join("state").join(state_name), &entry)?;

        self.invalidate();
        self.log.info("job", format!("Job submitted: {}", manifest.job_id));
        Ok(manifest.job_id.clone())
    }

    /// Append a job state entry; the latest filename is authoritative.
    pub fn write_state_entry(
        &self,
        job_id: &str,
        state: JobState,
        priority: i32,
        node_id: &str,
    ) -> Result<()> {
        let ts = now_ms();
        let entry = JobStateEntry {
            version: 1,
            state,
            priority,
            node_id: node_id.to_string(),
            timestamp_ms: ts,
        };

        let state_dir = self.farm_path.join("jobs").join(job_id).join("state");
        std::fs::create_dir_all(&state_dir)?;
        storage::write_json(&state_dir.join(format!("{ts}_{node_id}.json")), &entry)?;

        self.invalidate();
        self.log.info(
            "job",
            format!("State entry: job={job_id} state={state} priority={priority}"),
        );
        Ok(())
    }

    /// Remove the whole job tree. Terminal; peers observe the directory
    /// disappearing on their next scan.
    pub fn delete_job(&self, job_id: &str) -> Result<()> {
        let job_dir = self.farm_path.join("jobs").join(job_id);
        std::fs::remove_dir_all(&job_dir)?;
        self.invalidate();
        self.log.info("job", format!("Deleted job: {job_id}"));
        Ok(())
    }

    /// Resubmit a finished or stuck job as a fresh one under
    /// `<base>-requeueN`, keeping its manifest and current priority.
    pub fn requeue_job(&self, job_id: &str, node_id: &str) -> Result<String> {
        let source = self
            .job_snapshot()
            .into_iter()
            .find(|j| j.manifest.job_id == job_id)
            .ok_or_else(|| FarmError::JobNotFound(job_id.to_string()))?;

        let base = job_id
            .rfind("-requeue")
            .map_or(job_id, |pos| &job_id[..pos]);
        let prefix = format!("{base}-requeue");

        let mut max_n = 0u32;
        if let Ok(entries) = std::fs::read_dir(self.farm_path.join("jobs")) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if let Some(rest) = name.strip_prefix(&prefix) {
                    if let Ok(n) = rest.parse::<u32>() {
                        max_n = max_n.max(n);
                    }
                }
            }
        }

        let mut manifest = source.manifest.clone();
        manifest.job_id = format!("{prefix}{}", max_n + 1);
        manifest.submitted_by = node_id.to_string();
        manifest.submitted_at_ms = now_ms();

        let slug = self.submit_job(&manifest, source.current_priority)?;
        self.log.info("job", format!("Requeued job: {job_id} -> {slug}"));
        Ok(slug)
    }
}

/// Newest parseable entry under `state/`, by filename (timestamp prefix).
fn read_latest_state(job_dir: &Path) -> Option<(JobState, i32)> {
    let state_dir = job_dir.join("state");
    let entries = std::fs::read_dir(&state_dir).ok()?;

    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == "json"))
        .collect();
    files.sort_by(|a, b| b.file_name().cmp(&a.file_name()));

    files.iter().find_map(|f| {
        storage::read_json::<JobStateEntry>(f).map(|e| (e.state, e.priority))
    })
}
