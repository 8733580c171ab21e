//! Submission intake (coordinator only).
//!
//! External tools drop `<ts>.<host>.json` files into `submissions/`; the
//! coordinator materialises them as jobs. A file whose bytes have not
//! propagated yet is retried a few polls before being given up on; every
//! file ends in `processed/` regardless of outcome so a bad submission can
//! never cause a retry storm.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::command::channel::filename_timestamp;
use crate::jobs::template::{bake_manifest, generate_slug};
use crate::jobs::{JobStore, TemplateStore};
use crate::logging::MonitorLog;
use crate::wake::DatagramWake;
use crate::{now_ms, storage};

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const PURGE_INTERVAL: Duration = Duration::from_secs(3600);
const PROCESSED_MAX_AGE_MS: i64 = 24 * 60 * 60 * 1000;

/// Unreadable polls tolerated before a submission is abandoned (~30 s of
/// sync-propagation grace).
const MAX_READ_RETRIES: u32 = 6;

/// External submission file schema. Unknown override keys are warned about
/// and skipped; everything else falls back to the template's job defaults.
#[derive(Debug, Deserialize)]
struct SubmissionFile {
    #[serde(default)]
    template_id: String,
    #[serde(default)]
    job_name: String,
    #[serde(default)]
    submitted_by_host: String,
    /// Template flag id -> value.
    #[serde(default)]
    overrides: HashMap<String, String>,
    frame_start: Option<i32>,
    frame_end: Option<i32>,
    chunk_size: Option<i32>,
    priority: Option<i32>,
    max_retries: Option<u32>,
    #[serde(default, with = "explicit_timeout")]
    timeout_seconds: Option<Option<u64>>,
}

/// Distinguishes an absent `timeout_seconds` (use the template default)
/// from an explicit null (no timeout).
mod explicit_timeout {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(de: D) -> Result<Option<Option<u64>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<u64>::deserialize(de).map(Some)
    }
}

pub struct SubmissionIntake {
    farm_path: PathBuf,
    node_id: String,
    os: String,
    log: Arc<MonitorLog>,
    templates: Arc<TemplateStore>,
    jobs: Arc<JobStore>,
    nudge: Arc<Notify>,
    read_fail_counts: Mutex<HashMap<String, u32>>,
}

impl SubmissionIntake {
    pub fn new(
        farm_path: &Path,
        node_id: &str,
        os: &str,
        log: Arc<MonitorLog>,
        templates: Arc<TemplateStore>,
        jobs: Arc<JobStore>,
        wake: Option<Arc<DatagramWake>>,
    ) -> Arc<Self> {
        storage::ensure_dir(&farm_path.join("submissions").join("processed"));

        let nudge = Arc::new(Notify::new());
        if let Some(w) = &wake {
            w.subscribe(Arc::clone(&nudge));
        }

        Arc::new(Self {
            farm_path: farm_path.to_path_buf(),
            node_id: node_id.to_string(),
            os: os.to_string(),
            log,
            templates,
            jobs,
            nudge,
            read_fail_counts: Mutex::new(HashMap::new()),
        })
    }

    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        self.log.info("farm", "Submission intake started");

        let intake = Arc::clone(self);
        tokio::spawn(async move {
            let mut last_purge = Instant::now();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    _ = intake.nudge.notified() => {}
                }

                intake.poll_once();

                if last_purge.elapsed() >= PURGE_INTERVAL {
                    intake.purge_processed();
                    last_purge = Instant::now();
                }
            }
        });
    }

    /// One pass over `submissions/*.json` in filename (chronological) order.
    pub fn poll_once(&self) {
        let inbox = self.farm_path.join("submissions");
        let Ok(entries) = std::fs::read_dir(&inbox) else {
            return;
        };

        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == "json"))
            .collect();
        files.sort();

        for file in files {
            self.process_submission(&file);
        }
    }

    fn process_submission(&self, file: &Path) {
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let Some(value) = storage::read_json_value(file) else {
            // Not readable yet: likely still propagating through the sync
            // layer. Retry next cycle, give up after the grace window.
            let mut counts = self.read_fail_counts.lock();
            let count = counts.entry(file_name.clone()).or_insert(0);
            *count += 1;
            if *count >= MAX_READ_RETRIES {
                self.log.error(
                    "farm",
                    format!("Giving up on unreadable submission after {count} retries: {file_name}"),
                );
                counts.remove(&file_name);
                drop(counts);
                self.move_to_processed(file);
            } else {
                self.log.info(
                    "farm",
                    format!("Submission not yet readable (retry {count}): {file_name}"),
                );
            }
            return;
        };
        self.read_fail_counts.lock().remove(&file_name);

        let submission: SubmissionFile = match serde_json::from_value(value) {
            Ok(s) => s,
            Err(e) => {
                self.log
                    .error("farm", format!("Malformed submission {file_name}: {e}"));
                self.move_to_processed(file);
                return;
            }
        };

        self.materialise(&submission, &file_name);
        self.move_to_processed(file);
    }

    fn materialise(&self, submission: &SubmissionFile, file_name: &str) {
        if submission.template_id.is_empty() {
            self.log
                .error("farm", format!("Submission missing template_id: {file_name}"));
            return;
        }

        let Some(mut tmpl) = self.templates.find_valid(&submission.template_id) else {
            self.log.error(
                "farm",
                format!("Template not found for submission: {}", submission.template_id),
            );
            return;
        };

        // Apply per-flag overrides keyed by template flag id.
        for (key, value) in &submission.overrides {
            match tmpl.flags.iter_mut().find(|f| !f.id.is_empty() && f.id == *key) {
                Some(flag) => flag.value = Some(value.clone()),
                None => self.log.warn(
                    "farm",
                    format!("Submission override key not found in template: {key}"),
                ),
            }
        }

        let defaults = &tmpl.job_defaults;
        let frame_start = submission.frame_start.unwrap_or(defaults.frame_start);
        let frame_end = submission.frame_end.unwrap_or(defaults.frame_end);
        let chunk_size = submission.chunk_size.unwrap_or(defaults.chunk_size);
        let priority = submission.priority.unwrap_or(defaults.priority);
        let max_retries = submission.max_retries.unwrap_or(defaults.max_retries);
        let timeout = match submission.timeout_seconds {
            Some(explicit) => explicit,
            None => defaults.timeout_seconds,
        };

        let flag_values: Vec<String> = tmpl
            .flags
            .iter()
            .map(|f| f.value.clone().unwrap_or_default())
            .collect();

        let job_name = if submission.job_name.is_empty() {
            format!("{}-batch", submission.template_id)
        } else {
            submission.job_name.clone()
        };

        let jobs_dir = self.farm_path.join("jobs");
        let Some(slug) = generate_slug(&job_name, &jobs_dir) else {
            self.log
                .error("farm", format!("Failed to generate slug for submission: {job_name}"));
            return;
        };

        let cmd_path = tmpl.cmd.for_os(&self.os).to_string();
        let manifest = bake_manifest(
            &tmpl,
            &flag_values,
            &cmd_path,
            &slug,
            frame_start,
            frame_end,
            chunk_size,
            max_retries,
            timeout,
            &self.node_id,
            &self.os,
        );

        match self.jobs.submit_job(&manifest, priority) {
            Ok(job_id) => self.log.info(
                "farm",
                format!(
                    "Auto-submitted job '{job_id}' from {} (template: {})",
                    submission.submitted_by_host, submission.template_id
                ),
            ),
            Err(e) => self.log.error(
                "farm",
                format!("Failed to submit job from submission {file_name}: {e}"),
            ),
        }
    }

    fn move_to_processed(&self, file: &Path) {
        let processed = self.farm_path.join("submissions").join("processed");
        let Some(name) = file.file_name() else {
            return;
        };
        if std::fs::rename(file, processed.join(name)).is_err() {
            let _ = std::fs::remove_file(file);
        }
    }

    /// Drop processed submissions older than 24 h (timestamp prefix of the
    /// filename).
    pub fn purge_processed(&self) {
        let processed = self.farm_path.join("submissions").join("processed");
        let Ok(entries) = std::fs::read_dir(&processed) else {
            return;
        };

        let cutoff = now_ms() - PROCESSED_MAX_AGE_MS;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Some(ts) = filename_timestamp(&path) {
                if ts < cutoff {
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
    }
}
