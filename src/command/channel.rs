//! Inbox worker and command sender.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::logging::MonitorLog;
use crate::wake::DatagramWake;
use crate::{now_ms, storage};

use super::dedup::MessageDedup;
use super::{Action, Command, CommandKind};

const POLL_INTERVAL: Duration = Duration::from_secs(3);
const DEDUP_PURGE_INTERVAL: Duration = Duration::from_secs(30);
const PROCESSED_PURGE_INTERVAL: Duration = Duration::from_secs(60);
const PROCESSED_MAX_AGE_MS: i64 = 24 * 60 * 60 * 1000;

pub struct CommandChannel {
    farm_path: PathBuf,
    node_id: String,
    log: Arc<MonitorLog>,
    wake: Option<Arc<DatagramWake>>,
    nudge: Arc<Notify>,
    actions: Mutex<Vec<Action>>,
    dedup: Mutex<MessageDedup>,
}

impl CommandChannel {
    pub fn new(
        farm_path: &Path,
        node_id: &str,
        log: Arc<MonitorLog>,
        wake: Option<Arc<DatagramWake>>,
    ) -> Arc<Self> {
        storage::ensure_dir(&farm_path.join("commands").join(node_id).join("processed"));

        let nudge = Arc::new(Notify::new());
        if let Some(w) = &wake {
            w.subscribe(Arc::clone(&nudge));
        }

        Arc::new(Self {
            farm_path: farm_path.to_path_buf(),
            node_id: node_id.to_string(),
            log,
            wake,
            nudge,
            actions: Mutex::new(Vec::new()),
            dedup: Mutex::new(MessageDedup::new()),
        })
    }

    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        self.poll_once();
        self.log.info("command", format!("Started for node {}", self.node_id));

        let channel = Arc::clone(self);
        tokio::spawn(async move {
            channel.run(cancel).await;
        });
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut last_dedup_purge = Instant::now();
        let mut last_processed_purge = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = self.nudge.notified() => {}
            }

            self.poll_once();

            if last_dedup_purge.elapsed() >= DEDUP_PURGE_INTERVAL {
                self.dedup.lock().purge();
                last_dedup_purge = Instant::now();
            }
            if last_processed_purge.elapsed() >= PROCESSED_PURGE_INTERVAL {
                self.purge_processed();
                last_processed_purge = Instant::now();
            }
        }
    }

    /// Write a command into `commands/<target>/` and nudge the recipient.
    pub fn send_command(
        &self,
        target: &str,
        kind: CommandKind,
        job_id: &str,
        reason: &str,
        frame_start: i32,
        frame_end: i32,
    ) {
        let now = now_ms();
        let msg_id = format!("{now}.{}", self.node_id);
        let has_range = frame_start != 0 || frame_end != 0;

        let cmd = Command {
            version: 1,
            msg_id: msg_id.clone(),
            from: self.node_id.clone(),
            target: target.to_string(),
            kind,
            timestamp_ms: now,
            job_id: job_id.to_string(),
            reason: reason.to_string(),
            frame_start: has_range.then_some(frame_start),
            frame_end: has_range.then_some(frame_end),
        };

        let target_dir = self.farm_path.join("commands").join(target);
        storage::ensure_dir(&target_dir);

        if let Err(e) = storage::write_json(&target_dir.join(format!("{msg_id}.json")), &cmd) {
            self.log
                .error("command", format!("Failed to send {kind} to {target}: {e}"));
            return;
        }

        if let Some(wake) = &self.wake {
            wake.announce(&json!({
                "kind": "command",
                "from": self.node_id,
                "target": target,
                "type": kind,
                "msg_id": msg_id,
            }));
        }

        let mut msg = format!("Sent {kind} to {target}");
        if !job_id.is_empty() {
            msg.push_str(&format!(" job={job_id}"));
        }
        self.log.info("command", msg);
    }

    /// Drain parsed actions for the main loop.
    pub fn pop_actions(&self) -> Vec<Action> {
        std::mem::take(&mut *self.actions.lock())
    }

    /// One inbox pass: list, sort by filename, parse, queue, move to
    /// `processed/`. Unparsable files are moved too so a bad message can
    /// never wedge the inbox.
    pub fn poll_once(&self) {
        let inbox = self.farm_path.join("commands").join(&self.node_id);
        let processed = inbox.join("processed");
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
            let parsed = storage::read_json::<Command>(&file);

            match parsed {
                Some(cmd) => {
                    let duplicate = self.dedup.lock().is_duplicate(&cmd.msg_id);
                    if duplicate {
                        self.log
                            .info("command", format!("Dropping duplicate {}", cmd.msg_id));
                    } else {
                        self.actions.lock().push(Action::from(cmd));
                    }
                }
                None => {
                    self.log.error(
                        "command",
                        format!("Failed to parse command: {}", file.display()),
                    );
                }
            }

            let file_name = file.file_name().map(|n| n.to_owned()).unwrap_or_default();
            if std::fs::rename(&file, processed.join(&file_name)).is_err() {
                // Rename across a flaky share can fail; deleting still
                // prevents a reprocessing loop.
                let _ = std::fs::remove_file(&file);
            }
        }
    }

    /// Drop processed entries whose filename timestamp is older than 24 h.
    pub fn purge_processed(&self) {
        let processed = self
            .farm_path
            .join("commands")
            .join(&self.node_id)
            .join("processed");
        let Ok(entries) = std::fs::read_dir(&processed) else {
            return;
        };

        let now = now_ms();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|e| e != "json") {
                continue;
            }
            let Some(ts) = filename_timestamp(&path) else {
                continue;
            };
            if now - ts > PROCESSED_MAX_AGE_MS {
                let _ = std::fs::remove_file(&path);
            }
        }
    }
}

/// Parse the leading `<ms>` out of a `<ms>.<node>.json` filename.
pub fn filename_timestamp(path: &Path) -> Option<i64> {
    let stem = path.file_stem()?.to_str()?;
    let ts = stem.split('.').next()?;
    ts.parse().ok()
}
