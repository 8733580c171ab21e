//! Monitor log: a bounded in-memory ring buffer plus per-node daily log
//! files under `nodes/<id>/` so peers can read each other's history through
//! the sync layer. Every entry is mirrored to `tracing` for the console.
//!
//! The log is an explicit component handed around as an `Arc`, with file
//! logging switched on once the farm root is known.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDate};
use parking_lot::Mutex;

const MAX_ENTRIES: usize = 2000;
const RETAIN_DAYS: i64 = 7;

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp_ms: i64,
    pub level: &'static str,
    pub category: String,
    pub message: String,
}

#[derive(Default)]
struct FileSink {
    farm_path: PathBuf,
    node_id: String,
    current_date: String,
}

#[derive(Default)]
struct Inner {
    buffer: VecDeque<LogEntry>,
    file: Option<FileSink>,
}

#[derive(Default)]
pub struct MonitorLog {
    inner: Mutex<Inner>,
}

impl MonitorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_file_logging(&self, farm_path: &Path, node_id: &str) {
        crate::storage::ensure_dir(&farm_path.join("nodes").join(node_id));
        let mut inner = self.inner.lock();
        inner.file = Some(FileSink {
            farm_path: farm_path.to_path_buf(),
            node_id: node_id.to_string(),
            current_date: Local::now().format("%Y-%m-%d").to_string(),
        });
    }

    pub fn stop_file_logging(&self) {
        self.inner.lock().file = None;
    }

    pub fn info(&self, category: &str, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(target: "monitor", category, "{message}");
        self.append("INFO", category, message);
    }

    pub fn warn(&self, category: &str, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(target: "monitor", category, "{message}");
        self.append("WARN", category, message);
    }

    pub fn error(&self, category: &str, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(target: "monitor", category, "{message}");
        self.append("ERROR", category, message);
    }

    /// Ring buffer contents in chronological order.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.inner.lock().buffer.iter().cloned().collect()
    }

    fn append(&self, level: &'static str, category: &str, message: String) {
        let now = Local::now();
        let entry = LogEntry {
            timestamp_ms: now.timestamp_millis(),
            level,
            category: category.to_string(),
            message,
        };

        let line = format!(
            "{} {}  [{}] {}",
            now.format("%H:%M:%S%.3f"),
            entry.level,
            entry.category,
            entry.message
        );

        let mut inner = self.inner.lock();
        if inner.buffer.len() >= MAX_ENTRIES {
            inner.buffer.pop_front();
        }
        inner.buffer.push_back(entry);

        if let Some(file) = &mut inner.file {
            let today = now.format("%Y-%m-%d").to_string();
            if today != file.current_date {
                file.current_date = today;
                purge_old_files(&file.farm_path, &file.node_id);
            }

            let log_path = file
                .farm_path
                .join("nodes")
                .join(&file.node_id)
                .join(format!("monitor-{}.log", file.current_date));

            if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(&log_path) {
                let _ = writeln!(f, "{line}");
            }
        }
    }
}

fn purge_old_files(farm_path: &Path, node_id: &str) {
    let node_dir = farm_path.join("nodes").join(node_id);
    let Ok(entries) = std::fs::read_dir(&node_dir) else {
        return;
    };

    let today = Local::now().date_naive();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(date) = parse_log_date(&name) else {
            continue;
        };
        if (today - date).num_days() > RETAIN_DAYS {
            let _ = std::fs::remove_file(entry.path());
        }
    }
}

fn parse_log_date(filename: &str) -> Option<NaiveDate> {
    let date_str = filename
        .strip_prefix("monitor-")?
        .strip_suffix(".log")?;
    NaiveDate::parse_from_str(date_str, "%Y-%m-%d").ok()
}

/// Read the tail of a node's daily log files (yesterday's then today's),
/// trimmed to `max_lines`. Consumers use this to follow a peer through the
/// sync layer.
pub fn read_node_log(farm_path: &Path, node_id: &str, max_lines: usize) -> Vec<String> {
    let node_dir = farm_path.join("nodes").join(node_id);
    let today = Local::now();
    let yesterday = today - chrono::Duration::days(1);

    let mut lines = Vec::new();
    for date in [yesterday, today] {
        let path = node_dir.join(format!("monitor-{}.log", date.format("%Y-%m-%d")));
        if let Ok(content) = std::fs::read_to_string(&path) {
            lines.extend(content.lines().map(str::to_string));
        }
    }

    if lines.len() > max_lines {
        lines.drain(..lines.len() - max_lines);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_caps_and_keeps_newest() {
        let log = MonitorLog::new();
        for i in 0..(MAX_ENTRIES + 10) {
            log.info("test", format!("entry {i}"));
        }
        let entries = log.entries();
        assert_eq!(entries.len(), MAX_ENTRIES);
        assert_eq!(entries.last().unwrap().message, format!("entry {}", MAX_ENTRIES + 9));
    }

    #[test]
    fn file_logging_writes_daily_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = MonitorLog::new();
        log.start_file_logging(dir.path(), "aabbccddeeff");
        log.warn("health", "something odd");
        log.stop_file_logging();

        let lines = read_node_log(dir.path(), "aabbccddeeff", 100);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("WARN"));
        assert!(lines[0].contains("[health] something odd"));
    }

    #[test]
    fn log_date_parsing() {
        assert!(parse_log_date("monitor-2026-08-02.log").is_some());
        assert!(parse_log_date("monitor-garbage.log").is_none());
        assert!(parse_log_date("heartbeat.json").is_none());
    }
}
