//! Agent IPC payloads. Frames on the wire are
//! `u32 little-endian length || UTF-8 JSON`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::jobs::ProgressConfig;

// --- Monitor → Agent ---

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorToAgent {
    Ping,
    Shutdown,
    Task(TaskMessage),
    Abort(AbortMessage),
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskMessage {
    pub job_id: String,
    pub frame_start: i32,
    pub frame_end: i32,
    pub command: CommandSpec,
    pub working_dir: Option<String>,
    pub environment: BTreeMap<String, String>,
    pub progress: Option<ProgressConfig>,
    pub output_detection: Option<TaskOutputDetection>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandSpec {
    pub executable: String,
    pub args: Vec<String>,
}

/// Output detection as the agent consumes it: the manifest's
/// `stdout_regex`/`path_group` pair flattened to `regex`/`capture_group`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutputDetection {
    pub regex: String,
    pub capture_group: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct AbortMessage {
    pub reason: String,
}

// --- Agent → Monitor ---

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentToMonitor {
    Pong,
    Status(StatusMessage),
    Ack(AckMessage),
    Progress(ProgressMessage),
    Stdout(StdoutMessage),
    Completed(CompletedMessage),
    Failed(FailedMessage),
    FrameCompleted(FrameCompletedMessage),
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusMessage {
    pub state: String,
    pub pid: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AckMessage {
    #[serde(default)]
    pub job_id: String,
    #[serde(default)]
    pub frame_start: i32,
    #[serde(default)]
    pub frame_end: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressMessage {
    #[serde(default)]
    pub progress_pct: f32,
    #[serde(default)]
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StdoutMessage {
    #[serde(default)]
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletedMessage {
    #[serde(default)]
    pub elapsed_ms: u64,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub output_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FailedMessage {
    #[serde(default = "default_exit_code")]
    pub exit_code: i32,
    #[serde(default = "default_error")]
    pub error: String,
}

fn default_exit_code() -> i32 {
    -1
}

fn default_error() -> String {
    "Unknown error".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct FrameCompletedMessage {
    pub frame: i32,
}
