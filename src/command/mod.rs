//! Durable per-node command inbox.
//!
//! Any node writes into `commands/<target>/`; only the target consumes its
//! inbox, moving every message into `processed/` whether it was accepted or
//! rejected. Delivery is at-least-once; `msg_id` dedup makes reprocessing
//! within a 60 s window harmless.

pub mod channel;
pub mod dedup;

pub use channel::CommandChannel;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    AssignChunk,
    AbortChunk,
    ChunkCompleted,
    ChunkFailed,
    StopJob,
    StopAll,
    ResumeAll,
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CommandKind::AssignChunk => "assign_chunk",
            CommandKind::AbortChunk => "abort_chunk",
            CommandKind::ChunkCompleted => "chunk_completed",
            CommandKind::ChunkFailed => "chunk_failed",
            CommandKind::StopJob => "stop_job",
            CommandKind::StopAll => "stop_all",
            CommandKind::ResumeAll => "resume_all",
        };
        write!(f, "{s}")
    }
}

/// Wire form of a command file. `msg_id` is `"<timestamp_ms>.<from>"`,
/// which doubles as the filename stem and gives chronological inbox order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "_version", default = "default_version")]
    pub version: u32,
    pub msg_id: String,
    pub from: String,
    pub target: String,
    #[serde(rename = "type")]
    pub kind: CommandKind,
    pub timestamp_ms: i64,
    #[serde(default)]
    pub job_id: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_start: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_end: Option<i32>,
}

fn default_version() -> u32 {
    1
}

/// A parsed inbox entry handed to the main loop.
#[derive(Debug, Clone)]
pub struct Action {
    pub kind: CommandKind,
    pub job_id: String,
    pub reason: String,
    pub frame_start: i32,
    pub frame_end: i32,
    pub from_node_id: String,
    pub msg_id: String,
}

impl From<Command> for Action {
    fn from(cmd: Command) -> Self {
        Self {
            kind: cmd.kind,
            job_id: cmd.job_id,
            reason: cmd.reason,
            frame_start: cmd.frame_start.unwrap_or(0),
            frame_end: cmd.frame_end.unwrap_or(0),
            from_node_id: cmd.from,
            msg_id: cmd.msg_id,
        }
    }
}
