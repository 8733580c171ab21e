use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FarmError {
    #[error("Sync root is not a valid directory: {0}")]
    InvalidSyncRoot(PathBuf),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job already exists: {0}")]
    JobExists(String),

    #[error("Job name produces no usable slug: {0:?}")]
    UnusableSlug(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Another coordinator is already active: {hostname} ({node_id})")]
    CoordinatorConflict { hostname: String, node_id: String },

    #[error("Agent IPC error: {0}")]
    AgentIpc(String),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FarmError>;
