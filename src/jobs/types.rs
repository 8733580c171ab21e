//! Persisted job records: templates, manifests, state entries, and the
//! coordinator's dispatch table.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

fn default_version() -> u32 {
    1
}

fn default_group_1() -> u32 {
    1
}

fn default_group_2() -> u32 {
    2
}

fn default_kill_method() -> String {
    "terminate".to_string()
}

fn default_validation() -> String {
    "exit_code_only".to_string()
}

// --- Progress / output specs (copied verbatim from template to manifest) ---

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProgressPattern {
    pub regex: String,
    /// "fraction" or "percentage".
    #[serde(rename = "type")]
    pub pattern_type: String,
    #[serde(default = "default_group_1")]
    pub numerator_group: u32,
    #[serde(default = "default_group_2")]
    pub denominator_group: u32,
    #[serde(default = "default_group_1")]
    pub group: u32,
    #[serde(default)]
    pub info: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CompletionPattern {
    pub regex: String,
    #[serde(default)]
    pub info: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ErrorPattern {
    pub regex: String,
    #[serde(default)]
    pub info: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProgressConfig {
    #[serde(default)]
    pub patterns: Vec<ProgressPattern>,
    #[serde(default)]
    pub completion_pattern: Option<CompletionPattern>,
    #[serde(default)]
    pub error_patterns: Vec<ErrorPattern>,
}

impl ProgressConfig {
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty() && self.completion_pattern.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputDetection {
    /// None disables detection entirely.
    #[serde(default)]
    pub stdout_regex: Option<String>,
    #[serde(default = "default_group_1")]
    pub path_group: u32,
    /// "exit_code_only" or "exists_nonzero".
    #[serde(default = "default_validation")]
    pub validation: String,
    #[serde(default)]
    pub info: String,
}

impl Default for OutputDetection {
    fn default() -> Self {
        Self {
            stdout_regex: None,
            path_group: 1,
            validation: default_validation(),
            info: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    #[serde(default = "default_kill_method")]
    pub kill_method: String,
    #[serde(default)]
    pub working_dir: Option<String>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            kill_method: default_kill_method(),
            working_dir: None,
        }
    }
}

// --- Templates ---

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TemplateCmd {
    #[serde(default)]
    pub windows: String,
    #[serde(default)]
    pub linux: String,
    #[serde(default)]
    pub macos: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub editable: bool,
}

impl TemplateCmd {
    pub fn for_os(&self, os: &str) -> &str {
        match os {
            "windows" => &self.windows,
            "macos" => &self.macos,
            _ => &self.linux,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TemplateFlag {
    /// Flag token such as "-b" or "-o"; empty for positional values.
    #[serde(default)]
    pub flag: String,
    /// None = standalone flag, "" = user fills in, "{frame}" = runtime.
    #[serde(default)]
    pub value: Option<String>,
    /// UI label.
    #[serde(default)]
    pub info: String,
    #[serde(default)]
    pub editable: bool,
    #[serde(default)]
    pub required: bool,
    /// "file" = scene file picker, "output" = output path, "" = plain text.
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub flag_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filter: String,
    /// Cross-reference identifier for `{flag:<id>}` tokens and submission
    /// overrides.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_pattern: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefaults {
    pub frame_start: i32,
    pub frame_end: i32,
    pub chunk_size: i32,
    pub priority: i32,
    pub max_retries: u32,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            frame_start: 1,
            frame_end: 250,
            chunk_size: 1,
            priority: 50,
            max_retries: 3,
            timeout_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JobTemplate {
    #[serde(rename = "_version", default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub template_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub cmd: TemplateCmd,
    #[serde(default)]
    pub flags: Vec<TemplateFlag>,
    /// Renderer frame-number placeholder, e.g. "####" or "[####]".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub frame_padding: String,
    #[serde(default)]
    pub job_defaults: JobDefaults,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub output_detection: OutputDetection,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub tags_required: Vec<String>,

    // Runtime-only, never persisted.
    #[serde(skip)]
    pub valid: bool,
    #[serde(skip)]
    pub validation_error: String,
    #[serde(skip)]
    pub is_example: bool,
}

// --- Manifests ---

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ManifestFlag {
    #[serde(default)]
    pub flag: String,
    #[serde(default)]
    pub value: Option<String>,
}

/// Immutable job descriptor, written once at submission.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JobManifest {
    #[serde(rename = "_version", default = "default_version")]
    pub version: u32,
    /// The slug; doubles as the job directory name.
    pub job_id: String,
    #[serde(default)]
    pub template_id: String,
    #[serde(default)]
    pub submitted_by: String,
    #[serde(default)]
    pub submitted_os: String,
    #[serde(default)]
    pub submitted_at_ms: i64,
    /// OS name → renderer executable path.
    #[serde(default)]
    pub cmd: BTreeMap<String, String>,
    #[serde(default)]
    pub flags: Vec<ManifestFlag>,
    #[serde(default)]
    pub frame_start: i32,
    #[serde(default)]
    pub frame_end: i32,
    #[serde(default)]
    pub chunk_size: i32,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Parent of the resolved output path; created before each render.
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub output_detection: OutputDetection,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub tags_required: Vec<String>,
}

impl JobManifest {
    pub fn cmd_for_os(&self, os: &str) -> Option<&str> {
        self.cmd.get(os).map(String::as_str).filter(|c| !c.is_empty())
    }
}

// --- Job state ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Active,
    Paused,
    Cancelled,
    Completed,
    Failed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Active => "active",
            JobState::Paused => "paused",
            JobState::Cancelled => "cancelled",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Append-only entry under `jobs/<id>/state/`; the newest filename wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStateEntry {
    #[serde(rename = "_version", default = "default_version")]
    pub version: u32,
    pub state: JobState,
    pub priority: i32,
    pub node_id: String,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone)]
pub struct JobInfo {
    pub manifest: JobManifest,
    pub current_state: JobState,
    pub current_priority: i32,
}

// --- Chunks ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkRange {
    pub frame_start: i32,
    pub frame_end: i32,
}

impl ChunkRange {
    pub fn new(frame_start: i32, frame_end: i32) -> Self {
        Self {
            frame_start,
            frame_end,
        }
    }

    /// Zero-padded form used in event and stdout filenames:
    /// `000001-000005`.
    pub fn range_str(&self) -> String {
        format!("{:06}-{:06}", self.frame_start, self.frame_end)
    }

    /// Short human label carried in heartbeats: "f42" or "f42-50".
    pub fn label(&self) -> String {
        if self.frame_start == self.frame_end {
            format!("f{}", self.frame_start)
        } else {
            format!("f{}-{}", self.frame_start, self.frame_end)
        }
    }
}

/// Split `[frame_start, frame_end]` into contiguous chunks of at most
/// `chunk_size` frames. Invalid input yields no chunks.
pub fn compute_chunks(frame_start: i32, frame_end: i32, chunk_size: i32) -> Vec<ChunkRange> {
    let mut chunks = Vec::new();
    if chunk_size < 1 || frame_start > frame_end {
        return chunks;
    }

    let mut f = frame_start;
    while f <= frame_end {
        chunks.push(ChunkRange::new(f, (f + chunk_size - 1).min(frame_end)));
        f += chunk_size;
    }
    chunks
}

// --- Dispatch table ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    Pending,
    Assigned,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchChunk {
    pub frame_start: i32,
    pub frame_end: i32,
    pub state: ChunkState,
    #[serde(default)]
    pub assigned_to: String,
    #[serde(default)]
    pub assigned_at_ms: i64,
    #[serde(default)]
    pub completed_at_ms: i64,
    #[serde(default)]
    pub retry_count: u32,
}

impl DispatchChunk {
    pub fn new(range: ChunkRange) -> Self {
        Self {
            frame_start: range.frame_start,
            frame_end: range.frame_end,
            state: ChunkState::Pending,
            assigned_to: String::new(),
            assigned_at_ms: 0,
            completed_at_ms: 0,
            retry_count: 0,
        }
    }

    pub fn range(&self) -> ChunkRange {
        ChunkRange::new(self.frame_start, self.frame_end)
    }

    pub fn matches(&self, range: &ChunkRange) -> bool {
        self.frame_start == range.frame_start && self.frame_end == range.frame_end
    }

    /// Back to pending with assignment fields cleared. `retry_count` is
    /// untouched; the caller decides whether the revert counts as a retry.
    pub fn revert_to_pending(&mut self) {
        self.state = ChunkState::Pending;
        self.assigned_to.clear();
        self.assigned_at_ms = 0;
    }
}

/// Mutable chunk table under `jobs/<id>/dispatch.json`; the coordinator is
/// its only writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchTable {
    #[serde(rename = "_version", default = "default_version")]
    pub version: u32,
    pub coordinator_id: String,
    pub updated_at_ms: i64,
    pub chunks: Vec<DispatchChunk>,
}

impl DispatchTable {
    pub fn for_manifest(coordinator_id: &str, manifest: &JobManifest, now_ms: i64) -> Self {
        let chunks = compute_chunks(manifest.frame_start, manifest.frame_end, manifest.chunk_size)
            .into_iter()
            .map(DispatchChunk::new)
            .collect();
        Self {
            version: 1,
            coordinator_id: coordinator_id.to_string(),
            updated_at_ms: now_ms,
            chunks,
        }
    }

    pub fn chunk_mut(&mut self, range: &ChunkRange) -> Option<&mut DispatchChunk> {
        self.chunks.iter_mut().find(|c| c.matches(range))
    }

    /// True when no chunk remains unfinished. An empty table (degenerate
    /// frame range) counts as complete.
    pub fn all_completed(&self) -> bool {
        self.chunks.iter().all(|c| c.state == ChunkState::Completed)
    }
}
