//! Job templates and manifest baking.
//!
//! A template describes how to invoke a renderer: its OS-dispatch table,
//! flag schema, progress regexes, and job defaults. Baking resolves a
//! template plus user inputs into an immutable manifest.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::logging::MonitorLog;
use crate::{now_ms, storage};

use super::types::{JobManifest, JobTemplate, ManifestFlag};

const SCAN_COOLDOWN: Duration = Duration::from_secs(5);

struct ScanState {
    templates: Vec<JobTemplate>,
    last_scan: Option<Instant>,
}

pub struct TemplateStore {
    farm_path: PathBuf,
    log: Arc<MonitorLog>,
    state: Mutex<ScanState>,
}

impl TemplateStore {
    pub fn new(farm_path: &Path, log: Arc<MonitorLog>) -> Arc<Self> {
        Arc::new(Self {
            farm_path: farm_path.to_path_buf(),
            log,
            state: Mutex::new(ScanState {
                templates: Vec::new(),
                last_scan: None,
            }),
        })
    }

    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        self.scan_once();

        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                }
                let due = {
                    let state = store.state.lock();
                    state.last_scan.is_none_or(|t| t.elapsed() >= SCAN_COOLDOWN)
                };
                if due {
                    store.scan_once();
                }
            }
        });
    }

    /// Load `templates/examples/` then `templates/`; a user template
    /// shadows an example with the same template_id.
    pub fn scan_once(&self) {
        let mut templates = Vec::new();
        self.load_dir(
            &self.farm_path.join("templates").join("examples"),
            true,
            &mut templates,
        );
        self.load_dir(&self.farm_path.join("templates"), false, &mut templates);

        let user_ids: Vec<String> = templates
            .iter()
            .filter(|t| !t.is_example)
            .map(|t| t.template_id.clone())
            .collect();
        templates.retain(|t| !(t.is_example && user_ids.contains(&t.template_id)));

        let mut state = self.state.lock();
        state.templates = templates;
        state.last_scan = Some(Instant::now());
    }

    fn load_dir(&self, dir: &Path, is_example: bool, out: &mut Vec<JobTemplate>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() || path.extension().is_none_or(|e| e != "json") {
                continue;
            }

            match storage::read_json::<JobTemplate>(&path) {
                Some(mut tmpl) => {
                    tmpl.is_example = is_example;
                    validate_template(&mut tmpl);
                    out.push(tmpl);
                }
                None => {
                    // Surface the broken file instead of hiding it.
                    let stem = path
                        .file_stem()
                        .map(|s| s.to_string_lossy().to_string())
                        .unwrap_or_default();
                    self.log
                        .error("farm", format!("Failed to parse template: {}", path.display()));
                    out.push(JobTemplate {
                        template_id: stem.clone(),
                        name: stem,
                        valid: false,
                        validation_error: "Failed to parse JSON".to_string(),
                        is_example,
                        ..Default::default()
                    });
                }
            }
        }
    }

    pub fn template_snapshot(&self) -> Vec<JobTemplate> {
        self.state.lock().templates.clone()
    }

    pub fn find_valid(&self, template_id: &str) -> Option<JobTemplate> {
        self.state
            .lock()
            .templates
            .iter()
            .find(|t| t.template_id == template_id && t.valid)
            .cloned()
    }
}

pub fn validate_template(tmpl: &mut JobTemplate) -> bool {
    tmpl.valid = true;
    tmpl.validation_error.clear();

    if tmpl.template_id.is_empty() {
        tmpl.valid = false;
        tmpl.validation_error = "Missing template_id".to_string();
    } else if tmpl.name.is_empty() {
        tmpl.valid = false;
        tmpl.validation_error = "Missing name".to_string();
    } else if tmpl.cmd.windows.is_empty() && tmpl.cmd.linux.is_empty() && tmpl.cmd.macos.is_empty()
    {
        tmpl.valid = false;
        tmpl.validation_error = "No executable path for any OS".to_string();
    }

    tmpl.valid
}

// --- Pattern resolution ---

/// Expand a `default_pattern` into a concrete string. Pure: output depends
/// only on the template, the flag values, and the reference clock.
pub fn resolve_pattern(
    pattern: &str,
    tmpl: &JobTemplate,
    flag_values: &[String],
    now: DateTime<Local>,
) -> String {
    let mut result = pattern.to_string();

    result = result.replace("{frame_pad}", &tmpl.frame_padding);

    // {project_dir} / {file_name} come from the first file-typed flag.
    if let Some((i, _)) = tmpl
        .flags
        .iter()
        .enumerate()
        .find(|(_, f)| f.flag_type == "file")
    {
        let file_value = flag_values.get(i).map(String::as_str).unwrap_or("");
        let (project_dir, file_name) = if file_value.is_empty() {
            (String::new(), String::new())
        } else {
            let p = Path::new(file_value);
            (
                p.parent()
                    .map(|d| d.to_string_lossy().to_string())
                    .unwrap_or_default(),
                p.file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default(),
            )
        };
        result = result.replace("{project_dir}", &project_dir);
        result = result.replace("{file_name}", &file_name);
    }

    for (i, flag) in tmpl.flags.iter().enumerate() {
        if !flag.id.is_empty() {
            let token = format!("{{flag:{}}}", flag.id);
            let value = flag_values.get(i).map(String::as_str).unwrap_or("");
            result = result.replace(&token, value);
        }
    }

    result = result.replace("{date:YYYYMMDD}", &now.format("%Y%m%d").to_string());
    result = result.replace("{date:YYYY}", &now.format("%Y").to_string());
    result = result.replace("{date:MM}", &now.format("%m").to_string());
    result = result.replace("{date:DD}", &now.format("%d").to_string());
    result = result.replace("{time:HHmm}", &now.format("%H%M").to_string());
    result = result.replace("{time:HH}", &now.format("%H").to_string());
    result = result.replace("{time:mm}", &now.format("%M").to_string());

    // Cleanup pass: tokens that resolved to empty leave separator
    // artifacts behind ("shot-/v1" -> "shot/v1").
    result = result.replace("-/", "/");
    result = result.replace("-\\", "\\");
    result = result.replace("-_", "_");
    result = result.replace("_-", "_");
    result = result.replace("--", "-");

    result
}

// --- Slug generation ---

/// Filesystem-safe job identifier: lowercase, `[a-z0-9_]` kept, everything
/// else dashed, dashes collapsed and trimmed, 64 chars max. Collisions get
/// `-2`..`-99`; beyond that the submission fails.
pub fn generate_slug(job_name: &str, jobs_dir: &Path) -> Option<String> {
    let mut slug = String::with_capacity(job_name.len());
    for ch in job_name.chars() {
        let lower = ch.to_ascii_lowercase();
        if lower.is_ascii_alphanumeric() || lower == '_' {
            slug.push(lower);
        } else {
            slug.push('-');
        }
    }

    let mut collapsed = String::with_capacity(slug.len());
    let mut last_dash = false;
    for ch in slug.chars() {
        if ch == '-' {
            if !last_dash {
                collapsed.push(ch);
            }
            last_dash = true;
        } else {
            collapsed.push(ch);
            last_dash = false;
        }
    }
    let mut slug = collapsed.trim_matches('-').to_string();
    slug.truncate(64);

    if slug.is_empty() {
        return None;
    }

    if !jobs_dir.join(&slug).exists() {
        return Some(slug);
    }
    for n in 2..=99 {
        let candidate = format!("{slug}-{n}");
        if !jobs_dir.join(&candidate).exists() {
            return Some(candidate);
        }
    }
    None
}

// --- Manifest baking ---

#[allow(clippy::too_many_arguments)]
pub fn bake_manifest(
    tmpl: &JobTemplate,
    flag_values: &[String],
    cmd_for_my_os: &str,
    job_slug: &str,
    frame_start: i32,
    frame_end: i32,
    chunk_size: i32,
    max_retries: u32,
    timeout_seconds: Option<u64>,
    node_id: &str,
    os: &str,
) -> JobManifest {
    let mut m = JobManifest {
        version: 1,
        job_id: job_slug.to_string(),
        template_id: tmpl.template_id.clone(),
        submitted_by: node_id.to_string(),
        submitted_os: os.to_string(),
        submitted_at_ms: now_ms(),
        ..Default::default()
    };

    // All OS paths from the template; the submitter's OS gets the
    // user-supplied executable.
    if !tmpl.cmd.windows.is_empty() {
        m.cmd.insert("windows".to_string(), tmpl.cmd.windows.clone());
    }
    if !tmpl.cmd.linux.is_empty() {
        m.cmd.insert("linux".to_string(), tmpl.cmd.linux.clone());
    }
    if !tmpl.cmd.macos.is_empty() {
        m.cmd.insert("macos".to_string(), tmpl.cmd.macos.clone());
    }
    m.cmd.insert(os.to_string(), cmd_for_my_os.to_string());

    // Flags, with user-edited values for editable ones. An empty optional
    // positional is elided along with a preceding standalone flag whose
    // sole role is to introduce it.
    let mut i = 0usize;
    while i < tmpl.flags.len() {
        let tf = &tmpl.flags[i];

        if !tf.flag.is_empty() && tf.value.is_none() && !tf.editable && i + 1 < tmpl.flags.len() {
            let next = &tmpl.flags[i + 1];
            if next.flag.is_empty() && next.editable && !next.required {
                let next_val = flag_values.get(i + 1).map(String::as_str).unwrap_or("");
                if next_val.is_empty() {
                    i += 2;
                    continue;
                }
            }
        }

        if tf.flag.is_empty() && tf.editable && !tf.required {
            let val = flag_values.get(i).map(String::as_str).unwrap_or("");
            if val.is_empty() {
                i += 1;
                continue;
            }
        }

        let value = if tf.editable && i < flag_values.len() {
            Some(flag_values[i].clone())
        } else {
            tf.value.clone()
        };

        m.flags.push(ManifestFlag {
            flag: tf.flag.clone(),
            value,
        });
        i += 1;
    }

    // Output directory: parent of the first output-typed flag's value.
    for (i, tf) in tmpl.flags.iter().enumerate() {
        if tf.flag_type == "output" {
            if let Some(val) = flag_values.get(i).filter(|v| !v.is_empty()) {
                if let Some(parent) = Path::new(val).parent() {
                    let parent = parent.to_string_lossy().to_string();
                    if !parent.is_empty() {
                        m.output_dir = Some(parent);
                    }
                }
            }
            break;
        }
    }

    m.frame_start = frame_start;
    m.frame_end = frame_end;
    m.chunk_size = chunk_size;
    m.max_retries = max_retries;
    m.timeout_seconds = timeout_seconds;

    m.progress = tmpl.progress.clone();
    m.output_detection = tmpl.output_detection.clone();
    m.process = tmpl.process.clone();
    m.environment = tmpl.environment.clone();
    m.tags_required = tmpl.tags_required.clone();

    m
}
