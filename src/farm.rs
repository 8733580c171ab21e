//! Farm-root bootstrap.
//!
//! The farm root is `<sync_root>/SmallRender-v1/`. The first node to start
//! creates the full layout and stamps `farm.json`; every node ensures its
//! own subdirectories on startup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;

use crate::config::{APP_VERSION, PROTOCOL_VERSION};
use crate::logging::MonitorLog;
use crate::{now_ms, storage, FarmError, Result};

pub const FARM_DIR_NAME: &str = "SmallRender-v1";

/// Create or join the farm under `sync_root`; returns the farm path.
pub fn init(
    sync_root: &Path,
    node_id: &str,
    log: &Arc<MonitorLog>,
) -> Result<PathBuf> {
    if !sync_root.is_dir() {
        return Err(FarmError::InvalidSyncRoot(sync_root.to_path_buf()));
    }

    let farm_path = sync_root.join(FARM_DIR_NAME);
    let first_node = !farm_path.exists();

    if first_node {
        log.info("farm", format!("Creating farm structure at: {}", farm_path.display()));

        std::fs::create_dir_all(farm_path.join("nodes"))?;
        std::fs::create_dir_all(farm_path.join("jobs"))?;
        std::fs::create_dir_all(farm_path.join("commands"))?;
        std::fs::create_dir_all(farm_path.join("templates").join("examples"))?;
        std::fs::create_dir_all(farm_path.join("submissions").join("processed"))?;

        let farm_json = json!({
            "_version": 1,
            "protocol_version": PROTOCOL_VERSION,
            "created_by": node_id,
            "created_at_ms": now_ms(),
            "last_example_update": APP_VERSION,
        });
        storage::write_json(&farm_path.join("farm.json"), &farm_json)?;

        copy_example_templates(&farm_path, log);
        log.info("farm", "Farm created");
    } else if let Some(mut farm_json) = storage::read_json_value(&farm_path.join("farm.json")) {
        let last_update = farm_json
            .get("last_example_update")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        if last_update != APP_VERSION {
            log.info(
                "farm",
                format!("Updating example templates ({last_update} -> {APP_VERSION})"),
            );
            copy_example_templates(&farm_path, log);
            farm_json["last_example_update"] = json!(APP_VERSION);
            storage::write_json(&farm_path.join("farm.json"), &farm_json)?;
        }
    }

    // Always ensure this node's own directories.
    std::fs::create_dir_all(farm_path.join("nodes").join(node_id))?;
    std::fs::create_dir_all(farm_path.join("commands").join(node_id).join("processed"))?;

    Ok(farm_path)
}

/// Copy bundled example templates from `resources/templates` next to the
/// executable into `templates/examples/`. Missing bundle is not an error;
/// a source checkout or stripped install simply ships without examples.
fn copy_example_templates(farm_path: &Path, log: &Arc<MonitorLog>) {
    let Some(bundled) = bundled_templates_dir() else {
        log.warn("farm", "No bundled templates found, skipping example copy");
        return;
    };

    let dest_dir = farm_path.join("templates").join("examples");
    let Ok(entries) = std::fs::read_dir(&bundled) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_none_or(|e| e != "json") {
            continue;
        }
        let Some(name) = path.file_name() else {
            continue;
        };
        match std::fs::copy(&path, dest_dir.join(name)) {
            Ok(_) => log.info("farm", format!("Copied template: {}", name.to_string_lossy())),
            Err(e) => log.warn("farm", format!("Failed to copy template {}: {e}", name.to_string_lossy())),
        }
    }
}

fn bundled_templates_dir() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let dir = exe.parent()?.join("resources").join("templates");
    dir.is_dir().then_some(dir)
}
