//! Stable node identity and one-shot system survey.

use std::path::Path;

use rand::RngCore;

use crate::storage;

/// Hardware and platform details queried once at startup and carried on
/// every heartbeat.
#[derive(Debug, Clone, Default)]
pub struct SystemInfo {
    pub hostname: String,
    pub cpu_cores: u32,
    pub ram_mb: u64,
    pub gpu_name: String,
    pub os: String,
}

impl SystemInfo {
    pub fn query() -> Self {
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();

        Self {
            hostname: sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string()),
            cpu_cores: num_cpus::get() as u32,
            ram_mb: sys.total_memory() / (1024 * 1024),
            // GPU enumeration needs a platform graphics API; left blank
            // where none is wired up. Peers render it as "n/a".
            gpu_name: String::new(),
            os: os_name().to_string(),
        }
    }
}

/// The running platform as it appears in manifests and heartbeats.
pub fn os_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "windows"
    } else if cfg!(target_os = "macos") {
        "macos"
    } else {
        "linux"
    }
}

#[derive(Debug, Clone)]
pub struct NodeIdentity {
    node_id: String,
    system: SystemInfo,
}

impl NodeIdentity {
    /// Load the persisted node id from `node_id.txt`, generating and
    /// persisting a fresh one when the file is missing or malformed.
    pub fn load_or_generate(app_data_dir: &Path) -> Self {
        let id_path = app_data_dir.join("node_id.txt");

        let node_id = match storage::read_text(&id_path) {
            Some(text) => {
                let id = text.trim().to_string();
                if is_valid_node_id(&id) {
                    tracing::info!(node_id = %id, "Loaded node identity");
                    id
                } else {
                    tracing::warn!(node_id = %id, "Malformed node_id.txt, regenerating");
                    generate_and_persist(&id_path)
                }
            }
            None => generate_and_persist(&id_path),
        };

        Self {
            node_id,
            system: SystemInfo::query(),
        }
    }

    /// Build an identity without touching the filesystem (tests).
    pub fn with_id(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            system: SystemInfo {
                hostname: "test-host".to_string(),
                cpu_cores: 4,
                ram_mb: 8192,
                gpu_name: String::new(),
                os: os_name().to_string(),
            },
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn system(&self) -> &SystemInfo {
        &self.system
    }
}

pub fn generate_node_id() -> String {
    let mut bytes = [0u8; 6];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn is_valid_node_id(id: &str) -> bool {
    id.len() == 12 && id.chars().all(|c| c.is_ascii_hexdigit())
}

fn generate_and_persist(id_path: &Path) -> String {
    let id = generate_node_id();
    if let Some(parent) = id_path.parent() {
        storage::ensure_dir(parent);
    }
    if let Err(e) = storage::write_text(id_path, &id) {
        tracing::error!(error = %e, "Failed to persist node_id.txt");
    } else {
        tracing::info!(node_id = %id, "Generated new node identity");
    }
    id
}
