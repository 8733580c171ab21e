use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use smallrender::config::Config;
use smallrender::identity::NodeIdentity;
use smallrender::logging::MonitorLog;
use smallrender::node::NodeRuntime;
use smallrender::shutdown::install_shutdown_handler;
use smallrender::{storage, FarmError};

#[derive(Parser, Debug)]
#[command(name = "smallrender")]
#[command(about = "Render farm node over a shared synchronizing filesystem", version)]
struct Args {
    /// Start without opening any interactive surface (kept for parity with
    /// GUI launchers; the headless node always runs this way).
    #[arg(long)]
    minimized: bool,

    /// Single-shot job submission, then hand off to the running instance.
    #[arg(long)]
    submit: bool,

    /// Scene file to submit (with --submit).
    #[arg(long)]
    file: Option<PathBuf>,

    /// Template id for the submission (with --submit).
    #[arg(long)]
    template: Option<String>,
}

fn app_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SMALLRENDER_DATA_DIR") {
        return PathBuf::from(dir);
    }
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg).join("smallrender");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local/share/smallrender");
    }
    PathBuf::from(".smallrender")
}

/// Take the per-host instance lock. Returns the held lock file, or None
/// when another instance already owns it.
fn acquire_instance_lock(app_data: &std::path::Path) -> Option<File> {
    storage::ensure_dir(app_data);
    let lock_path = app_data.join("instance.lock");
    let file = match File::create(&lock_path) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(error = %e, "Cannot open instance lock, assuming single instance");
            return File::open(&lock_path).ok();
        }
    };

    match file.try_lock() {
        Ok(()) => Some(file),
        Err(std::fs::TryLockError::WouldBlock) => None,
        Err(std::fs::TryLockError::Error(e)) => {
            // Filesystems without lock support still get a running node.
            tracing::warn!(error = %e, "Instance lock unsupported, continuing");
            Some(file)
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let app_data = app_data_dir();

    let instance_lock = acquire_instance_lock(&app_data);

    if instance_lock.is_none() {
        // Another instance runs on this host. For a submission, hand it
        // off through the rendezvous file; otherwise refuse to start.
        if args.submit {
            let Some(file) = &args.file else {
                eprintln!("--submit requires --file <path>");
                std::process::exit(1);
            };
            let request = json!({
                "file": file.to_string_lossy(),
                "template_id": args.template.clone().unwrap_or_default(),
            });
            if let Err(e) = storage::write_json(&app_data.join("submit_request.json"), &request) {
                eprintln!("Failed to hand off submission: {e}");
                std::process::exit(1);
            }
            println!("Submission handed off to the running instance");
            std::process::exit(0);
        }
        eprintln!("smallrender is already running on this host");
        std::process::exit(1);
    }

    let config_path = app_data.join("config.json");
    let config = Config::load(&config_path);
    let identity = NodeIdentity::load_or_generate(&app_data);
    let log = Arc::new(MonitorLog::new());

    tracing::info!(
        node_id = identity.node_id(),
        coordinator = config.is_coordinator,
        sync_root = %config.sync_root,
        minimized = args.minimized,
        "Starting smallrender node"
    );

    let cancel = install_shutdown_handler();

    // A misconfigured sync root keeps the process alive so the operator
    // can fix config.json without losing the node.
    let runtime = loop {
        match NodeRuntime::start(
            config.clone(),
            identity.clone(),
            app_data.clone(),
            Arc::clone(&log),
            cancel.clone(),
        )
        .await
        {
            Ok(runtime) => break runtime,
            Err(e @ FarmError::InvalidSyncRoot(_)) => {
                tracing::error!(
                    error = %e,
                    config = %config_path.display(),
                    "Farm init failed; fix sync_root in config.json (retrying in 10s)"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(10)) => continue,
                }
            }
            Err(e) => {
                eprintln!("Failed to start node: {e}");
                std::process::exit(1);
            }
        }
    };

    if args.submit {
        match &args.file {
            Some(file) => runtime.submit_file(
                &file.to_string_lossy(),
                args.template.as_deref().unwrap_or(""),
            ),
            None => {
                eprintln!("--submit requires --file <path>");
                std::process::exit(1);
            }
        }
    }

    runtime.run(cancel).await;
    drop(instance_lock);
}
