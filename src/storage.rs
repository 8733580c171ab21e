//! Atomic file store for the farm root.
//!
//! Every persisted record is written to `<path>.tmp`, flushed, and renamed
//! into place so that readers on a byte-copying sync layer never observe a
//! partial file. Reads are tolerant: a missing, unreadable, or unparsable
//! file is reported as absent, never as an error across the component
//! boundary.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::Result;

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)
}

/// Read and parse a JSON file. Returns `None` when the file does not exist
/// or does not parse (a half-synced file looks the same as a missing one).
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(_) => return None,
    };
    match serde_json::from_slice(&bytes) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Unparsable JSON file");
            None
        }
    }
}

/// Untyped variant of [`read_json`] for records that are inspected field by
/// field before a full parse.
pub fn read_json_value(path: &Path) -> Option<serde_json::Value> {
    read_json(path)
}

/// Atomically replace `path` with raw text.
pub fn write_text(path: &Path, content: &str) -> Result<()> {
    write_atomic(path, content.as_bytes())
}

/// Read a text file, absent on any failure.
pub fn read_text(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok()
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = tmp_path(path);
    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn tmp_path(path: &Path) -> std::path::PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    os.into()
}

/// `create_dir_all` that only logs on failure. Directory creation on the
/// sync layer races with peers doing the same thing; the subsequent write
/// is what actually reports the problem.
pub fn ensure_dir(path: &Path) {
    if let Err(e) = fs::create_dir_all(path) {
        tracing::warn!(path = %path.display(), error = %e, "Failed to create directory");
    }
}
