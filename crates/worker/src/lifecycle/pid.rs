//! PID file management.
//!
//! The file carries JSON (`{pid, port, startedAt}`) so hooks can find the
//! running worker's port, and the handle holds an `fs2` exclusive lock as
//! the last-line single-instance guard. It is written only after the HTTP
//! listener has bound - a crash before that leaves no file behind.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use cm_domain::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PidFileContents {
    pub pid: u32,
    pub port: u16,
    /// ISO-8601 start time.
    pub started_at: String,
}

/// Keeps the advisory lock alive for the worker's lifetime.
pub struct PidFileGuard {
    path: PathBuf,
    _file: File,
}

/// Read a PID file if present and parseable.
pub fn read_pid_file(path: &Path) -> Option<PidFileContents> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Write our PID/port and take the exclusive lock.
pub fn write_pid_file(path: &Path, port: u16) -> Result<PidFileGuard> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(path)?;

    file.try_lock_exclusive().map_err(|_| {
        Error::Conflict(format!(
            "another worker holds the PID file lock at {}",
            path.display()
        ))
    })?;

    let contents = PidFileContents {
        pid: std::process::id(),
        port,
        started_at: chrono::Utc::now().to_rfc3339(),
    };
    {
        let mut writer = &file;
        writer.write_all(serde_json::to_string_pretty(&contents)?.as_bytes())?;
        writer.flush()?;
    }

    tracing::info!(path = %path.display(), pid = contents.pid, port, "PID file written");
    Ok(PidFileGuard {
        path: path.to_path_buf(),
        _file: file,
    })
}

/// Remove the PID file; the lock releases when the guard drops.
pub fn remove_pid_file(guard: PidFileGuard) {
    if let Err(e) = std::fs::remove_file(&guard.path) {
        tracing::warn!(path = %guard.path.display(), error = %e, "failed to remove PID file");
    } else {
        tracing::info!(path = %guard.path.display(), "PID file removed");
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
