//! PID file bookkeeping.
//!
//! The daemon claims a PID file at startup and holds it for the life of the
//! process; dropping the handle removes the file. The file is advisory, not
//! load-bearing: a file left behind by a crashed daemon reads as unowned and
//! is silently replaced on the next claim.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Failures while claiming the PID file.
#[derive(Debug, Error)]
pub enum PidFileError {
    /// A live daemon already owns the file.
    #[error("another daemon is already running with PID {0}")]
    AlreadyRunning(u32),

    /// The file could not be written.
    #[error("failed to write PID file: {0}")]
    Io(#[from] io::Error),
}

/// Ownership of the daemon PID file; removed on drop.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Default location: `terminalsync/daemon.pid` under the user's local
    /// data directory (`$XDG_DATA_HOME` or `~/.local/share`).
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("terminalsync")
            .join("daemon.pid")
    }

    /// Claims the default PID file.
    pub fn acquire() -> Result<Self, PidFileError> {
        Self::acquire_at(Self::default_path())
    }

    /// Claims `path`: refuses when a live daemon holds it, replaces stale or
    /// malformed leftovers, and records the current process id.
    pub fn acquire_at(path: PathBuf) -> Result<Self, PidFileError> {
        if let Some(pid) = live_owner(&path) {
            return Err(PidFileError::AlreadyRunning(pid));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, format!("{}\n", std::process::id()))?;

        tracing::debug!(path = %path.display(), "PID file claimed");
        Ok(Self { path })
    }

    /// Where the claimed file lives.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// The PID recorded in `path`, provided that process is still alive.
/// Unreadable, malformed, and stale files all read as unowned.
fn live_owner(path: &Path) -> Option<u32> {
    let pid = fs::read_to_string(path).ok()?.trim().parse::<u32>().ok()?;
    process_alive(pid).then_some(pid)
}

fn process_alive(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        fs::metadata(format!("/proc/{pid}")).is_ok()
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    {
        // Signal 0 probes for existence without delivering anything.
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}
