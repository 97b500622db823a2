//! Read-only tmux adapter.
//!
//! Surfaces pre-existing tmux sessions in listings and lets a client attach
//! to one through a daemon-spawned `tmux attach-session` PTY. The daemon
//! never owns the tmux sessions themselves; the attach child is owned by the
//! requesting client and killed when it detaches.
//!
//! All tmux invocations run under a short timeout. A timeout, a missing
//! binary, or "no server running" are all an empty listing, never a fatal
//! error.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;

use crate::session::{PtySession, SessionError, SpawnCommand, SpawnOptions};
use protocol::{SessionInfo, SessionSource, SessionStatus};

/// Namespace prefix for tmux attach targets.
pub const TMUX_TARGET_PREFIX: &str = "tmux:";

/// Timeout applied to every tmux command invocation.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(3);

/// An unexpected tmux adapter failure (surfaced as `LIST_ERROR`).
#[derive(Debug, Error)]
pub enum TmuxError {
    #[error("tmux invocation failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Read-only view of the local tmux server.
pub struct TmuxProvider {
    scrollback_lines: usize,
}

impl TmuxProvider {
    pub fn new(scrollback_lines: usize) -> Self {
        Self { scrollback_lines }
    }

    /// Splits a `tmux:<name>` target into its session name.
    pub fn target_name(target: &str) -> Option<&str> {
        target
            .strip_prefix(TMUX_TARGET_PREFIX)
            .filter(|name| !name.is_empty())
    }

    /// Names of the tmux sessions currently running, if any.
    ///
    /// Timeouts and an absent/idle tmux server yield an empty listing; only
    /// genuinely unexpected I/O failures propagate.
    pub async fn list_sessions(&self) -> Result<Vec<String>, TmuxError> {
        let output = Command::new("tmux")
            .args(["list-sessions", "-F", "#{session_name}"])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(COMMAND_TIMEOUT, output).await {
            Err(_) => {
                tracing::warn!("tmux list-sessions timed out, treating as empty");
                return Ok(Vec::new());
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Ok(Err(e)) => return Err(TmuxError::Io(e)),
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            // Exit status 1 with no server running is the common case.
            return Ok(Vec::new());
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }

    /// Listing entries for the running tmux sessions.
    pub async fn list_info(&self) -> Result<Vec<SessionInfo>, TmuxError> {
        Ok(self
            .list_sessions()
            .await?
            .into_iter()
            .map(|name| SessionInfo {
                id: format!("{TMUX_TARGET_PREFIX}{name}"),
                name,
                status: SessionStatus::Running,
                attached_clients: 0,
                source: SessionSource::Tmux,
            })
            .collect())
    }

    /// Recent scrollback of a tmux session as terminal-ready bytes.
    /// Best effort: any failure is an empty capture.
    pub async fn capture_scrollback(&self, name: &str) -> Vec<u8> {
        let start = format!("-{}", self.scrollback_lines);
        let output = Command::new("tmux")
            .args(["capture-pane", "-p", "-e", "-t", name, "-S", &start])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(COMMAND_TIMEOUT, output).await {
            Ok(Ok(output)) if output.status.success() => crlf_normalize(&output.stdout),
            Ok(Ok(output)) => {
                tracing::debug!(
                    session = name,
                    status = ?output.status,
                    "tmux capture-pane failed"
                );
                Vec::new()
            }
            Ok(Err(e)) => {
                tracing::debug!(session = name, error = %e, "tmux capture-pane failed");
                Vec::new()
            }
            Err(_) => {
                tracing::warn!(session = name, "tmux capture-pane timed out");
                Vec::new()
            }
        }
    }

    /// Spawns a client-owned PTY running `tmux attach-session -t <name>`.
    pub fn attach(
        &self,
        name: &str,
        cols: u16,
        rows: u16,
    ) -> Result<Arc<PtySession>, SessionError> {
        PtySession::spawn(SpawnOptions {
            name: name.to_string(),
            command: SpawnCommand::Program {
                program: "tmux".to_string(),
                args: vec![
                    "attach-session".to_string(),
                    "-t".to_string(),
                    name.to_string(),
                ],
            },
            cols,
            rows,
            id: None,
            max_buffer_bytes: None,
            env: Vec::new(),
            source: SessionSource::Tmux,
        })
    }
}

/// `capture-pane -p` emits bare newlines; terminals want CRLF.
fn crlf_normalize(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 16);
    for &byte in data {
        if byte == b'\n' {
            out.extend_from_slice(b"\r\n");
        } else {
            out.push(byte);
        }
    }
    out
}
