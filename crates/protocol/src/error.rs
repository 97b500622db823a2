//! Wire error codes.
//!
//! Every recoverable failure crossing the WebSocket becomes an `error` frame
//! carrying one of these codes. They never change the client's state machine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable error codes carried in `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Unparseable frame, or a frame missing `type`/`seq`.
    #[error("unparseable frame")]
    ParseError,

    /// The attach target is not in the store or the tmux listing.
    #[error("session not found")]
    SessionNotFound,

    /// The attach target's child process has already exited.
    #[error("session has exited")]
    SessionExited,

    /// `attach` while already attached.
    #[error("already attached")]
    AlreadyAttached,

    /// `input`, `resize`, or `detach` while browsing.
    #[error("not attached")]
    NotAttached,

    /// Spawning the session's child process failed.
    #[error("session creation failed")]
    CreateFailed,

    /// The tmux adapter raised an unexpected error while listing.
    #[error("session listing failed")]
    ListError,

    /// The tmux attach process could not be spawned.
    #[error("tmux attach failed")]
    AttachFailed,
}
