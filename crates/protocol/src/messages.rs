//! Protocol message definitions for TerminalSync.
//!
//! All control traffic is JSON over WebSocket text frames. Every frame is an
//! envelope carrying a `type` discriminator, a `seq` number, and a `payload`
//! object; the message enums below are tagged variants over exactly those
//! shapes, so an unknown `type` or a malformed payload fails deserialization
//! instead of reaching a handler.

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;

/// A frame received from a client.
///
/// `seq` is chosen by the client and echoed verbatim in the reply. A frame
/// missing `type` or `seq` does not deserialize and is answered with
/// `PARSE_ERROR`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClientFrame {
    /// Client-chosen sequence number, echoed in the reply.
    pub seq: u64,
    /// The request itself.
    #[serde(flatten)]
    pub msg: ClientMessage,
}

/// All client→server message types.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Request the merged managed + tmux session listing.
    ListSessions {},
    /// Create a new managed session.
    CreateSession { name: String, cols: u16, rows: u16 },
    /// Attach to a session (managed id or `tmux:<name>`).
    ///
    /// `cols`/`rows` are a resize hint; non-positive dimensions leave the
    /// session size untouched.
    Attach { target: String, cols: u16, rows: u16 },
    /// Keystrokes for the attached session.
    Input { data: String },
    /// Resize the attached session.
    Resize { cols: u16, rows: u16 },
    /// Detach from the attached session.
    Detach {},
}

/// A frame sent to a client.
///
/// Replies mirror the request's `seq`; unsolicited pushes use `seq = 0`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerFrame {
    pub seq: u64,
    #[serde(flatten)]
    pub msg: ServerMessage,
}

impl ServerFrame {
    /// A reply carrying the request's sequence number.
    pub fn reply(seq: u64, msg: ServerMessage) -> Self {
        Self { seq, msg }
    }

    /// A server-initiated push (`seq = 0`).
    pub fn push(msg: ServerMessage) -> Self {
        Self { seq: 0, msg }
    }
}

/// All server→client message types.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Reply to `list_sessions`.
    SessionList { sessions: Vec<SessionInfo> },
    /// Reply to `create_session`.
    SessionCreated { id: String, name: String },
    /// Push: a session left the store.
    SessionRemoved { id: String },
    /// Reply to `attach`; `cols`/`rows` are the session's current size.
    Attached { target: String, cols: u16, rows: u16 },
    /// Push: the attached session's size changed.
    Resized { cols: u16, rows: u16 },
    /// Reply to `detach`, or push on session exit / error.
    Detached {
        reason: DetachReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Reply on any failure.
    Error { code: ErrorCode, message: String },
}

/// Why a client left the ATTACHED state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetachReason {
    /// The client asked to detach.
    ClientRequest,
    /// The session's child process exited.
    SessionExit,
    /// The attachment failed irrecoverably.
    Error,
}

/// One entry in a `session_list` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Opaque session id (`tmux:<name>` for adapter-surfaced sessions).
    pub id: String,
    /// Human-readable name; tracks the terminal window title.
    pub name: String,
    /// Whether the child is still running.
    pub status: SessionStatus,
    /// Number of currently attached clients.
    #[serde(rename = "attachedClients")]
    pub attached_clients: usize,
    /// Who owns the underlying terminal.
    pub source: SessionSource,
}

/// Lifecycle state of a listed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Exited,
}

/// Origin of a listed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionSource {
    /// Created and owned by the daemon.
    Managed,
    /// Surfaced by the tmux adapter; the daemon does not own it.
    Tmux,
}
