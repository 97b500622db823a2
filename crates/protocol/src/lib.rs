//! # TerminalSync Protocol Library
//!
//! This crate defines the wire protocol spoken between the TerminalSync
//! daemon and its viewers. One WebSocket carries two frame kinds:
//!
//! - **Text frames** hold a JSON envelope `{ "type", "seq", "payload" }`.
//!   `seq` is a positive, monotonically increasing integer chosen by the
//!   client; server replies echo the request's `seq`, server-initiated
//!   pushes use `seq = 0`.
//! - **Binary frames** are raw PTY output bytes with no further framing,
//!   sent server→client only while the client is attached.
//!
//! Parse failures are a first-class value ([`ErrorCode::ParseError`]), not an
//! exception path: the daemon answers them with an `error` frame and keeps
//! the connection open.

pub mod error;
pub mod messages;

pub use error::ErrorCode;
pub use messages::{
    ClientFrame, ClientMessage, DetachReason, ServerFrame, ServerMessage, SessionInfo,
    SessionSource, SessionStatus,
};

/// WebSocket close codes used by the daemon.
pub mod close {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Server is shutting down.
    pub const GOING_AWAY: u16 = 1001;
    /// The concurrent client cap was reached; try again later.
    pub const OVERLOADED: u16 = 1013;
}
