//! # TerminalSync Daemon Library
//!
//! This crate implements the TerminalSync daemon: a long-running process
//! that shares local shell sessions over the network. Remote viewers see the
//! live byte stream of an interactive terminal and can send keystrokes and
//! resize events back.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Gateway                             │
//! │        /health  ·  static assets  ·  /ws (token gate)        │
//! ├──────────────────────────────────────────────────────────────┤
//! │   SessionManager ── client cap · idle-shutdown scheduler     │
//! │        │                                                     │
//! │   ClientSession ── BROWSING ↔ ATTACHED state machine         │
//! │        │                                                     │
//! │   SessionStore ── PtySession (ring buffer + typed events)    │
//! │                      └─ TmuxProvider (read-only adapter)     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Data flow for a live byte: PTY → [`session::PtySession`] (ring append +
//! fan-out) → [`client::ClientSession`] → binary WebSocket frame → viewer.
//! Data flow for a keystroke: WebSocket text frame → `ClientSession` →
//! `PtySession::write`.
//!
//! The daemon self-terminates once it has had no connected clients and no
//! running sessions for a 5-second grace period; nothing else in the library
//! may exit the process.
//!
//! ## Modules
//!
//! - [`config`]: TOML configuration with environment overrides
//! - [`session`]: PTY sessions, the output ring, and the session store
//! - [`tmux`]: read-only adapter surfacing pre-existing tmux sessions
//! - [`client`]: per-connection protocol state machine
//! - [`manager`]: client registry and idle-shutdown scheduler
//! - [`gateway`]: HTTP + WebSocket entrypoint
//! - [`pidfile`]: PID file bookkeeping

pub mod client;
pub mod config;
pub mod gateway;
pub mod manager;
pub mod pidfile;
pub mod session;
pub mod tmux;

pub use client::ClientDeps;
pub use config::{Config, ConfigError};
pub use gateway::{AuthToken, GatewayState};
pub use manager::{AdmissionError, ClientGuard, SessionManager, IDLE_GRACE};
pub use session::{
    CreateOptions, OutputRing, PtySession, SessionError, SessionEvent, SessionStore, StoreEvent,
};
pub use tmux::{TmuxProvider, TMUX_TARGET_PREFIX};

// Re-export the wire protocol for embedders and tests.
pub use protocol;
