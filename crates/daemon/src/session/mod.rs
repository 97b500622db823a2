//! PTY session layer: one child shell per session, a process-wide store, and
//! a bounded ring of recent output per session.

pub mod pty;
pub mod ring;
pub mod store;

pub use pty::{
    detect_shell, Attachment, PtySession, SessionError, SessionEvent, SessionId, SpawnCommand,
    SpawnOptions, SESSION_ENV_MARKER,
};
pub use ring::{OutputRing, DEFAULT_MAX_BUFFER_BYTES};
pub use store::{CreateOptions, SessionStore, StoreEvent};
