//! PTY session management.
//!
//! A [`PtySession`] owns exactly one child process behind a pseudo-terminal.
//! It publishes output as typed [`SessionEvent`]s over a broadcast channel,
//! keeps a bounded [`OutputRing`] of recent output for late joiners, accepts
//! input and resize requests, and reports the child's exit.
//!
//! The session's mutable state (ring, attached-client set, size, exited flag,
//! event sender) lives behind a single mutex so that ring appends, fan-out,
//! and subscription are mutually exclusive: [`PtySession::attach`] performs
//! check-not-exited → register client → snapshot ring → subscribe as one
//! critical section, which is what guarantees a late joiner neither misses a
//! byte nor sees one twice.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use once_cell::sync::Lazy;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use regex::bytes::Regex;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use protocol::{SessionInfo, SessionSource, SessionStatus};

use super::ring::{OutputRing, DEFAULT_MAX_BUFFER_BYTES};

/// Unique identifier for a session.
pub type SessionId = String;

/// Buffer size for reading from the PTY master.
const READ_BUFFER_SIZE: usize = 4096;

/// Channel capacity for broadcast output.
const BROADCAST_CAPACITY: usize = 256;

/// Environment variable marking the child as running inside a shared session,
/// so nested shells can detect the situation and decline to nest.
pub const SESSION_ENV_MARKER: &str = "TERMINALSYNC_SESSION";

/// Matches the window-title OSC sequence: `ESC ] (0|2) ; <title> (BEL | ESC \)`.
/// Codes 0 and 2 both set the title; other OSC codes are ignored.
static OSC_TITLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\][02];([^\x07\x1b]*)(?:\x07|\x1b\\)").expect("valid OSC title pattern")
});

/// Errors that can occur during session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The session's child process has already exited.
    #[error("session already exited: {0}")]
    Exited(SessionId),

    /// Failed to spawn the PTY child.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),
}

/// Typed signals published by a session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Raw output bytes, in PTY emission order.
    Data(Vec<u8>),
    /// The child exited with the given code. Always the final event.
    Exit(i32),
    /// The terminal was resized.
    Resize { cols: u16, rows: u16 },
    /// The window title changed (parsed from an OSC escape sequence).
    Title(String),
}

/// What to run inside the PTY.
#[derive(Debug, Clone)]
pub enum SpawnCommand {
    /// An interactive shell.
    Shell(String),
    /// An explicit program with arguments (used for tmux attach children).
    Program { program: String, args: Vec<String> },
}

/// Options for spawning a session.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Initial human-readable name; later updated from the window title.
    pub name: String,
    /// Child command.
    pub command: SpawnCommand,
    /// Initial terminal size; non-positive dimensions are clamped to 1.
    pub cols: u16,
    pub rows: u16,
    /// Explicit id; defaults to a fresh UUID.
    pub id: Option<String>,
    /// Ring capacity override in bytes.
    pub max_buffer_bytes: Option<usize>,
    /// Extra environment entries for the child.
    pub env: Vec<(String, String)>,
    /// Who owns the underlying terminal.
    pub source: SessionSource,
}

impl SpawnOptions {
    /// Options for a managed shell session.
    pub fn shell(name: impl Into<String>, shell: impl Into<String>, cols: u16, rows: u16) -> Self {
        Self {
            name: name.into(),
            command: SpawnCommand::Shell(shell.into()),
            cols,
            rows,
            id: None,
            max_buffer_bytes: None,
            env: Vec::new(),
            source: SessionSource::Managed,
        }
    }
}

/// Everything a newly attached client needs, captured atomically.
pub struct Attachment {
    /// Snapshot of the ring at attach time; replay this before live data.
    pub snapshot: Vec<u8>,
    /// Terminal size at attach time.
    pub cols: u16,
    pub rows: u16,
    /// Live event subscription installed in the same critical section as the
    /// snapshot, so its first `Data` event is strictly post-snapshot.
    pub events: broadcast::Receiver<SessionEvent>,
}

/// State guarded by the session mutex.
struct SessionInner {
    name: String,
    cols: u16,
    rows: u16,
    exited: bool,
    exit_code: Option<i32>,
    ring: OutputRing,
    attached: HashSet<String>,
    event_tx: broadcast::Sender<SessionEvent>,
}

/// A PTY session with a child process.
pub struct PtySession {
    id: SessionId,
    source: SessionSource,
    inner: Mutex<SessionInner>,
    writer: Mutex<Box<dyn Write + Send>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

impl PtySession {
    /// Spawns a child behind a fresh PTY and starts its read loop.
    ///
    /// The child gets `TERM=xterm-256color` and `TERMINALSYNC_SESSION=<id>`
    /// on top of the parent environment and any extra entries.
    pub fn spawn(options: SpawnOptions) -> Result<Arc<Self>, SessionError> {
        let id = options.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let cols = options.cols.max(1);
        let rows = options.rows.max(1);

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = match &options.command {
            SpawnCommand::Shell(shell) => CommandBuilder::new(shell),
            SpawnCommand::Program { program, args } => {
                let mut c = CommandBuilder::new(program);
                c.args(args);
                c
            }
        };

        // CommandBuilder does not reliably inherit the parent environment, so
        // copy it explicitly before layering the session-specific entries.
        for (key, value) in std::env::vars() {
            cmd.env(key, value);
        }
        cmd.env("TERM", "xterm-256color");
        cmd.env(SESSION_ENV_MARKER, &id);
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        let killer = child.clone_killer();

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let (event_tx, _) = broadcast::channel(BROADCAST_CAPACITY);

        let session = Arc::new(Self {
            id,
            source: options.source,
            inner: Mutex::new(SessionInner {
                name: options.name,
                cols,
                rows,
                exited: false,
                exit_code: None,
                ring: OutputRing::new(
                    options.max_buffer_bytes.unwrap_or(DEFAULT_MAX_BUFFER_BYTES),
                ),
                attached: HashSet::new(),
                event_tx,
            }),
            writer: Mutex::new(writer),
            master: Mutex::new(pair.master),
            killer: Mutex::new(killer),
        });

        session.spawn_read_loop(reader, child);

        tracing::info!(
            session_id = %session.id,
            cols = cols,
            rows = rows,
            source = ?session.source,
            "PTY session spawned"
        );

        Ok(session)
    }

    /// Returns the session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns who owns the underlying terminal.
    pub fn source(&self) -> SessionSource {
        self.source
    }

    /// Returns the current human-readable name.
    pub fn name(&self) -> String {
        self.lock_inner().name.clone()
    }

    /// Returns the current terminal size.
    pub fn size(&self) -> (u16, u16) {
        let inner = self.lock_inner();
        (inner.cols, inner.rows)
    }

    /// Whether the child has exited.
    pub fn has_exited(&self) -> bool {
        self.lock_inner().exited
    }

    /// The child's exit code, once it has exited.
    pub fn exit_code(&self) -> Option<i32> {
        self.lock_inner().exit_code
    }

    /// Lifecycle status for listings.
    pub fn status(&self) -> SessionStatus {
        if self.has_exited() {
            SessionStatus::Exited
        } else {
            SessionStatus::Running
        }
    }

    /// Number of currently attached clients.
    pub fn attached_count(&self) -> usize {
        self.lock_inner().attached.len()
    }

    /// Listing entry for this session.
    pub fn info(&self) -> SessionInfo {
        let inner = self.lock_inner();
        SessionInfo {
            id: self.id.clone(),
            name: inner.name.clone(),
            status: if inner.exited {
                SessionStatus::Exited
            } else {
                SessionStatus::Running
            },
            attached_clients: inner.attached.len(),
            source: self.source,
        }
    }

    /// Writes input to the child. Silently ignored after exit; write failures
    /// are logged rather than raised (the PTY reports them as EOF anyway).
    pub fn write(&self, data: &[u8]) {
        if self.has_exited() {
            return;
        }
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writer.write_all(data).and_then(|_| writer.flush()) {
            tracing::debug!(session_id = %self.id, error = %e, "PTY write ignored");
        }
    }

    /// Resizes the terminal.
    ///
    /// A no-op when the child has exited, either dimension is zero, or the
    /// size is unchanged; only an effective change emits a `Resize` event.
    pub fn resize(&self, cols: u16, rows: u16) {
        let mut inner = self.lock_inner();
        if inner.exited || cols == 0 || rows == 0 || (cols, rows) == (inner.cols, inner.rows) {
            return;
        }

        let master = self.master.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = master.resize(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }) {
            tracing::debug!(session_id = %self.id, error = %e, "PTY resize ignored");
            return;
        }
        drop(master);

        inner.cols = cols;
        inner.rows = rows;
        let _ = inner.event_tx.send(SessionEvent::Resize { cols, rows });
        tracing::debug!(session_id = %self.id, cols, rows, "PTY resized");
    }

    /// Atomically registers a client: not-exited check, attached-set insert,
    /// ring snapshot, and event subscription under one lock.
    pub fn attach(&self, client_id: &str) -> Result<Attachment, SessionError> {
        let mut inner = self.lock_inner();
        if inner.exited {
            return Err(SessionError::Exited(self.id.clone()));
        }
        inner.attached.insert(client_id.to_string());
        Ok(Attachment {
            snapshot: inner.ring.snapshot(),
            cols: inner.cols,
            rows: inner.rows,
            events: inner.event_tx.subscribe(),
        })
    }

    /// Adds a client id to the attached set. Idempotent.
    pub fn attach_client(&self, client_id: &str) {
        self.lock_inner().attached.insert(client_id.to_string());
    }

    /// Removes a client id from the attached set. Unknown ids are a no-op.
    pub fn detach_client(&self, client_id: &str) {
        self.lock_inner().attached.remove(client_id);
    }

    /// Snapshot of the buffered output.
    pub fn buffered_output(&self) -> Vec<u8> {
        self.lock_inner().ring.snapshot()
    }

    /// Bytes currently held in the ring.
    pub fn buffered_bytes(&self) -> usize {
        self.lock_inner().ring.total_bytes()
    }

    /// Chunks currently held in the ring.
    pub fn buffered_chunks(&self) -> usize {
        self.lock_inner().ring.chunk_count()
    }

    /// Subscribes to this session's events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.lock_inner().event_tx.subscribe()
    }

    /// Best-effort child termination; "already dead" is swallowed.
    pub fn kill(&self) {
        let mut killer = self.killer.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = killer.kill() {
            tracing::debug!(session_id = %self.id, error = %e, "kill ignored");
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// One output chunk: ring append, title scan, and fan-out, all under the
    /// inner lock so attach() cannot interleave between snapshot and subscribe.
    fn ingest(&self, data: &[u8]) {
        let mut inner = self.lock_inner();
        inner.ring.push(data.to_vec());

        if let Some(title) = scan_osc_title(data) {
            if title != inner.name {
                inner.name = title.clone();
                let _ = inner.event_tx.send(SessionEvent::Title(title));
            }
        }

        let _ = inner.event_tx.send(SessionEvent::Data(data.to_vec()));
    }

    /// Marks the session exited and emits the final `Exit` event.
    fn mark_exited(&self, code: i32) {
        let mut inner = self.lock_inner();
        if inner.exited {
            return;
        }
        inner.exited = true;
        inner.exit_code = Some(code);
        let _ = inner.event_tx.send(SessionEvent::Exit(code));
        tracing::info!(session_id = %self.id, exit_code = code, "PTY session exited");
    }

    /// Drains the PTY master on a blocking thread. At EOF the child is reaped
    /// and `Exit` is emitted, strictly after all in-flight data events.
    fn spawn_read_loop(
        self: &Arc<Self>,
        mut reader: Box<dyn Read + Send>,
        mut child: Box<dyn Child + Send + Sync>,
    ) {
        let session = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => session.ingest(&buf[..n]),
                    Err(e) => {
                        tracing::debug!(
                            session_id = %session.id,
                            error = %e,
                            "PTY read ended"
                        );
                        break;
                    }
                }
            }

            let code = child
                .wait()
                .map(|status| status.exit_code() as i32)
                .unwrap_or(-1);
            session.mark_exited(code);
        });
    }
}

/// Extracts the last window-title OSC sequence from an output chunk.
fn scan_osc_title(data: &[u8]) -> Option<String> {
    OSC_TITLE_RE
        .captures_iter(data)
        .last()
        .map(|caps| String::from_utf8_lossy(&caps[1]).into_owned())
}

/// Resolves the shell to use: explicit value, then `$SHELL`, then `/bin/sh`.
pub fn detect_shell(shell: Option<String>) -> String {
    shell
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("SHELL").ok())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    /// A session running `/bin/cat`: stays alive and emits nothing on its own.
    fn spawn_quiet() -> Arc<PtySession> {
        PtySession::spawn(SpawnOptions {
            name: "quiet".to_string(),
            command: SpawnCommand::Program {
                program: "/bin/cat".to_string(),
                args: vec![],
            },
            cols: 80,
            rows: 24,
            id: None,
            max_buffer_bytes: None,
            env: Vec::new(),
            source: SessionSource::Managed,
        })
        .unwrap()
    }

    async fn wait_for_exit(session: &PtySession) -> i32 {
        for _ in 0..100 {
            if let Some(code) = session.exit_code() {
                return code;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("session did not exit in time");
    }

    #[test]
    fn test_scan_osc_title() {
        assert_eq!(
            scan_osc_title(b"\x1b]0;my title\x07"),
            Some("my title".to_string())
        );
        assert_eq!(
            scan_osc_title(b"\x1b]2;other\x1b\\"),
            Some("other".to_string())
        );
        // Last match wins.
        assert_eq!(
            scan_osc_title(b"\x1b]0;first\x07 text \x1b]2;second\x07"),
            Some("second".to_string())
        );
        // Other OSC codes are ignored.
        assert_eq!(scan_osc_title(b"\x1b]1;icon\x07"), None);
        assert_eq!(scan_osc_title(b"plain output"), None);
    }

    #[test]
    fn test_detect_shell() {
        assert_eq!(detect_shell(Some("/bin/bash".to_string())), "/bin/bash");
        assert!(!detect_shell(None).is_empty());
    }

    #[tokio::test]
    async fn test_spawn_and_echo_roundtrip() {
        let session = PtySession::spawn(SpawnOptions::shell("test", "/bin/sh", 80, 24)).unwrap();
        let mut rx = session.subscribe();

        session.write(b"echo roundtrip_marker\n");

        let mut found = false;
        for _ in 0..50 {
            match timeout(Duration::from_millis(100), rx.recv()).await {
                Ok(Ok(SessionEvent::Data(data))) => {
                    if String::from_utf8_lossy(&data).contains("roundtrip_marker") {
                        found = true;
                        break;
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(_)) => break,
                Err(_) => {}
            }
        }
        assert!(found, "did not receive echoed output");

        session.kill();
    }

    #[tokio::test]
    async fn test_spawn_bad_shell_fails() {
        let result = PtySession::spawn(SpawnOptions::shell(
            "bad",
            "/nonexistent/shell/xyz",
            80,
            24,
        ));
        // portable-pty may report the failure at spawn time or as an
        // immediate child exit, depending on platform.
        if let Ok(session) = result {
            let code = wait_for_exit(&session).await;
            assert_ne!(code, 0);
        }
    }

    #[tokio::test]
    async fn test_resize_emits_only_on_effective_change() {
        let session = spawn_quiet();
        let mut rx = session.subscribe();

        // Zero dimensions and the current size are rejected without a signal.
        session.resize(0, 24);
        session.resize(80, 0);
        session.resize(80, 24);
        assert_eq!(session.size(), (80, 24));

        session.resize(120, 40);
        assert_eq!(session.size(), (120, 40));

        let event = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no resize event")
            .expect("channel closed");
        match event {
            SessionEvent::Resize { cols, rows } => {
                assert_eq!((cols, rows), (120, 40));
            }
            other => panic!("expected resize, got {other:?}"),
        }

        session.kill();
    }

    #[tokio::test]
    async fn test_write_and_resize_after_exit_are_noops() {
        let session = spawn_quiet();
        session.kill();
        wait_for_exit(&session).await;

        assert!(session.has_exited());
        assert_eq!(session.status(), SessionStatus::Exited);

        // Neither call panics or changes anything.
        session.write(b"ignored\n");
        session.resize(200, 50);
        assert_eq!(session.size(), (80, 24));
    }

    #[tokio::test]
    async fn test_exit_code_reported() {
        let session = PtySession::spawn(SpawnOptions {
            name: "exit7".to_string(),
            command: SpawnCommand::Program {
                program: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), "exit 7".to_string()],
            },
            cols: 80,
            rows: 24,
            id: None,
            max_buffer_bytes: None,
            env: Vec::new(),
            source: SessionSource::Managed,
        })
        .unwrap();

        assert_eq!(wait_for_exit(&session).await, 7);
    }

    #[tokio::test]
    async fn test_attach_client_is_idempotent() {
        let session = spawn_quiet();

        session.attach_client("x");
        session.attach_client("x");
        assert_eq!(session.attached_count(), 1);

        session.detach_client("unknown");
        assert_eq!(session.attached_count(), 1);

        session.detach_client("x");
        assert_eq!(session.attached_count(), 0);

        session.kill();
    }

    #[tokio::test]
    async fn test_attach_snapshot_precedes_live_data() {
        let session = spawn_quiet();

        session.ingest(b"AAAA");
        session.ingest(b"BBBB");

        let attachment = session.attach("viewer").unwrap();
        assert_eq!(attachment.snapshot, b"AAAABBBB");
        assert_eq!(session.attached_count(), 1);

        session.ingest(b"X");
        let mut events = attachment.events;
        let first_data = loop {
            match timeout(Duration::from_secs(1), events.recv())
                .await
                .expect("no live event")
                .expect("channel closed")
            {
                SessionEvent::Data(data) => break data,
                _ => continue,
            }
        };
        // The first live byte is strictly post-snapshot.
        assert_eq!(first_data, b"X");

        session.kill();
    }

    #[tokio::test]
    async fn test_attach_exited_session_is_rejected() {
        let session = spawn_quiet();
        session.kill();
        wait_for_exit(&session).await;

        assert!(matches!(
            session.attach("late"),
            Err(SessionError::Exited(_))
        ));
    }

    #[tokio::test]
    async fn test_ring_eviction_through_ingest() {
        let session = PtySession::spawn(SpawnOptions {
            name: "tiny".to_string(),
            command: SpawnCommand::Program {
                program: "/bin/cat".to_string(),
                args: vec![],
            },
            cols: 80,
            rows: 24,
            id: None,
            max_buffer_bytes: Some(10),
            env: Vec::new(),
            source: SessionSource::Managed,
        })
        .unwrap();

        let giant = vec![b'x'; 100];
        session.ingest(&giant);
        assert_eq!(session.buffered_output(), giant);
        assert_eq!(session.buffered_chunks(), 1);
        assert_eq!(session.buffered_bytes(), 100);

        let second = vec![b'y'; 100];
        session.ingest(&second);
        assert_eq!(session.buffered_output(), second);
        assert_eq!(session.buffered_bytes(), 100);

        session.kill();
    }

    #[tokio::test]
    async fn test_title_updates_name_and_signals() {
        let session = spawn_quiet();
        let mut rx = session.subscribe();

        session.ingest(b"\x1b]0;build: ok\x07");
        assert_eq!(session.name(), "build: ok");

        let mut saw_title = false;
        for _ in 0..10 {
            match timeout(Duration::from_millis(100), rx.recv()).await {
                Ok(Ok(SessionEvent::Title(title))) => {
                    assert_eq!(title, "build: ok");
                    saw_title = true;
                    break;
                }
                Ok(Ok(_)) => {}
                _ => break,
            }
        }
        assert!(saw_title);

        // An identical title is not re-announced.
        let mut rx2 = session.subscribe();
        session.ingest(b"\x1b]0;build: ok\x07");
        for _ in 0..5 {
            match timeout(Duration::from_millis(100), rx2.recv()).await {
                Ok(Ok(SessionEvent::Title(_))) => panic!("unchanged title re-emitted"),
                Ok(Ok(_)) => continue,
                _ => break,
            }
        }

        session.kill();
    }

    #[tokio::test]
    async fn test_kill_twice_is_harmless() {
        let session = spawn_quiet();
        session.kill();
        session.kill();
        wait_for_exit(&session).await;
    }
}
