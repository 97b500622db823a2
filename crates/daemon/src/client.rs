//! Per-connection protocol state machine.
//!
//! Each WebSocket gets one [`ClientSession`] driving a BROWSING ↔ ATTACHED
//! state machine. A single `select!` loop owns the socket sink, so every
//! outbound frame is serialized through one writer: inbound frames are
//! dispatched in arrival order, session events are forwarded while attached,
//! store removals are pushed to everyone, and a manager shutdown closes the
//! socket with a going-away code.
//!
//! Failures stay inside the connection that caused them: structural problems
//! become `PARSE_ERROR`, logical problems become typed codes, and neither
//! ever changes the state machine.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;

use protocol::{
    close, ClientFrame, ClientMessage, DetachReason, ErrorCode, ServerFrame, ServerMessage,
};

use crate::manager::{ClientGuard, SessionManager};
use crate::session::{
    Attachment, CreateOptions, PtySession, SessionError, SessionEvent, SessionStore, StoreEvent,
};
use crate::tmux::TmuxProvider;

/// Everything a client session needs from the rest of the daemon.
#[derive(Clone)]
pub struct ClientDeps {
    pub store: SessionStore,
    pub manager: SessionManager,
    pub tmux: Arc<TmuxProvider>,
    pub default_shell: String,
}

/// Accepts one upgraded socket: admission check, then the session loop.
///
/// Over-capacity sockets are closed with [`close::OVERLOADED`] before a
/// `ClientSession` ever exists.
pub async fn serve(socket: WebSocket, deps: ClientDeps) {
    let guard = match deps.manager.register() {
        Ok(guard) => guard,
        Err(e) => {
            tracing::warn!(error = %e, "rejecting client");
            let mut socket = socket;
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close::OVERLOADED,
                    reason: "client capacity reached".into(),
                })))
                .await;
            return;
        }
    };

    let shutdown_rx = deps.manager.subscribe_shutdown();
    let session = ClientSession {
        id: guard.id().to_string(),
        store: deps.store,
        tmux: deps.tmux,
        default_shell: deps.default_shell,
    };
    session.run(socket, shutdown_rx, guard).await;
}

/// State of a client with respect to a PTY session.
enum ClientState {
    Browsing,
    Attached(AttachedState),
}

struct AttachedState {
    session: Arc<PtySession>,
    events: broadcast::Receiver<SessionEvent>,
    /// tmux attach children are owned by this client and die with it.
    owned: bool,
}

/// One connected viewer.
pub struct ClientSession {
    id: String,
    store: SessionStore,
    tmux: Arc<TmuxProvider>,
    default_shell: String,
}

/// What woke the client loop up.
enum Tick {
    Socket(Option<Result<Message, axum::Error>>),
    Session(Result<SessionEvent, broadcast::error::RecvError>),
    Store(Result<StoreEvent, broadcast::error::RecvError>),
    Shutdown,
}

impl ClientSession {
    async fn run(
        self,
        socket: WebSocket,
        mut shutdown_rx: broadcast::Receiver<()>,
        guard: ClientGuard,
    ) {
        let (mut ws_tx, mut ws_rx) = socket.split();
        let mut store_events = self.store.subscribe();
        let mut state = ClientState::Browsing;

        tracing::info!(client_id = %self.id, "client connected");

        loop {
            let tick = tokio::select! {
                frame = ws_rx.next() => Tick::Socket(frame),
                event = next_session_event(&mut state) => Tick::Session(event),
                event = store_events.recv() => Tick::Store(event),
                _ = shutdown_rx.recv() => Tick::Shutdown,
            };

            let keep_going = match tick {
                Tick::Socket(Some(Ok(Message::Text(text)))) => {
                    self.dispatch(&mut ws_tx, &mut state, &text).await
                }
                Tick::Socket(Some(Ok(Message::Binary(_)))) => {
                    send_error(
                        &mut ws_tx,
                        0,
                        ErrorCode::ParseError,
                        "binary frames are not valid client input",
                    )
                    .await
                }
                Tick::Socket(Some(Ok(Message::Close(_)))) | Tick::Socket(None) => false,
                // Ping/pong are answered by the websocket layer.
                Tick::Socket(Some(Ok(_))) => true,
                Tick::Socket(Some(Err(e))) => {
                    tracing::debug!(client_id = %self.id, error = %e, "socket error");
                    false
                }
                Tick::Session(event) => {
                    self.forward_session_event(&mut ws_tx, &mut state, event)
                        .await
                }
                Tick::Store(Ok(StoreEvent::SessionRemoved { id })) => {
                    send_frame(
                        &mut ws_tx,
                        &ServerFrame::push(ServerMessage::SessionRemoved { id }),
                    )
                    .await
                }
                Tick::Store(Ok(_)) => true,
                Tick::Store(Err(broadcast::error::RecvError::Lagged(_))) => true,
                Tick::Store(Err(broadcast::error::RecvError::Closed)) => false,
                Tick::Shutdown => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: close::GOING_AWAY,
                            reason: "server shutting down".into(),
                        })))
                        .await;
                    false
                }
            };

            if !keep_going {
                break;
            }
        }

        if let ClientState::Attached(att) = std::mem::replace(&mut state, ClientState::Browsing) {
            self.release(att);
        }
        drop(guard);
        tracing::info!(client_id = %self.id, "client disconnected");
    }

    /// Handles one inbound text frame. Returns whether the loop continues.
    async fn dispatch(
        &self,
        ws_tx: &mut SplitSink<WebSocket, Message>,
        state: &mut ClientState,
        text: &str,
    ) -> bool {
        let frame: ClientFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                return send_error(
                    ws_tx,
                    0,
                    ErrorCode::ParseError,
                    &format!("invalid frame: {e}"),
                )
                .await;
            }
        };
        let seq = frame.seq;

        match frame.msg {
            ClientMessage::ListSessions {} => self.handle_list(ws_tx, seq).await,
            ClientMessage::CreateSession { name, cols, rows } => {
                self.handle_create(ws_tx, seq, name, cols, rows).await
            }
            ClientMessage::Attach { target, cols, rows } => {
                self.handle_attach(ws_tx, state, seq, target, cols, rows)
                    .await
            }
            ClientMessage::Input { data } => match state {
                ClientState::Attached(att) => {
                    att.session.write(data.as_bytes());
                    true
                }
                ClientState::Browsing => {
                    send_error(ws_tx, seq, ErrorCode::NotAttached, "no attached session").await
                }
            },
            ClientMessage::Resize { cols, rows } => match state {
                ClientState::Attached(att) => {
                    att.session.resize(cols, rows);
                    true
                }
                ClientState::Browsing => {
                    send_error(ws_tx, seq, ErrorCode::NotAttached, "no attached session").await
                }
            },
            ClientMessage::Detach {} => {
                match std::mem::replace(state, ClientState::Browsing) {
                    ClientState::Attached(att) => {
                        self.release(att);
                        send_frame(
                            ws_tx,
                            &ServerFrame::reply(
                                seq,
                                ServerMessage::Detached {
                                    reason: DetachReason::ClientRequest,
                                    message: None,
                                },
                            ),
                        )
                        .await
                    }
                    ClientState::Browsing => {
                        send_error(ws_tx, seq, ErrorCode::NotAttached, "no attached session").await
                    }
                }
            }
        }
    }

    async fn handle_list(
        &self,
        ws_tx: &mut SplitSink<WebSocket, Message>,
        seq: u64,
    ) -> bool {
        let mut sessions = self.store.list_info();
        match self.tmux.list_info().await {
            Ok(mut tmux_sessions) => sessions.append(&mut tmux_sessions),
            Err(e) => {
                return send_error(ws_tx, seq, ErrorCode::ListError, &e.to_string()).await;
            }
        }
        send_frame(
            ws_tx,
            &ServerFrame::reply(seq, ServerMessage::SessionList { sessions }),
        )
        .await
    }

    async fn handle_create(
        &self,
        ws_tx: &mut SplitSink<WebSocket, Message>,
        seq: u64,
        name: String,
        cols: u16,
        rows: u16,
    ) -> bool {
        match self.store.create(CreateOptions {
            name,
            shell: self.default_shell.clone(),
            cols,
            rows,
            id: None,
            max_buffer_bytes: None,
            env: Vec::new(),
        }) {
            Ok(session) => {
                send_frame(
                    ws_tx,
                    &ServerFrame::reply(
                        seq,
                        ServerMessage::SessionCreated {
                            id: session.id().clone(),
                            name: session.name(),
                        },
                    ),
                )
                .await
            }
            Err(e) => send_error(ws_tx, seq, ErrorCode::CreateFailed, &e.to_string()).await,
        }
    }

    async fn handle_attach(
        &self,
        ws_tx: &mut SplitSink<WebSocket, Message>,
        state: &mut ClientState,
        seq: u64,
        target: String,
        cols: u16,
        rows: u16,
    ) -> bool {
        if matches!(state, ClientState::Attached(_)) {
            return send_error(
                ws_tx,
                seq,
                ErrorCode::AlreadyAttached,
                "already attached to a session",
            )
            .await;
        }

        if let Some(name) = TmuxProvider::target_name(&target) {
            let name = name.to_string();
            return self
                .attach_tmux(ws_tx, state, seq, target, &name, cols, rows)
                .await;
        }

        let session = match self.store.get(&target) {
            Some(session) => session,
            None => {
                return send_error(
                    ws_tx,
                    seq,
                    ErrorCode::SessionNotFound,
                    &format!("unknown session: {target}"),
                )
                .await;
            }
        };

        // The attach carries a resize hint; zero or unchanged dims are
        // ignored by the session itself.
        session.resize(cols, rows);

        let attachment = match session.attach(&self.id) {
            Ok(attachment) => attachment,
            Err(e) => {
                return send_error(ws_tx, seq, error_code_for(&e), &e.to_string()).await;
            }
        };

        self.finish_attach(ws_tx, state, seq, target, session, attachment, Vec::new(), false)
            .await
    }

    async fn attach_tmux(
        &self,
        ws_tx: &mut SplitSink<WebSocket, Message>,
        state: &mut ClientState,
        seq: u64,
        target: String,
        name: &str,
        cols: u16,
        rows: u16,
    ) -> bool {
        match self.tmux.list_sessions().await {
            Ok(names) if !names.iter().any(|n| n == name) => {
                return send_error(
                    ws_tx,
                    seq,
                    ErrorCode::SessionNotFound,
                    &format!("unknown tmux session: {name}"),
                )
                .await;
            }
            Ok(_) => {}
            Err(e) => {
                return send_error(ws_tx, seq, ErrorCode::AttachFailed, &e.to_string()).await;
            }
        }

        let scrollback = self.tmux.capture_scrollback(name).await;

        let session = match self.tmux.attach(name, cols, rows) {
            Ok(session) => session,
            Err(e) => {
                return send_error(ws_tx, seq, ErrorCode::AttachFailed, &e.to_string()).await;
            }
        };
        let attachment = match session.attach(&self.id) {
            Ok(attachment) => attachment,
            Err(e) => {
                session.kill();
                return send_error(ws_tx, seq, ErrorCode::AttachFailed, &e.to_string()).await;
            }
        };

        self.finish_attach(ws_tx, state, seq, target, session, attachment, scrollback, true)
            .await
    }

    /// Flushes replay bytes, installs the attachment, and sends the reply.
    /// The replay goes out before the reply and before any live byte.
    #[allow(clippy::too_many_arguments)]
    async fn finish_attach(
        &self,
        ws_tx: &mut SplitSink<WebSocket, Message>,
        state: &mut ClientState,
        seq: u64,
        target: String,
        session: Arc<PtySession>,
        attachment: Attachment,
        prelude: Vec<u8>,
        owned: bool,
    ) -> bool {
        let Attachment {
            snapshot,
            cols,
            rows,
            events,
        } = attachment;

        for replay in [prelude, snapshot] {
            if replay.is_empty() {
                continue;
            }
            if ws_tx.send(Message::Binary(replay)).await.is_err() {
                session.detach_client(&self.id);
                if owned {
                    session.kill();
                }
                return false;
            }
        }

        tracing::info!(
            client_id = %self.id,
            session_id = %session.id(),
            "client attached"
        );
        *state = ClientState::Attached(AttachedState {
            session,
            events,
            owned,
        });

        send_frame(
            ws_tx,
            &ServerFrame::reply(seq, ServerMessage::Attached { target, cols, rows }),
        )
        .await
    }

    /// Forwards one event from the attached session.
    async fn forward_session_event(
        &self,
        ws_tx: &mut SplitSink<WebSocket, Message>,
        state: &mut ClientState,
        event: Result<SessionEvent, broadcast::error::RecvError>,
    ) -> bool {
        match event {
            Ok(SessionEvent::Data(bytes)) => ws_tx.send(Message::Binary(bytes)).await.is_ok(),
            Ok(SessionEvent::Resize { cols, rows }) => {
                send_frame(
                    ws_tx,
                    &ServerFrame::push(ServerMessage::Resized { cols, rows }),
                )
                .await
            }
            // The listing name already tracks the title.
            Ok(SessionEvent::Title(_)) => true,
            Ok(SessionEvent::Exit(code)) => {
                if let ClientState::Attached(att) =
                    std::mem::replace(state, ClientState::Browsing)
                {
                    self.release(att);
                }
                send_frame(
                    ws_tx,
                    &ServerFrame::push(ServerMessage::Detached {
                        reason: DetachReason::SessionExit,
                        message: Some(format!("session exited with code {code}")),
                    }),
                )
                .await
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(
                    client_id = %self.id,
                    skipped,
                    "slow client skipped output chunks"
                );
                true
            }
            Err(broadcast::error::RecvError::Closed) => {
                if let ClientState::Attached(att) =
                    std::mem::replace(state, ClientState::Browsing)
                {
                    self.release(att);
                }
                send_frame(
                    ws_tx,
                    &ServerFrame::push(ServerMessage::Detached {
                        reason: DetachReason::SessionExit,
                        message: None,
                    }),
                )
                .await
            }
        }
    }

    /// Deregisters from the session, killing client-owned tmux children.
    fn release(&self, att: AttachedState) {
        att.session.detach_client(&self.id);
        if att.owned {
            att.session.kill();
        }
    }
}

/// Resolves the attached session's event stream, or parks while browsing.
async fn next_session_event(
    state: &mut ClientState,
) -> Result<SessionEvent, broadcast::error::RecvError> {
    match state {
        ClientState::Attached(att) => att.events.recv().await,
        ClientState::Browsing => std::future::pending().await,
    }
}

fn error_code_for(err: &SessionError) -> ErrorCode {
    match err {
        SessionError::NotFound(_) => ErrorCode::SessionNotFound,
        SessionError::Exited(_) => ErrorCode::SessionExited,
        SessionError::SpawnFailed(_) => ErrorCode::CreateFailed,
    }
}

async fn send_frame(ws_tx: &mut SplitSink<WebSocket, Message>, frame: &ServerFrame) -> bool {
    match serde_json::to_string(frame) {
        Ok(text) => ws_tx.send(Message::Text(text)).await.is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode outbound frame");
            true
        }
    }
}

async fn send_error(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    seq: u64,
    code: ErrorCode,
    message: &str,
) -> bool {
    send_frame(
        ws_tx,
        &ServerFrame::reply(
            seq,
            ServerMessage::Error {
                code,
                message: message.to_string(),
            },
        ),
    )
    .await
}
