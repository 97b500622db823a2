//! End-to-end integration tests for TerminalSync.
//!
//! Each test boots a real daemon (store + manager + gateway) on an ephemeral
//! port and drives it through a WebSocket client, verifying complete flows:
//! authentication, browse/create/attach/echo, replay ordering for late
//! joiners, resize propagation, admission control, and idle shutdown.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use daemon::client::ClientDeps;
use daemon::gateway::{self, AuthToken, GatewayState};
use daemon::manager::SessionManager;
use daemon::session::SessionStore;
use daemon::tmux::TmuxProvider;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TOKEN: &str = "e2e-test-token";

struct TestServer {
    addr: SocketAddr,
    store: SessionStore,
    manager: SessionManager,
    idle_rx: mpsc::Receiver<()>,
}

/// Kills every session's real child process so the blocking pty reader
/// threads spawned via `spawn_blocking` observe EOF and exit; otherwise
/// dropping the `#[tokio::test]` runtime hangs forever waiting for them.
impl Drop for TestServer {
    fn drop(&mut self) {
        self.store.shutdown();
    }
}

/// Boots a daemon on an ephemeral port with an observable idle sink.
async fn start_server(max_clients: usize, idle_grace: Duration) -> TestServer {
    let store = SessionStore::new();
    let (idle_tx, idle_rx) = mpsc::channel(1);
    let manager = SessionManager::with_idle_grace(
        store.clone(),
        max_clients,
        idle_grace,
        Box::new(move || {
            let _ = idle_tx.try_send(());
        }),
    );
    manager.start();

    let state = GatewayState {
        deps: ClientDeps {
            store: store.clone(),
            manager: manager.clone(),
            tmux: Arc::new(TmuxProvider::new(100)),
            default_shell: "/bin/sh".to_string(),
        },
        auth: Arc::new(AuthToken::new(TOKEN.as_bytes().to_vec())),
        web_root: PathBuf::from("/nonexistent/webroot"),
    };
    let app = gateway::router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        addr,
        store,
        manager,
        idle_rx,
    }
}

async fn connect(addr: SocketAddr) -> Ws {
    let (ws, _) = connect_async(format!("ws://{addr}/ws?token={TOKEN}"))
        .await
        .expect("websocket connect failed");
    ws
}

fn frame(msg_type: &str, seq: u64, payload: Value) -> Message {
    Message::Text(json!({"type": msg_type, "seq": seq, "payload": payload}).to_string())
}

/// Next JSON frame, skipping binary output.
async fn recv_json(ws: &mut Ws) -> Value {
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("invalid server JSON");
        }
    }
}

/// Next JSON frame plus every binary byte that arrived before it.
async fn recv_json_collecting_binary(ws: &mut Ws) -> (Value, Vec<u8>) {
    let mut binary = Vec::new();
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .expect("websocket error");
        match msg {
            Message::Text(text) => {
                return (
                    serde_json::from_str(&text).expect("invalid server JSON"),
                    binary,
                );
            }
            Message::Binary(data) => binary.extend_from_slice(&data),
            _ => {}
        }
    }
}

/// Accumulates binary frames until their concatenation contains `needle`.
async fn expect_output_containing(ws: &mut Ws, needle: &str) -> Vec<u8> {
    let mut collected = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let msg = tokio::time::timeout_at(deadline, ws.next())
            .await
            .unwrap_or_else(|_| {
                panic!(
                    "did not observe {needle:?}; saw {:?}",
                    String::from_utf8_lossy(&collected)
                )
            })
            .expect("connection closed")
            .expect("websocket error");
        if let Message::Binary(data) = msg {
            collected.extend_from_slice(&data);
            if String::from_utf8_lossy(&collected).contains(needle) {
                return collected;
            }
        }
    }
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).to_string()
}

// =============================================================================
// Authentication
// =============================================================================

#[tokio::test]
async fn test_wrong_token_rejected_before_upgrade() {
    let server = start_server(10, Duration::from_secs(60)).await;

    let result = connect_async(format!("ws://{}/ws?token=wrong", server.addr)).await;
    match result {
        Err(tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 401);
        }
        other => panic!("expected HTTP 401 rejection, got {other:?}"),
    }

    // No ClientSession was ever constructed.
    assert_eq!(server.manager.client_count(), 0);
}

#[tokio::test]
async fn test_missing_token_rejected() {
    let server = start_server(10, Duration::from_secs(60)).await;

    let result = connect_async(format!("ws://{}/ws", server.addr)).await;
    match result {
        Err(tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 401);
        }
        other => panic!("expected HTTP 401 rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_bearer_header_accepted() {
    let server = start_server(10, Duration::from_secs(60)).await;

    let mut request = tungstenite::client::IntoClientRequest::into_client_request(format!(
        "ws://{}/ws",
        server.addr
    ))
    .unwrap();
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {TOKEN}").parse().unwrap(),
    );

    let (mut ws, _) = connect_async(request).await.expect("bearer auth failed");
    ws.send(frame("list_sessions", 1, json!({}))).await.unwrap();
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "session_list");
}

// =============================================================================
// Browse / create / attach / echo
// =============================================================================

#[tokio::test]
async fn test_browse_then_attach_then_echo() {
    let server = start_server(10, Duration::from_secs(60)).await;
    let mut ws = connect(server.addr).await;

    ws.send(frame("list_sessions", 1, json!({}))).await.unwrap();
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "session_list");
    assert_eq!(reply["seq"], 1);
    assert!(reply["payload"]["sessions"].as_array().unwrap().is_empty());

    ws.send(frame(
        "create_session",
        2,
        json!({"name": "s", "cols": 80, "rows": 24}),
    ))
    .await
    .unwrap();
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "session_created");
    assert_eq!(reply["seq"], 2);
    assert_eq!(reply["payload"]["name"], "s");
    let id = reply["payload"]["id"].as_str().unwrap().to_string();

    ws.send(frame(
        "attach",
        3,
        json!({"target": id.clone(), "cols": 80, "rows": 24}),
    ))
    .await
    .unwrap();
    let (reply, _replay) = recv_json_collecting_binary(&mut ws).await;
    assert_eq!(reply["type"], "attached");
    assert_eq!(reply["seq"], 3);
    assert_eq!(reply["payload"]["target"], id.as_str());
    assert_eq!(reply["payload"]["cols"], 80);
    assert_eq!(reply["payload"]["rows"], 24);

    ws.send(frame("input", 4, json!({"data": "echo e2e_marker\n"})))
        .await
        .unwrap();
    expect_output_containing(&mut ws, "e2e_marker").await;
}

#[tokio::test]
async fn test_session_listing_shows_created_session() {
    let server = start_server(10, Duration::from_secs(60)).await;
    let mut ws = connect(server.addr).await;

    ws.send(frame(
        "create_session",
        1,
        json!({"name": "listed", "cols": 80, "rows": 24}),
    ))
    .await
    .unwrap();
    let created = recv_json(&mut ws).await;
    let id = created["payload"]["id"].as_str().unwrap();

    ws.send(frame("list_sessions", 2, json!({}))).await.unwrap();
    let reply = recv_json(&mut ws).await;
    let sessions = reply["payload"]["sessions"].as_array().unwrap();
    let entry = sessions
        .iter()
        .find(|s| s["id"] == id)
        .expect("created session missing from listing");
    assert_eq!(entry["status"], "running");
    assert_eq!(entry["source"], "managed");
    assert_eq!(entry["attachedClients"], 0);
}

// =============================================================================
// Replay ordering for late joiners
// =============================================================================

#[tokio::test]
async fn test_late_join_replays_ring_before_live_bytes() {
    let server = start_server(10, Duration::from_secs(60)).await;
    let mut host = connect(server.addr).await;

    host.send(frame(
        "create_session",
        1,
        json!({"name": "replay", "cols": 80, "rows": 24}),
    ))
    .await
    .unwrap();
    let created = recv_json(&mut host).await;
    let id = created["payload"]["id"].as_str().unwrap().to_string();

    host.send(frame(
        "attach",
        2,
        json!({"target": id.clone(), "cols": 80, "rows": 24}),
    ))
    .await
    .unwrap();
    let (reply, _) = recv_json_collecting_binary(&mut host).await;
    assert_eq!(reply["type"], "attached");

    // Produce output that must land in the ring before the viewer joins.
    host.send(frame("input", 3, json!({"data": "echo replay_sentinel\n"})))
        .await
        .unwrap();
    expect_output_containing(&mut host, "replay_sentinel").await;

    let mut viewer = connect(server.addr).await;
    viewer
        .send(frame("attach", 1, json!({"target": id.clone(), "cols": 0, "rows": 0})))
        .await
        .unwrap();
    let (reply, replayed) = recv_json_collecting_binary(&mut viewer).await;
    assert_eq!(reply["type"], "attached");
    assert!(
        String::from_utf8_lossy(&replayed).contains("replay_sentinel"),
        "replay did not precede the attach reply: {:?}",
        String::from_utf8_lossy(&replayed)
    );

    // Live bytes produced after the attach arrive after the replay.
    host.send(frame("input", 4, json!({"data": "echo live_sentinel\n"})))
        .await
        .unwrap();
    expect_output_containing(&mut viewer, "live_sentinel").await;
}

// =============================================================================
// Resize propagation
// =============================================================================

#[tokio::test]
async fn test_resize_propagates_to_every_attached_client() {
    let server = start_server(10, Duration::from_secs(60)).await;
    let mut host = connect(server.addr).await;

    host.send(frame(
        "create_session",
        1,
        json!({"name": "host", "cols": 80, "rows": 24}),
    ))
    .await
    .unwrap();
    let created = recv_json(&mut host).await;
    let id = created["payload"]["id"].as_str().unwrap().to_string();

    host.send(frame(
        "attach",
        2,
        json!({"target": id.clone(), "cols": 80, "rows": 24}),
    ))
    .await
    .unwrap();
    let (reply, _) = recv_json_collecting_binary(&mut host).await;
    assert_eq!(reply["type"], "attached");

    // A zero-sized attach request leaves the session size untouched.
    let mut viewer = connect(server.addr).await;
    viewer
        .send(frame("attach", 1, json!({"target": id.clone(), "cols": 0, "rows": 0})))
        .await
        .unwrap();
    let (reply, _) = recv_json_collecting_binary(&mut viewer).await;
    assert_eq!(reply["payload"]["cols"], 80);
    assert_eq!(reply["payload"]["rows"], 24);

    host.send(frame("resize", 3, json!({"cols": 160, "rows": 48})))
        .await
        .unwrap();

    for ws in [&mut host, &mut viewer] {
        let resized = loop {
            let msg = recv_json(ws).await;
            if msg["type"] == "resized" {
                break msg;
            }
        };
        assert_eq!(resized["seq"], 0);
        assert_eq!(resized["payload"]["cols"], 160);
        assert_eq!(resized["payload"]["rows"], 48);
    }

    let session = server.store.get(&id).unwrap();
    assert_eq!(session.size(), (160, 48));
}

// =============================================================================
// State machine errors
// =============================================================================

#[tokio::test]
async fn test_protocol_errors_mirror_seq_and_preserve_state() {
    let server = start_server(10, Duration::from_secs(60)).await;
    let mut ws = connect(server.addr).await;

    // input while browsing
    ws.send(frame("input", 7, json!({"data": "x"}))).await.unwrap();
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["seq"], 7);
    assert_eq!(reply["payload"]["code"], "NOT_ATTACHED");

    // resize while browsing
    ws.send(frame("resize", 8, json!({"cols": 10, "rows": 10})))
        .await
        .unwrap();
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["payload"]["code"], "NOT_ATTACHED");

    // detach while browsing
    ws.send(frame("detach", 9, json!({}))).await.unwrap();
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["payload"]["code"], "NOT_ATTACHED");

    // unknown attach target
    ws.send(frame(
        "attach",
        10,
        json!({"target": "no-such-id", "cols": 80, "rows": 24}),
    ))
    .await
    .unwrap();
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["seq"], 10);
    assert_eq!(reply["payload"]["code"], "SESSION_NOT_FOUND");

    // unparseable frame -> PARSE_ERROR with seq 0
    ws.send(Message::Text("not json at all".to_string()))
        .await
        .unwrap();
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["seq"], 0);
    assert_eq!(reply["payload"]["code"], "PARSE_ERROR");

    // unknown message type -> PARSE_ERROR
    ws.send(frame("reboot", 11, json!({}))).await.unwrap();
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["payload"]["code"], "PARSE_ERROR");

    // the connection is still usable afterwards
    ws.send(frame("list_sessions", 12, json!({}))).await.unwrap();
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "session_list");
    assert_eq!(reply["seq"], 12);
}

#[tokio::test]
async fn test_double_attach_rejected_without_state_change() {
    let server = start_server(10, Duration::from_secs(60)).await;
    let mut ws = connect(server.addr).await;

    ws.send(frame(
        "create_session",
        1,
        json!({"name": "a", "cols": 80, "rows": 24}),
    ))
    .await
    .unwrap();
    let id = recv_json(&mut ws).await["payload"]["id"]
        .as_str()
        .unwrap()
        .to_string();

    ws.send(frame("attach", 2, json!({"target": id.clone(), "cols": 80, "rows": 24})))
        .await
        .unwrap();
    let (reply, _) = recv_json_collecting_binary(&mut ws).await;
    assert_eq!(reply["type"], "attached");

    ws.send(frame("attach", 3, json!({"target": id.clone(), "cols": 80, "rows": 24})))
        .await
        .unwrap();
    let reply = loop {
        let msg = recv_json(&mut ws).await;
        if msg["type"] == "error" {
            break msg;
        }
    };
    assert_eq!(reply["seq"], 3);
    assert_eq!(reply["payload"]["code"], "ALREADY_ATTACHED");

    // Still attached: input keeps flowing.
    ws.send(frame("input", 4, json!({"data": "echo still_attached\n"})))
        .await
        .unwrap();
    expect_output_containing(&mut ws, "still_attached").await;
}

#[tokio::test]
async fn test_detach_then_reattach() {
    let server = start_server(10, Duration::from_secs(60)).await;
    let mut ws = connect(server.addr).await;

    ws.send(frame(
        "create_session",
        1,
        json!({"name": "d", "cols": 80, "rows": 24}),
    ))
    .await
    .unwrap();
    let id = recv_json(&mut ws).await["payload"]["id"]
        .as_str()
        .unwrap()
        .to_string();

    ws.send(frame("attach", 2, json!({"target": id.clone(), "cols": 80, "rows": 24})))
        .await
        .unwrap();
    let (reply, _) = recv_json_collecting_binary(&mut ws).await;
    assert_eq!(reply["type"], "attached");

    ws.send(frame("detach", 3, json!({}))).await.unwrap();
    let reply = loop {
        let msg = recv_json(&mut ws).await;
        if msg["type"] == "detached" {
            break msg;
        }
    };
    assert_eq!(reply["seq"], 3);
    assert_eq!(reply["payload"]["reason"], "client_request");

    // Detach followed by attach is honored in order.
    ws.send(frame("attach", 4, json!({"target": id.clone(), "cols": 80, "rows": 24})))
        .await
        .unwrap();
    let (reply, _) = recv_json_collecting_binary(&mut ws).await;
    assert_eq!(reply["type"], "attached");
    assert_eq!(reply["seq"], 4);
}

#[tokio::test]
async fn test_session_exit_pushes_detached() {
    let server = start_server(10, Duration::from_secs(60)).await;
    let mut ws = connect(server.addr).await;

    ws.send(frame(
        "create_session",
        1,
        json!({"name": "mortal", "cols": 80, "rows": 24}),
    ))
    .await
    .unwrap();
    let id = recv_json(&mut ws).await["payload"]["id"]
        .as_str()
        .unwrap()
        .to_string();

    ws.send(frame("attach", 2, json!({"target": id.clone(), "cols": 80, "rows": 24})))
        .await
        .unwrap();
    let (reply, _) = recv_json_collecting_binary(&mut ws).await;
    assert_eq!(reply["type"], "attached");

    ws.send(frame("input", 3, json!({"data": "exit 0\n"})))
        .await
        .unwrap();

    let detached = loop {
        let msg = recv_json(&mut ws).await;
        if msg["type"] == "detached" {
            break msg;
        }
    };
    assert_eq!(detached["seq"], 0);
    assert_eq!(detached["payload"]["reason"], "session_exit");

    // The exited session is retained in the listing until removed.
    ws.send(frame("list_sessions", 4, json!({}))).await.unwrap();
    let reply = recv_json(&mut ws).await;
    let sessions = reply["payload"]["sessions"].as_array().unwrap();
    let entry = sessions.iter().find(|s| s["id"] == id.as_str()).unwrap();
    assert_eq!(entry["status"], "exited");
}

// =============================================================================
// Admission control
// =============================================================================

#[tokio::test]
async fn test_client_cap_rejects_with_overloaded_close_code() {
    let server = start_server(1, Duration::from_secs(60)).await;

    let mut first = connect(server.addr).await;
    first.send(frame("list_sessions", 1, json!({}))).await.unwrap();
    recv_json(&mut first).await;
    assert_eq!(server.manager.client_count(), 1);

    let mut second = connect(server.addr).await;
    let msg = timeout(Duration::from_secs(5), second.next())
        .await
        .expect("timed out")
        .expect("stream ended");
    match msg {
        Ok(Message::Close(Some(close))) => {
            assert_eq!(u16::from(close.code), 1013);
        }
        other => panic!("expected close 1013, got {other:?}"),
    }
    assert_eq!(server.manager.client_count(), 1);
}

// =============================================================================
// Idle shutdown
// =============================================================================

#[tokio::test]
async fn test_idle_sink_fires_after_last_client_disconnects() {
    let mut server = start_server(10, Duration::from_millis(200)).await;

    let mut ws = connect(server.addr).await;
    ws.send(frame("list_sessions", 1, json!({}))).await.unwrap();
    recv_json(&mut ws).await;
    drop(ws);

    timeout(Duration::from_secs(3), server.idle_rx.recv())
        .await
        .expect("idle sink never fired")
        .expect("idle channel closed");
}

#[tokio::test]
async fn test_running_session_blocks_idle_shutdown() {
    let mut server = start_server(10, Duration::from_millis(200)).await;

    let mut ws = connect(server.addr).await;
    ws.send(frame(
        "create_session",
        1,
        json!({"name": "keeper", "cols": 80, "rows": 24}),
    ))
    .await
    .unwrap();
    recv_json(&mut ws).await;
    drop(ws);

    // Client is gone but the session still runs: no idle.
    let fired = timeout(Duration::from_millis(800), server.idle_rx.recv()).await;
    assert!(fired.is_err(), "idle fired while a session was running");
}

// =============================================================================
// HTTP surfaces
// =============================================================================

#[tokio::test]
async fn test_health_endpoint_reports_client_count() {
    let server = start_server(10, Duration::from_secs(60)).await;

    let response = http_get(server.addr, "/health").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("\"status\":\"ok\""));
    assert!(response.contains("\"clients\":0"));

    let mut ws = connect(server.addr).await;
    ws.send(frame("list_sessions", 1, json!({}))).await.unwrap();
    recv_json(&mut ws).await;

    let response = http_get(server.addr, "/health").await;
    assert!(response.contains("\"clients\":1"));
}

#[tokio::test]
async fn test_static_traversal_refused() {
    let server = start_server(10, Duration::from_secs(60)).await;

    let response = http_get(server.addr, "/../etc/passwd").await;
    assert!(
        response.starts_with("HTTP/1.1 403"),
        "expected 403, got: {}",
        response.lines().next().unwrap_or("")
    );

    let response = http_get(server.addr, "/missing.html").await;
    assert!(response.starts_with("HTTP/1.1 404"));
}
