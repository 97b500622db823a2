//! HTTP + WebSocket entrypoint.
//!
//! Three surfaces on one listener: `GET /health` (always 200), the WebSocket
//! upgrade at `GET /ws` behind a constant-time token check, and a static
//! fallback serving the browser UI assets from the configured web root.
//!
//! The token is accepted from either the `token` query parameter or an
//! `Authorization: Bearer` header and compared against the configured secret
//! with `subtle`'s constant-time equality; a length mismatch still performs a
//! dummy compare so timing does not leak the secret's length. Static paths
//! that resolve outside the web root are refused with 403.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::client::{self, ClientDeps};

/// The configured upgrade secret.
pub struct AuthToken {
    secret: Vec<u8>,
}

impl AuthToken {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Constant-time comparison against the configured secret.
    ///
    /// Length mismatches run a self-compare first so the rejection takes the
    /// same time as a content mismatch of equal length.
    pub fn verify(&self, candidate: &[u8]) -> bool {
        if candidate.len() != self.secret.len() {
            let _ = self.secret.as_slice().ct_eq(self.secret.as_slice());
            return false;
        }
        self.secret.as_slice().ct_eq(candidate).into()
    }
}

/// Shared state behind every gateway route.
#[derive(Clone)]
pub struct GatewayState {
    pub deps: ClientDeps,
    pub auth: Arc<AuthToken>,
    pub web_root: PathBuf,
}

/// Builds the daemon's router.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_upgrade))
        .fallback(serve_static)
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    clients: usize,
}

async fn health(State(state): State<GatewayState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        clients: state.deps.manager.client_count(),
    })
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    State(state): State<GatewayState>,
) -> Response {
    let presented = query.token.or_else(|| bearer_token(&headers));
    let authorized = match &presented {
        Some(token) => state.auth.verify(token.as_bytes()),
        None => state.auth.verify(b""),
    };

    if !authorized {
        tracing::warn!("websocket upgrade rejected: invalid token");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let deps = state.deps.clone();
    ws.on_upgrade(move |socket| client::serve(socket, deps))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

/// Where a static request landed.
enum StaticPath {
    File(PathBuf),
    NotFound,
    Forbidden,
}

async fn serve_static(State(state): State<GatewayState>, uri: Uri) -> Response {
    match resolve_static_path(&state.web_root, uri.path()) {
        StaticPath::File(path) => match tokio::fs::read(&path).await {
            Ok(contents) => {
                let mime = mime_guess::from_path(&path)
                    .first_or_octet_stream()
                    .to_string();
                ([(header::CONTENT_TYPE, mime)], contents).into_response()
            }
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "static read failed");
                StatusCode::NOT_FOUND.into_response()
            }
        },
        StaticPath::NotFound => StatusCode::NOT_FOUND.into_response(),
        StaticPath::Forbidden => {
            tracing::warn!(path = uri.path(), "refused path escaping the web root");
            StatusCode::FORBIDDEN.into_response()
        }
    }
}

/// Maps a request path onto the web root, refusing anything that would
/// resolve outside it, both lexically (`..`, absolute components) and after
/// following symlinks.
fn resolve_static_path(root: &Path, raw_path: &str) -> StaticPath {
    let rel = raw_path.trim_start_matches('/');
    let rel = if rel.is_empty() { "index.html" } else { rel };

    let rel_path = Path::new(rel);
    for component in rel_path.components() {
        if !matches!(component, Component::Normal(_)) {
            return StaticPath::Forbidden;
        }
    }

    let root = match root.canonicalize() {
        Ok(root) => root,
        Err(_) => return StaticPath::NotFound,
    };

    match root.join(rel_path).canonicalize() {
        Ok(resolved) if resolved.starts_with(&root) => {
            if resolved.is_file() {
                StaticPath::File(resolved)
            } else {
                StaticPath::NotFound
            }
        }
        Ok(_) => StaticPath::Forbidden,
        Err(_) => StaticPath::NotFound,
    }
}
