//! Reusable harness for pam-client integration tests.
//!
//! Provides an in-process fake of the access API (axum), a fake terminal
//! gateway and update feed (tokio-tungstenite), and a capturing terminal
//! surface.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response as WsResponse};
use tokio_tungstenite::tungstenite::Message;

use pam_client::credentials::{CredentialStore, FileCredentialStore};
use pam_client::gateway::{Gateway, ReqwestTransport};
use pam_client::surface::TerminalSurface;

pub const PASSWORD: &str = "correct horse";
pub const SESSION_ID: i64 = 7;
pub const SESSION_TOKEN: &str = "sess-tok/+=";

// ── Fake access API ─────────────────────────────────────────────────

#[derive(Default)]
pub struct ApiState {
    /// Access token currently accepted on protected routes.
    pub valid_access: Mutex<String>,
    /// Whether `/auth/refresh` accepts the refresh token.
    pub refresh_ok: Mutex<bool>,
    pub refresh_calls: AtomicUsize,
    pub start_calls: AtomicUsize,
    pub recording: Mutex<Option<String>>,
    pub channel_address: Mutex<String>,
}

impl ApiState {
    /// Invalidate every issued access token, as if it had expired.
    pub fn expire_access(&self) {
        *self.valid_access.lock().unwrap() = "nobody-has-this".to_string();
    }
}

pub struct FakeApi {
    pub base_url: String,
    pub state: Arc<ApiState>,
}

fn auth_body(access: &str) -> Value {
    json!({
        "access_token": access,
        "refresh_token": "refresh-1",
        "token_type": "bearer",
        "user": {"id": 1, "email": "ops@example.com", "is_admin": false, "mfa_enabled": false}
    })
}

fn detail(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "detail": message }))).into_response()
}

fn authorized(state: &ApiState, headers: &HeaderMap) -> bool {
    let expected = format!("Bearer {}", state.valid_access.lock().unwrap());
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected)
}

async fn login(State(state): State<Arc<ApiState>>, Json(body): Json<Value>) -> Response {
    if body["password"] != PASSWORD {
        return detail(StatusCode::UNAUTHORIZED, "Invalid credentials");
    }
    *state.valid_access.lock().unwrap() = "access-1".to_string();
    Json(auth_body("access-1")).into_response()
}

async fn refresh(State(state): State<Arc<ApiState>>, Json(body): Json<Value>) -> Response {
    let n = state.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
    if !*state.refresh_ok.lock().unwrap() || body["refresh_token"] != "refresh-1" {
        return detail(StatusCode::UNAUTHORIZED, "Invalid refresh token");
    }
    let access = format!("access-{}", n + 1);
    *state.valid_access.lock().unwrap() = access.clone();
    Json(auth_body(&access)).into_response()
}

async fn list_requests(State(state): State<Arc<ApiState>>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return detail(StatusCode::UNAUTHORIZED, "Not authenticated");
    }
    Json(json!([
        {
            "id": 1, "user_id": 1, "asset_id": 3, "role_id": 2,
            "reason": "rotate db creds", "duration_minutes": 30,
            "status": "APPROVED", "approved_by": 9,
            "created_at": "2026-03-01T12:00:00",
            "expires_at": "2099-01-01T00:00:00"
        },
        {
            "id": 2, "user_id": 1, "asset_id": 4, "role_id": 2,
            "reason": "", "duration_minutes": 15,
            "status": "PENDING", "approved_by": null,
            "created_at": "2026-03-01T12:05:00+00:00",
            "expires_at": null
        }
    ]))
    .into_response()
}

async fn start_session(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&state, &headers) {
        return detail(StatusCode::UNAUTHORIZED, "Not authenticated");
    }
    state.start_calls.fetch_add(1, Ordering::SeqCst);
    match body["jit_request_id"].as_i64() {
        Some(1) => {}
        Some(2) => return detail(StatusCode::FORBIDDEN, "JIT request not approved"),
        Some(3) => return detail(StatusCode::FORBIDDEN, "JIT request expired"),
        _ => return detail(StatusCode::NOT_FOUND, "JIT request not found"),
    }
    Json(json!({
        "session_id": SESSION_ID,
        "session_token": SESSION_TOKEN,
        "websocket_url": state.channel_address.lock().unwrap().clone(),
    }))
    .into_response()
}

async fn recording(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(_session_id): Path<i64>,
) -> Response {
    if !authorized(&state, &headers) {
        return detail(StatusCode::UNAUTHORIZED, "Not authenticated");
    }
    match state.recording.lock().unwrap().clone() {
        Some(text) => (StatusCode::OK, text).into_response(),
        None => detail(StatusCode::NOT_FOUND, "Recording file missing"),
    }
}

pub async fn spawn_api() -> FakeApi {
    let state = Arc::new(ApiState {
        refresh_ok: Mutex::new(true),
        ..Default::default()
    });
    let app = Router::new()
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/jit-requests", get(list_requests))
        .route("/sessions/start", post(start_session))
        .route("/sessions/:session_id/recording", get(recording))
        .with_state(Arc::clone(&state));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    FakeApi {
        base_url: format!("http://{addr}"),
        state,
    }
}

/// A gateway against `api` backed by a credential file in `dir`.
pub fn gateway(api: &FakeApi, dir: &std::path::Path) -> (Arc<Gateway>, Arc<FileCredentialStore>) {
    let store = Arc::new(FileCredentialStore::open(dir.join("credentials.json")));
    let transport = Arc::new(ReqwestTransport::new(&api.base_url).unwrap());
    let shared: Arc<dyn CredentialStore> = store.clone();
    (Arc::new(Gateway::new(transport, shared)), store)
}

// ── Fake terminal gateway ───────────────────────────────────────────

pub const BANNER: &[u8] = b"welcome to asset-3\r\n$ ";

#[derive(Default)]
pub struct TerminalState {
    pub tokens: Mutex<Vec<String>>,
    pub inputs: Mutex<Vec<Vec<u8>>>,
    /// Close frames received from clients.
    pub close_frames: AtomicUsize,
}

pub struct FakeTerminal {
    pub address: String,
    pub state: Arc<TerminalState>,
}

/// Accepts channel connections after `handshake_delay`, sends [`BANNER`]
/// as a binary frame and `ready` as a text frame, then echoes input. Input
/// `exit\r` makes the server close the channel.
pub async fn spawn_terminal(handshake_delay: Duration) -> FakeTerminal {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(TerminalState::default());
    let shared = Arc::clone(&state);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let state = Arc::clone(&shared);
            tokio::spawn(async move {
                tokio::time::sleep(handshake_delay).await;
                let seen = Arc::clone(&state);
                let callback = move |req: &Request, resp: WsResponse| {
                    let token = req
                        .uri()
                        .query()
                        .and_then(|q| {
                            url::form_urlencoded::parse(q.as_bytes())
                                .find(|(k, _)| k == "token")
                                .map(|(_, v)| v.into_owned())
                        })
                        .unwrap_or_default();
                    seen.tokens.lock().unwrap().push(token);
                    Ok::<_, ErrorResponse>(resp)
                };
                let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                    return;
                };
                if ws.send(Message::Binary(BANNER.to_vec().into())).await.is_err() {
                    return;
                }
                if ws.send(Message::Text("ready".to_string().into())).await.is_err() {
                    return;
                }
                while let Some(message) = ws.next().await {
                    match message {
                        Ok(Message::Binary(data)) => {
                            let data = data.to_vec();
                            state.inputs.lock().unwrap().push(data.clone());
                            if data == b"exit\r" {
                                let _ = ws.close(None).await;
                                break;
                            }
                            if ws.send(Message::Binary(data.into())).await.is_err() {
                                break;
                            }
                        }
                        Ok(Message::Close(_)) => {
                            state.close_frames.fetch_add(1, Ordering::SeqCst);
                            break;
                        }
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
            });
        }
    });

    FakeTerminal {
        address: format!("ws://{addr}/ws/terminal"),
        state,
    }
}

// ── Fake update feed ────────────────────────────────────────────────

/// Sends each of `frames` as a text frame to every client, then closes.
pub async fn spawn_update_feed(frames: Vec<String>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let frames = frames.clone();
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                for frame in frames {
                    if ws.send(Message::Text(frame.into())).await.is_err() {
                        return;
                    }
                }
                let _ = ws.close(None).await;
            });
        }
    });
    format!("ws://{addr}/ws/updates")
}

// ── Capturing surface ───────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct CaptureSurface {
    pub output: Arc<Mutex<Vec<u8>>>,
    pub disposed: Arc<AtomicUsize>,
}

impl CaptureSurface {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.output.lock().unwrap()).into_owned()
    }

    pub fn dispose_count(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl TerminalSurface for CaptureSurface {
    fn write(&mut self, data: &[u8]) {
        self.output.lock().unwrap().extend_from_slice(data);
    }

    fn dispose(&mut self) {
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Waiting ─────────────────────────────────────────────────────────

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Run `fut` with a five second ceiling.
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}
