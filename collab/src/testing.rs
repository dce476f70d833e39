//! In-process mock backend for tests.
//!
//! Serves the collections HTTP surface and the `/ws?room=` push channel on an
//! ephemeral loopback port. Routes can be slowed down, forced to fail, or made
//! to return a non-JSON body; push messages are either scripted per room (sent
//! right after the upgrade) or pushed live with [`MockBackend::push`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::client::CollectionsClient;
use crate::config::BackendAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    List,
    Get,
    Save,
    Run,
}

enum Failure {
    Json(StatusCode, String),
    Plain(StatusCode, String),
}

struct Script {
    messages: Vec<String>,
    close: bool,
}

#[derive(Default)]
struct Inner {
    collections: BTreeMap<String, Value>,
    delays: HashMap<Route, Duration>,
    failures: HashMap<Route, Failure>,
    malformed: HashSet<Route>,
    saves: Vec<Value>,
    runs: Vec<String>,
    scripts: HashMap<String, Script>,
    joined: Vec<String>,
    left: Vec<String>,
}

struct MockState {
    inner: Mutex<Inner>,
    push: broadcast::Sender<(String, String)>,
}

impl MockState {
    fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        f(&mut self.inner.lock().unwrap())
    }

    /// Apply the configured delay, then any forced failure for `route`.
    async fn gate(&self, route: Route) -> Option<Response> {
        let delay = self.with(|i| i.delays.get(&route).copied());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.with(|i| {
            if i.malformed.contains(&route) {
                return Some((StatusCode::OK, "<html>not json</html>").into_response());
            }
            match i.failures.get(&route) {
                Some(Failure::Json(status, msg)) => {
                    Some((*status, Json(json!({ "error": msg }))).into_response())
                }
                Some(Failure::Plain(status, msg)) => Some((*status, msg.clone()).into_response()),
                None => None,
            }
        })
    }
}

pub struct MockBackend {
    addr: SocketAddr,
    state: Arc<MockState>,
    server: tokio::task::JoinHandle<()>,
}

impl MockBackend {
    pub async fn start() -> Self {
        let (push, _) = broadcast::channel(64);
        let state = Arc::new(MockState {
            inner: Mutex::new(Inner::default()),
            push,
        });
        let app = Router::new()
            .route("/api/collections", get(list_collections))
            .route("/api/collections/get", get(get_collection))
            .route("/api/collections/save", post(save_collection))
            .route("/api/run", post(run_collection))
            .route("/ws", get(ws_upgrade))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            addr,
            state,
            server,
        }
    }

    pub fn address(&self) -> BackendAddress {
        BackendAddress::parse(&format!("http://{}", self.addr)).unwrap()
    }

    pub fn insert(&self, name: &str, body: Value) {
        self.state
            .with(|i| i.collections.insert(name.to_string(), body));
    }

    pub fn delay(&self, route: Route, delay: Duration) {
        self.state.with(|i| i.delays.insert(route, delay));
    }

    pub fn fail(&self, route: Route, status: u16, message: &str) {
        let status = StatusCode::from_u16(status).unwrap();
        self.state.with(|i| {
            i.failures
                .insert(route, Failure::Json(status, message.to_string()))
        });
    }

    pub fn fail_plain(&self, route: Route, status: u16, message: &str) {
        let status = StatusCode::from_u16(status).unwrap();
        self.state.with(|i| {
            i.failures
                .insert(route, Failure::Plain(status, message.to_string()))
        });
    }

    pub fn malformed(&self, route: Route) {
        self.state.with(|i| i.malformed.insert(route));
    }

    /// Messages sent to every client joining `room`, optionally followed by
    /// a server-side close.
    pub fn script_room(&self, room: &str, messages: &[&str], close: bool) {
        let script = Script {
            messages: messages.iter().map(|m| (*m).to_string()).collect(),
            close,
        };
        self.state
            .with(|i| i.scripts.insert(room.to_string(), script));
    }

    /// Send `message` to every client currently joined to `room`.
    pub fn push(&self, room: &str, message: &str) {
        let _ = self
            .state
            .push
            .send((room.to_string(), message.to_string()));
    }

    pub fn saves(&self) -> Vec<Value> {
        self.state.with(|i| i.saves.clone())
    }

    pub fn runs(&self) -> Vec<String> {
        self.state.with(|i| i.runs.clone())
    }

    /// Rooms in the order their push-channel clients connected.
    pub fn joined(&self) -> Vec<String> {
        self.state.with(|i| i.joined.clone())
    }

    /// Rooms in the order their push-channel clients went away.
    pub fn left(&self) -> Vec<String> {
        self.state.with(|i| i.left.clone())
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn list_collections(State(state): State<Arc<MockState>>) -> Response {
    if let Some(resp) = state.gate(Route::List).await {
        return resp;
    }
    let names: Vec<String> = state.with(|i| i.collections.keys().cloned().collect());
    Json(json!({ "collections": names })).into_response()
}

async fn get_collection(
    State(state): State<Arc<MockState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let Some(resp) = state.gate(Route::Get).await {
        return resp;
    }
    let Some(name) = params.get("name").filter(|n| !n.is_empty()) else {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "missing name" }))).into_response();
    };
    match state.with(|i| i.collections.get(name).cloned()) {
        Some(body) => Json(body).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("collection not found: {name}") })),
        )
            .into_response(),
    }
}

async fn save_collection(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    if let Some(resp) = state.gate(Route::Save).await {
        return resp;
    }
    state.with(|i| i.saves.push(body));
    Json(json!({ "status": "ok" })).into_response()
}

async fn run_collection(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    let name = body["name"].as_str().unwrap_or_default().to_string();
    state.with(|i| i.runs.push(name.clone()));
    if let Some(resp) = state.gate(Route::Run).await {
        return resp;
    }
    Json(json!({ "results": [{ "name": name, "passed": true }] })).into_response()
}

async fn ws_upgrade(
    State(state): State<Arc<MockState>>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(room) = params.get("room").filter(|r| !r.is_empty()).cloned() else {
        return (StatusCode::BAD_REQUEST, "room required").into_response();
    };
    // Subscribe before the handshake completes so nothing pushed after the
    // client sees the upgrade is lost.
    let rx = state.push.subscribe();
    ws.on_upgrade(move |socket| handle_ws(socket, state, room, rx))
}

async fn handle_ws(
    mut socket: WebSocket,
    state: Arc<MockState>,
    room: String,
    mut rx: broadcast::Receiver<(String, String)>,
) {
    state.with(|i| i.joined.push(room.clone()));
    let script = state.with(|i| {
        i.scripts
            .get(&room)
            .map(|s| (s.messages.clone(), s.close))
    });
    if let Some((messages, close)) = script {
        for message in messages {
            if socket.send(Message::Text(message.into())).await.is_err() {
                break;
            }
        }
        if close {
            let _ = socket.send(Message::Close(None)).await;
            // Drain until the client acknowledges the close.
            while let Some(Ok(msg)) = socket.recv().await {
                if matches!(msg, Message::Close(_)) {
                    break;
                }
            }
            state.with(|i| i.left.push(room));
            return;
        }
    }

    loop {
        tokio::select! {
            pushed = rx.recv() => match pushed {
                Ok((target, message)) if target == room => {
                    if socket.send(Message::Text(message.into())).await.is_err() {
                        break;
                    }
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    state.with(|i| i.left.push(room));
}

/// A backend address nothing listens on.
pub async fn unreachable_address() -> BackendAddress {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    BackendAddress::parse(&format!("http://{addr}")).unwrap()
}

pub fn test_client(address: BackendAddress) -> CollectionsClient {
    CollectionsClient::new(address, Duration::from_secs(2), Duration::from_secs(5)).unwrap()
}

/// Poll `check` until it holds, panicking after a few seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
