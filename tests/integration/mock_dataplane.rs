// tests/integration/mock_dataplane.rs

//! An in-process mock of the HAProxy Dataplane API.
//!
//! Serves both the v2 (flat servers, `backend` query parameter) and v3
//! (servers nested under the backend) URL shapes. Writes are applied to the
//! in-memory state immediately and recorded so tests can assert on the exact
//! request sequence. Commit failures (409) can be injected.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct MockState {
    pub version: i64,
    next_txn: u64,
    pub backends: HashMap<String, Value>,
    pub servers: HashMap<String, Vec<Value>>,
    pub transactions_created: usize,
    pub transactions_deleted: usize,
    pub commits: usize,
    pub created_backends: Vec<Value>,
    pub created_servers: Vec<(String, Value)>,
    pub replaced_servers: Vec<(String, Value)>,
    pub deleted_servers: Vec<(String, String)>,
    /// The next N commits answer 409.
    pub fail_commits: usize,
    /// When set, every server write answers 500.
    pub fail_server_writes: bool,
}

type Shared = Arc<Mutex<MockState>>;

pub struct MockDataplane {
    pub state: Shared,
    pub base_url: String,
}

impl MockDataplane {
    pub async fn start() -> Self {
        let state: Shared = Arc::new(Mutex::new(MockState {
            version: 1,
            ..MockState::default()
        }));

        let app = router(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock dataplane");
        let addr = listener.local_addr().expect("mock local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve mock dataplane");
        });

        Self {
            state,
            base_url: format!("http://{addr}"),
        }
    }

    /// Pre-populate a backend with the given server payloads.
    pub fn seed_backend(&self, name: &str, servers: Vec<Value>) {
        let mut state = self.state.lock();
        state
            .backends
            .insert(name.to_string(), json!({ "name": name }));
        state.servers.insert(name.to_string(), servers);
    }
}

/// A standard ten-slot seed: one active slot per given IP, the rest
/// maintenance.
pub fn seeded_servers(active: &[&str]) -> Vec<Value> {
    let mut servers = Vec::new();
    for (i, ip) in active.iter().enumerate() {
        let name = format!("srv{}", i + 1);
        servers.push(json!({
            "name": name,
            "address": ip,
            "port": 8080,
            "maintenance": "disabled",
            "check": "enabled",
            "cookie": name,
        }));
    }
    for i in active.len()..10 {
        let name = format!("srv{}", i + 1);
        servers.push(json!({
            "name": name,
            "address": "127.0.0.1",
            "port": 80,
            "maintenance": "enabled",
            "check": "disabled",
        }));
    }
    servers
}

fn router(state: Shared) -> Router {
    let mut router = Router::new();
    for version in ["v2", "v3"] {
        router = router
            .route(
                &format!("/{version}/services/haproxy/configuration/version"),
                get(get_version),
            )
            .route(
                &format!("/{version}/services/haproxy/transactions"),
                post(create_transaction),
            )
            .route(
                &format!("/{version}/services/haproxy/transactions/{{id}}"),
                put(commit_transaction).delete(delete_transaction),
            )
            .route(
                &format!("/{version}/services/haproxy/configuration/backends"),
                post(create_backend),
            )
            .route(
                &format!("/{version}/services/haproxy/configuration/backends/{{name}}"),
                get(get_backend),
            );
    }
    router
        // v2: flat server collection addressed by a `backend` query param.
        .route(
            "/v2/services/haproxy/configuration/servers",
            get(list_servers_v2).post(create_server_v2),
        )
        .route(
            "/v2/services/haproxy/configuration/servers/{name}",
            put(replace_server_v2).delete(delete_server_v2),
        )
        // v3: servers nested under the backend resource.
        .route(
            "/v3/services/haproxy/configuration/backends/{name}/servers",
            get(list_servers_v3).post(create_server_v3),
        )
        .route(
            "/v3/services/haproxy/configuration/backends/{name}/servers/{srv}",
            put(replace_server_v3).delete(delete_server_v3),
        )
        .with_state(state)
}

async fn get_version(State(state): State<Shared>) -> String {
    state.lock().version.to_string()
}

async fn create_transaction(State(state): State<Shared>) -> Json<Value> {
    let mut state = state.lock();
    state.next_txn += 1;
    state.transactions_created += 1;
    Json(json!({ "id": format!("txn-{}", state.next_txn) }))
}

async fn commit_transaction(State(state): State<Shared>) -> Response {
    let mut state = state.lock();
    if state.fail_commits > 0 {
        state.fail_commits -= 1;
        return (
            StatusCode::CONFLICT,
            Json(json!({ "code": 409, "message": "version mismatch" })),
        )
            .into_response();
    }
    state.commits += 1;
    state.version += 1;
    Json(json!({})).into_response()
}

async fn delete_transaction(State(state): State<Shared>) -> StatusCode {
    state.lock().transactions_deleted += 1;
    StatusCode::NO_CONTENT
}

async fn get_backend(State(state): State<Shared>, Path(name): Path<String>) -> Response {
    match state.lock().backends.get(&name) {
        Some(backend) => Json(json!({ "data": backend })).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "code": 404, "message": "backend not found" })),
        )
            .into_response(),
    }
}

async fn create_backend(State(state): State<Shared>, Json(payload): Json<Value>) -> Response {
    let mut state = state.lock();
    let name = payload
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    state.backends.insert(name.clone(), payload.clone());
    state.servers.entry(name).or_default();
    state.created_backends.push(payload.clone());
    (StatusCode::CREATED, Json(payload)).into_response()
}

fn list_servers(state: &Shared, backend: &str) -> Json<Value> {
    let state = state.lock();
    let servers = state.servers.get(backend).cloned().unwrap_or_default();
    Json(json!({ "data": servers }))
}

fn create_server(state: &Shared, backend: &str, payload: Value) -> Response {
    let mut state = state.lock();
    if state.fail_server_writes {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "code": 500, "message": "injected failure" })),
        )
            .into_response();
    }
    state
        .servers
        .entry(backend.to_string())
        .or_default()
        .push(payload.clone());
    state
        .created_servers
        .push((backend.to_string(), payload.clone()));
    (StatusCode::CREATED, Json(payload)).into_response()
}

fn replace_server(state: &Shared, backend: &str, name: &str, payload: Value) -> Response {
    let mut state = state.lock();
    if state.fail_server_writes {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "code": 500, "message": "injected failure" })),
        )
            .into_response();
    }
    if let Some(servers) = state.servers.get_mut(backend) {
        for server in servers.iter_mut() {
            if server.get("name").and_then(Value::as_str) == Some(name) {
                *server = payload.clone();
            }
        }
    }
    state
        .replaced_servers
        .push((backend.to_string(), payload.clone()));
    Json(payload).into_response()
}

fn delete_server(state: &Shared, backend: &str, name: &str) -> StatusCode {
    let mut state = state.lock();
    if let Some(servers) = state.servers.get_mut(backend) {
        servers.retain(|server| server.get("name").and_then(Value::as_str) != Some(name));
    }
    state
        .deleted_servers
        .push((backend.to_string(), name.to_string()));
    StatusCode::NO_CONTENT
}

fn backend_param(params: &HashMap<String, String>) -> String {
    params.get("backend").cloned().unwrap_or_default()
}

async fn list_servers_v2(
    State(state): State<Shared>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    list_servers(&state, &backend_param(&params))
}

async fn create_server_v2(
    State(state): State<Shared>,
    Query(params): Query<HashMap<String, String>>,
    Json(payload): Json<Value>,
) -> Response {
    create_server(&state, &backend_param(&params), payload)
}

async fn replace_server_v2(
    State(state): State<Shared>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    Json(payload): Json<Value>,
) -> Response {
    replace_server(&state, &backend_param(&params), &name, payload)
}

async fn delete_server_v2(
    State(state): State<Shared>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> StatusCode {
    delete_server(&state, &backend_param(&params), &name)
}

async fn list_servers_v3(State(state): State<Shared>, Path(name): Path<String>) -> Json<Value> {
    list_servers(&state, &name)
}

async fn create_server_v3(
    State(state): State<Shared>,
    Path(name): Path<String>,
    Json(payload): Json<Value>,
) -> Response {
    create_server(&state, &name, payload)
}

async fn replace_server_v3(
    State(state): State<Shared>,
    Path((backend, srv)): Path<(String, String)>,
    Json(payload): Json<Value>,
) -> Response {
    replace_server(&state, &backend, &srv, payload)
}

async fn delete_server_v3(
    State(state): State<Shared>,
    Path((backend, srv)): Path<(String, String)>,
) -> StatusCode {
    delete_server(&state, &backend, &srv)
}
