//! In-process fake back ends shared by the integration tests

#![allow(dead_code)]

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::BytesMut;
use gizmo::protocol::RespValue;
use gizmo::{ConnectionProfile, GizmoConfig, RetryOptions};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const PROBE: &str = "RETURN 1";

/// Query the fake graph server holds well past any test deadline
pub const SLOW: &str = "slow";

/// Query the fake graph server answers with an impossible array header
pub const GARBLED: &str = "garbled";

/// Retry settings that keep tests fast
pub fn fast_retry(max_retries: u32) -> RetryOptions {
    RetryOptions {
        max_retries,
        wait_base_secs: 0.001,
        max_wait_secs: 0.002,
    }
}

// ============================================================
// Document endpoint (HTTP)
// ============================================================

/// Behaviour and observations of the fake document endpoint.
/// The probe query is never throttled.
#[derive(Default)]
pub struct DocumentState {
    pub collection_exists: AtomicBool,
    /// Collection lookups still to be answered with 429
    pub lookup_throttles_left: AtomicUsize,
    pub creates: AtomicUsize,
    pub throttles_left: AtomicUsize,
    pub queries: Mutex<Vec<String>>,
}

pub struct FakeDocumentServer {
    pub endpoint: String,
    pub state: Arc<DocumentState>,
}

impl FakeDocumentServer {
    pub async fn start(throttles: usize) -> Self {
        let state = Arc::new(DocumentState::default());
        state.throttles_left.store(throttles, Ordering::SeqCst);

        let app = Router::new()
            .route("/dbs/:db/colls/:graph", get(get_collection))
            .route("/dbs/:db/colls", post(create_collection))
            .route("/dbs/:db/colls/:graph/gremlin", post(gremlin))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            endpoint: format!("http://{}", addr),
            state,
        }
    }

    pub fn profile(&self) -> ConnectionProfile {
        ConnectionProfile {
            document_endpoint: self.endpoint.clone(),
            auth_key: "secret".to_string(),
            database_id: "db".to_string(),
            graph_id: "graph".to_string(),
            request_timeout_secs: 5,
            ..Default::default()
        }
    }

    /// Data queries received, probes excluded
    pub fn queries(&self) -> Vec<String> {
        self.state.queries.lock().unwrap().clone()
    }
}

async fn get_collection(
    State(state): State<Arc<DocumentState>>,
    Path((db, graph)): Path<(String, String)>,
) -> Response {
    if take_one(&state.lookup_throttles_left) {
        let mut out = HeaderMap::new();
        out.insert("x-ms-retry-after-ms", "1".parse().unwrap());
        return (StatusCode::TOO_MANY_REQUESTS, out, Json(json!({ "message": "rate limited" }))).into_response();
    }
    if state.collection_exists.load(Ordering::SeqCst) {
        (StatusCode::OK, Json(json!({ "id": graph, "db": db }))).into_response()
    } else {
        (StatusCode::NOT_FOUND, Json(json!({ "message": "collection not found" }))).into_response()
    }
}

async fn create_collection(
    State(state): State<Arc<DocumentState>>,
    Path(_db): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    if body.get("id").and_then(|v| v.as_str()).is_none() {
        return (StatusCode::BAD_REQUEST, Json(json!({ "message": "id required" }))).into_response();
    }
    state.creates.fetch_add(1, Ordering::SeqCst);
    state.collection_exists.store(true, Ordering::SeqCst);
    (StatusCode::CREATED, Json(body)).into_response()
}

async fn gremlin(
    State(state): State<Arc<DocumentState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("secret") {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "message": "bad key" }))).into_response();
    }
    let query = body["query"].as_str().unwrap_or_default().to_string();

    if query != PROBE {
        if take_one(&state.throttles_left) {
            let mut out = HeaderMap::new();
            out.insert("x-ms-retry-after-ms", "1".parse().unwrap());
            return (StatusCode::TOO_MANY_REQUESTS, out, Json(json!({ "message": "rate limited" })))
                .into_response();
        }
        state.queries.lock().unwrap().push(query.clone());
    }

    let mut out = HeaderMap::new();
    out.insert("x-ms-activity-id", "activity-1".parse().unwrap());

    if query == "fail" || query.starts_with("fail ") {
        return (StatusCode::BAD_REQUEST, out, Json(json!({ "message": "bad query" }))).into_response();
    }

    if query == "paged" {
        let documents = if headers.contains_key("x-ms-continuation") {
            out.insert("x-ms-request-charge", "2.0".parse().unwrap());
            json!([{ "n": 3 }])
        } else {
            out.insert("x-ms-request-charge", "1.5".parse().unwrap());
            out.insert("x-ms-continuation", "page-2".parse().unwrap());
            json!([{ "n": 1 }, { "n": 2 }])
        };
        return (StatusCode::OK, out, Json(json!({ "Documents": documents }))).into_response();
    }

    out.insert("x-ms-request-charge", "3.25".parse().unwrap());
    (StatusCode::OK, out, Json(json!({ "Documents": [{ "query": query }] }))).into_response()
}

// ============================================================
// Graph protocol server (RESP over TCP)
// ============================================================

#[derive(Default)]
pub struct GraphState {
    pub password: String,
    pub throttles_left: AtomicUsize,
    /// Data queries still to be answered by closing the socket
    pub drops_left: AtomicUsize,
    pub sessions: AtomicUsize,
    pub queries: Mutex<Vec<Vec<String>>>,
}

pub struct FakeGraphServer {
    pub host: String,
    pub port: u16,
    pub state: Arc<GraphState>,
}

impl FakeGraphServer {
    pub async fn start(password: &str, throttles: usize) -> Self {
        let state = Arc::new(GraphState {
            password: password.to_string(),
            ..Default::default()
        });
        state.throttles_left.store(throttles, Ordering::SeqCst);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                accept_state.sessions.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_graph(socket, accept_state.clone()));
            }
        });

        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
            state,
        }
    }

    pub fn profile(&self, auth_key: &str) -> ConnectionProfile {
        ConnectionProfile {
            graph_endpoint: self.host.clone(),
            graph_port: self.port,
            auth_key: auth_key.to_string(),
            database_id: "db".to_string(),
            graph_id: "graph".to_string(),
            request_timeout_secs: 5,
            ..Default::default()
        }
    }
}

async fn serve_graph(mut socket: TcpStream, state: Arc<GraphState>) {
    let mut buffer = BytesMut::with_capacity(4096);
    let mut authenticated = state.password.is_empty();

    loop {
        let command = match RespValue::decode(&mut buffer) {
            Ok(Some(command)) => command,
            Ok(None) => match socket.read_buf(&mut buffer).await {
                Ok(0) | Err(_) => return,
                Ok(_) => continue,
            },
            Err(_) => return,
        };

        let args: Vec<String> = match command.as_array() {
            Ok(items) => items.iter().filter_map(|v| v.as_text()).collect(),
            Err(_) => return,
        };
        let is_data_query =
            args.len() >= 3 && args[0].eq_ignore_ascii_case("GRAPH.QUERY") && args[2] != PROBE;
        if is_data_query && authenticated && take_one(&state.drops_left) {
            return;
        }

        let reply = graph_reply(&state, &args, &mut authenticated);
        if is_data_query && args[2] == SLOW {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }

        let mut out = Vec::new();
        if is_data_query && args[2] == GARBLED {
            out.extend_from_slice(b"*4611686018427387904\r\n");
        } else {
            reply.encode(&mut out).unwrap();
        }
        if socket.write_all(&out).await.is_err() {
            return;
        }
    }
}

/// Decrement a counter that is still above zero
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn bulk(s: &str) -> RespValue {
    RespValue::BulkString(Some(s.as_bytes().to_vec()))
}

fn graph_reply(state: &GraphState, args: &[String], authenticated: &mut bool) -> RespValue {
    let name = args.first().map(|s| s.to_ascii_uppercase()).unwrap_or_default();
    match name.as_str() {
        "AUTH" => {
            if args.len() == 3 && args[1] == "/dbs/db/colls/graph" && args[2] == state.password {
                *authenticated = true;
                RespValue::SimpleString("OK".to_string())
            } else {
                RespValue::Error("WRONGPASS invalid username-password pair".to_string())
            }
        }
        _ if !*authenticated => RespValue::Error("NOAUTH Authentication required".to_string()),
        "GRAPH.QUERY" if args.len() >= 3 => {
            let query = args[2].as_str();
            if query != PROBE {
                if take_one(&state.throttles_left) {
                    return RespValue::Error("THROTTLED 1".to_string());
                }
                state.queries.lock().unwrap().push(args.to_vec());
            }
            if query == "boom" {
                return RespValue::Error("ERR syntax error near 'boom'".to_string());
            }
            RespValue::Array(vec![
                RespValue::Array(vec![bulk("graph"), bulk("query")]),
                RespValue::Array(vec![bulk(&args[1]), bulk(query)]),
                RespValue::Array(vec![bulk(&args[1]), RespValue::Integer(2)]),
            ])
        }
        _ => RespValue::Error(format!("ERR unknown command '{}'", name)),
    }
}

/// Config with one "default" connection and fast retries
pub fn config_with(profile: ConnectionProfile, retry: RetryOptions) -> GizmoConfig {
    let mut config = GizmoConfig::default();
    config.connections.insert("default".to_string(), profile);
    config.retry = Some(retry);
    config
}
