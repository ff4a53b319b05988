use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
    routing::{get, put},
    Json, Router,
};
use mailbridge_shared::event::ChatEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::bridge::Bridge;
use crate::dispatch::dispatch;
use crate::error::ApiError;
use crate::status::StatusSnapshot;

/// How many transaction ids are remembered for de-duplication.
const SEEN_TRANSACTIONS: usize = 1024;

#[derive(Clone)]
pub struct AppState {
    pub bridge: Arc<Bridge>,
    seen: Arc<Mutex<SeenTransactions>>,
}

impl AppState {
    pub fn new(bridge: Arc<Bridge>) -> Self {
        Self {
            bridge,
            seen: Arc::new(Mutex::new(SeenTransactions::default())),
        }
    }
}

#[derive(Default)]
struct SeenTransactions {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenTransactions {
    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Remember `id`; false if it was already seen.
    fn insert(&mut self, id: &str) -> bool {
        if !self.ids.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        if self.order.len() > SEEN_TRANSACTIONS {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(bridge_status))
        .route("/_matrix/app/v1/transactions/:txn_id", put(push_transaction))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct StatusResponse {
    version: &'static str,
    messages: StatusSnapshot,
    portals: usize,
    users: usize,
    logged_in: usize,
}

#[derive(Deserialize)]
struct Transaction {
    #[serde(default)]
    events: Vec<Value>,
    #[serde(default, alias = "de.sorunome.msc2409.ephemeral")]
    ephemeral: Vec<Value>,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn bridge_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let bridge = &state.bridge;
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        messages: bridge.status.snapshot(),
        portals: bridge.portals.len(),
        users: bridge.users.len(),
        logged_in: bridge.users.all().iter().filter(|u| u.is_logged_in()).count(),
    })
}

/// Accept the homeserver token as a bearer header or an `access_token`
/// query parameter.
fn verify_hs_token(
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    expected: &str,
) -> Result<(), ApiError> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| query.get("access_token").map(String::as_str))
        .ok_or(ApiError::MissingToken)?;

    use subtle::ConstantTimeEq;
    let (token, expected) = (token.as_bytes(), expected.as_bytes());
    if token.len() != expected.len() || token.ct_eq(expected).unwrap_u8() != 1 {
        return Err(ApiError::InvalidToken);
    }
    Ok(())
}

async fn push_transaction(
    State(state): State<AppState>,
    Path(txn_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    verify_hs_token(&headers, &query, &state.bridge.config.hs_token)?;

    let transaction: Transaction =
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    // A transaction counts as seen once all of its events are dispatched.
    let done = state
        .seen
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .contains(&txn_id);
    if done {
        debug!(txn_id = %txn_id, "Ignoring repeated transaction");
        return Ok(Json(serde_json::json!({})));
    }

    let raw = transaction.events.iter().chain(transaction.ephemeral.iter());
    let events: Vec<ChatEvent> = raw.filter_map(ChatEvent::from_raw).collect();
    debug!(
        txn_id = %txn_id,
        received = transaction.events.len() + transaction.ephemeral.len(),
        handled = events.len(),
        "Received transaction"
    );
    for event in events {
        dispatch(&state.bridge, event).await;
    }
    state
        .seen
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(&txn_id);

    Ok(Json(serde_json::json!({})))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
