use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use fieldline_core::{BranchId, TenantId, UserId};
use fieldline_hub::{ClientRequest, Connection, Hub, LatestValues, ServerMessage, SubscriptionIndex};
use fieldline_token::TokenIssuer;

use crate::metrics::{metrics_body, MetricsState};

#[derive(Clone)]
pub struct AppState {
    pub metrics: Arc<MetricsState>,
    pub hub: Arc<Hub>,
    pub subscriptions: Arc<SubscriptionIndex>,
    pub latest: Arc<LatestValues>,
    pub tokens: Arc<TokenIssuer>,
    pub connection_queue_capacity: usize,
    pub heartbeat_interval: Duration,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .route("/streams/token", post(issue_token))
        .route("/ws", get(ws_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    metrics_body(&state.metrics, &state.hub)
}

#[derive(Deserialize)]
struct TokenRequest {
    tenant: String,
    branch: String,
    user: String,
}

pub fn ws_url(token: &str, tenant: &str, branch: &str) -> String {
    format!("/ws?token={token}&tenant={tenant}&branch={branch}")
}

async fn issue_token(
    State(state): State<AppState>,
    Json(payload): Json<TokenRequest>,
) -> impl IntoResponse {
    let tenant = payload.tenant.trim();
    let branch = payload.branch.trim();
    let user = payload.user.trim();
    if tenant.is_empty() || branch.is_empty() || user.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"ok": false, "error": "tenant, branch and user are required"})),
        );
    }

    let issued = state.tokens.issue(
        TenantId::new(tenant),
        BranchId::new(branch),
        UserId::new(user),
    );
    state.metrics.tokens_issued.fetch_add(1, Ordering::Relaxed);
    debug!(%tenant, %branch, %user, "connection token issued");
    (
        StatusCode::OK,
        Json(json!({
            "ok": true,
            "token": issued.token,
            "expires_at": issued.expires_at,
            "url": ws_url(&issued.token, tenant, branch),
        })),
    )
}

#[derive(Deserialize)]
struct WsQuery {
    token: String,
    tenant: String,
    branch: String,
}

async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let tenant = TenantId::new(query.tenant.clone());
    let branch = BranchId::new(query.branch.clone());
    match state.tokens.validate(&tenant, &branch, &query.token) {
        Ok(user) => ws.on_upgrade(move |socket| handle_socket(state, socket, tenant, branch, user)),
        Err(err) => {
            state
                .metrics
                .token_rejections
                .fetch_add(1, Ordering::Relaxed);
            warn!(tenant = %query.tenant, error = %err, "websocket connect rejected");
            (StatusCode::UNAUTHORIZED, err.to_string()).into_response()
        }
    }
}

async fn handle_socket(
    state: AppState,
    socket: WebSocket,
    tenant: TenantId,
    branch: BranchId,
    user: UserId,
) {
    let partition = tenant.with_branch(&branch);
    let (connection, mut outbound_rx) = Connection::new(
        partition.clone(),
        user.clone(),
        state.connection_queue_capacity,
    );
    // Only the registry holds the live sender. This task keeps an identity
    // handle, so a replacement in the hub closes this connection's queue and
    // ends the writer pump below.
    let handle = connection.handle();
    state.hub.register(connection);
    state
        .metrics
        .ws_connections_total
        .fetch_add(1, Ordering::Relaxed);
    info!(%partition, %user, "live connection opened");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let heartbeat = state.heartbeat_interval;
    let mut writer = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat);
        ticker.tick().await;
        loop {
            tokio::select! {
                queued = outbound_rx.recv() => {
                    let Some(text) = queued else { break };
                    if ws_tx.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    loop {
        tokio::select! {
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        handle_client_request(&state, &partition, &user, &text);
                    }
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            // The pump exits when the registry drops the sender, which
            // happens when this connection is replaced or evicted.
            _ = &mut writer => break,
        }
    }

    state.hub.unregister(&handle);
    state.subscriptions.clear_user(&partition, &user);
    writer.abort();
    info!(%partition, %user, "live connection closed");
}

fn handle_client_request(state: &AppState, partition: &TenantId, user: &UserId, text: &str) {
    let request = match ClientRequest::parse(text) {
        Ok(request) => request,
        Err(err) => {
            debug!(%partition, %user, error = %err, "ignoring malformed client request");
            return;
        }
    };
    let reply = match request {
        ClientRequest::Subscribe { subject } => {
            state.subscriptions.subscribe(partition, &subject, user);
            ServerMessage::SubscribeConfirmed { subject }
        }
        ClientRequest::Unsubscribe { subject } => {
            state.subscriptions.unsubscribe(partition, &subject, user);
            ServerMessage::UnsubscribeConfirmed { subject }
        }
        ClientRequest::GetValue { subject } => {
            let value = state.latest.get(partition, &subject);
            ServerMessage::CurrentValueResponse { subject, value }
        }
    };
    match reply.to_json() {
        Ok(text) => {
            state.hub.send_to_user(partition, user, &text);
        }
        Err(err) => warn!(error = %err, "reply marshaling failed"),
    }
}
