//! HTTP surface and inbound peer endpoint.
//!
//! Layer order, outermost first: trace, CORS, bearer auth (`/api/*` only),
//! security gate, routes. Unauthenticated requests never reach the gate.

use crate::hub::Hub;
use axum::body::{Body, Bytes};
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use fleetlink_gate::{security_gate, UserId};
use fleetlink_types::capability::{capability_list, parse_capability_list};
use fleetlink_types::config::SubscriptionConfig;
use fleetlink_types::error::FleetError;
use fleetlink_types::message::{ops, Message, MessageType};
use fleetlink_wire::adapter::inbound::{InboundSession, INBOUND_HEARTBEAT};
use fleetlink_wire::codec;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// How long an inbound peer has to send its handshake after the upgrade.
const INBOUND_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    /// SECURITY: zeroized on drop. Empty disables auth.
    api_key: Arc<Zeroizing<String>>,
}

impl AppState {
    pub fn new(hub: Arc<Hub>) -> Self {
        let api_key = Arc::new(Zeroizing::new(hub.config().api_key.clone()));
        Self { hub, api_key }
    }
}

/// Build the full router.
pub fn router(hub: Arc<Hub>) -> Router {
    let state = AppState::new(Arc::clone(&hub));
    let gate = Arc::clone(hub.gate());

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/peers", get(list_peers))
        .route("/api/peers/{id}", get(get_peer))
        .route("/api/peers/{id}/command", post(execute_command))
        .route("/api/peers/{id}/connect", post(connect_peer))
        .route("/api/peers/{id}/disconnect", post(disconnect_peer))
        .route("/api/peers/{id}/reconnect/enable", post(enable_reconnect))
        .route("/api/peers/{id}/reconnect/disable", post(disable_reconnect))
        .route("/api/peers/{id}/subscriptions", post(add_subscription))
        .route("/api/peers/{id}/subscriptions/{op}", delete(remove_subscription))
        .route("/api/security", get(security_snapshot))
        .route("/wbp/connect", get(inbound_upgrade))
        .fallback(not_found)
        .layer(axum::middleware::from_fn_with_state(gate, security_gate))
        .layer(axum::middleware::from_fn_with_state(state.clone(), bearer_auth))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    hub: Arc<Hub>,
    listener: tokio::net::TcpListener,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, "Hub API listening");
    axum::serve(
        listener,
        router(hub).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "success": false,
            "error": code,
            "message": message.into(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    )
        .into_response()
}

fn peer_not_found(id: &str) -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        "peer_not_found",
        format!("No peer with server id '{id}'"),
    )
}

async fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "not_found", "No such route")
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

/// Bearer-token check for `/api/*`.
///
/// Constant-time comparison. Marks the caller as the operator so the gate
/// tracks it separately from anonymous traffic on the same address.
async fn bearer_auth(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    if state.api_key.is_empty() || !request.uri().path().starts_with("/api/") {
        return next.run(request).await;
    }

    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    let authorized: bool = state.api_key.as_bytes().ct_eq(presented.as_bytes()).into();
    if !authorized {
        warn!(path = %request.uri().path(), "Rejected request with missing or invalid API key");
        return error_response(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "Missing or invalid API key",
        );
    }

    request.extensions_mut().insert(UserId("operator".to_string()));
    next.run(request).await
}

// ---------------------------------------------------------------------------
// API handlers
// ---------------------------------------------------------------------------

/// GET /api/health
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.hub.health())
}

/// GET /api/peers
async fn list_peers(State(state): State<AppState>) -> impl IntoResponse {
    let peers: Vec<_> = state.hub.bridges().iter().map(|b| b.snapshot()).collect();
    Json(peers)
}

/// GET /api/peers/{id}
async fn get_peer(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.hub.bridge(&id) {
        Some(bridge) => Json(bridge.snapshot()).into_response(),
        None => peer_not_found(&id),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandRequest {
    command: String,
    timeout_ms: Option<u64>,
}

/// POST /api/peers/{id}/command
async fn execute_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CommandRequest>,
) -> Response {
    let Some(bridge) = state.hub.bridge(&id) else {
        return peer_not_found(&id);
    };
    if req.command.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "invalid_command", "Command is empty");
    }
    if req.command.contains(['\r', '\n']) {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_command",
            "Command must be a single line",
        );
    }

    let timeout = req.timeout_ms.map(Duration::from_millis);
    match bridge.execute_command(&req.command, timeout).await {
        Ok(result) => {
            debug!(server_id = %id, success = result.success, "Command finished");
            Json(result).into_response()
        }
        Err(e @ FleetError::CapabilityDenied(_)) => {
            error_response(StatusCode::BAD_REQUEST, "capability_denied", e.to_string())
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal", e.to_string()),
    }
}

/// POST /api/peers/{id}/connect
async fn connect_peer(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(bridge) = state.hub.bridge(&id) else {
        return peer_not_found(&id);
    };
    bridge.connect().await;
    Json(bridge.snapshot()).into_response()
}

/// POST /api/peers/{id}/disconnect
async fn disconnect_peer(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(bridge) = state.hub.bridge(&id) else {
        return peer_not_found(&id);
    };
    bridge.disconnect().await;
    Json(bridge.snapshot()).into_response()
}

/// POST /api/peers/{id}/reconnect/enable
async fn enable_reconnect(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(bridge) = state.hub.bridge(&id) else {
        return peer_not_found(&id);
    };
    bridge.reconnect().enable();
    Json(bridge.reconnect().status()).into_response()
}

/// POST /api/peers/{id}/reconnect/disable
async fn disable_reconnect(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(bridge) = state.hub.bridge(&id) else {
        return peer_not_found(&id);
    };
    bridge.reconnect().disable();
    Json(bridge.reconnect().status()).into_response()
}

/// POST /api/peers/{id}/subscriptions
async fn add_subscription(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SubscriptionConfig>,
) -> Response {
    let Some(bridge) = state.hub.bridge(&id) else {
        return peer_not_found(&id);
    };
    if req.op.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "invalid_subscription", "Op is empty");
    }
    bridge.subscribe(req.op, req.filter);
    (StatusCode::CREATED, Json(bridge.subscriptions().list())).into_response()
}

/// DELETE /api/peers/{id}/subscriptions/{op}
async fn remove_subscription(
    State(state): State<AppState>,
    Path((id, op)): Path<(String, String)>,
) -> Response {
    let Some(bridge) = state.hub.bridge(&id) else {
        return peer_not_found(&id);
    };
    if bridge.unsubscribe(&op) {
        Json(bridge.subscriptions().list()).into_response()
    } else {
        error_response(
            StatusCode::NOT_FOUND,
            "subscription_not_found",
            format!("Peer '{id}' has no subscription for '{op}'"),
        )
    }
}

/// GET /api/security
async fn security_snapshot(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.hub.gate().snapshot())
}

// ---------------------------------------------------------------------------
// Inbound peers
// ---------------------------------------------------------------------------

/// GET /wbp/connect
async fn inbound_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| inbound_socket(state.hub, socket))
}

async fn inbound_socket(hub: Arc<Hub>, mut socket: WebSocket) {
    let first = match tokio::time::timeout(INBOUND_HANDSHAKE_TIMEOUT, socket.recv()).await {
        Ok(Some(Ok(WsMessage::Text(text)))) => text,
        Ok(_) => {
            debug!("Inbound socket closed before handshake");
            return;
        }
        Err(_) => {
            warn!("Inbound peer sent no handshake in time");
            let _ = socket.send(WsMessage::Close(None)).await;
            return;
        }
    };

    let handshake = match codec::decode(first.as_str()) {
        Ok(msg) if msg.kind == MessageType::System && msg.op == ops::HANDSHAKE => msg,
        Ok(msg) => {
            warn!(op = %msg.op, "Inbound peer did not open with a handshake");
            let _ = socket.send(WsMessage::Close(None)).await;
            return;
        }
        Err(e) => {
            warn!(error = %e, "Undecodable inbound handshake");
            let _ = socket.send(WsMessage::Close(None)).await;
            return;
        }
    };

    let (session, reply) = match accept_inbound(&hub, &handshake) {
        Ok(accepted) => accepted,
        Err(reason) => {
            warn!(reason = %reason, "Inbound handshake rejected");
            let reply = Message::response_to(&handshake, false, json!({}), Some(reason));
            if let Ok(text) = codec::encode(&reply) {
                let _ = socket.send(WsMessage::Text(text.into())).await;
            }
            let _ = socket.send(WsMessage::Close(None)).await;
            return;
        }
    };
    match codec::encode(&reply) {
        Ok(text) => {
            if socket.send(WsMessage::Text(text.into())).await.is_err() {
                session.closed("handshake reply failed");
                return;
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to encode handshake reply");
            session.closed("handshake reply failed");
            return;
        }
    }

    pump_inbound(socket, session).await;
}

/// Authenticate a handshake and attach it to its peer's adapter.
fn accept_inbound(hub: &Hub, handshake: &Message) -> Result<(InboundSession, Message), String> {
    let server_id = handshake
        .data_str("serverId")
        .or(handshake.server_id.as_deref())
        .ok_or_else(|| "handshake has no serverId".to_string())?;
    let bridge = hub
        .bridge(server_id)
        .ok_or_else(|| format!("unknown peer '{server_id}'"))?;
    let inbound = bridge
        .adapter()
        .as_inbound()
        .ok_or_else(|| format!("peer '{server_id}' does not accept inbound connections"))?;
    if !inbound.verify_token(handshake.data_str("token")) {
        return Err("invalid token".to_string());
    }

    let advertised = handshake
        .data
        .get("capabilities")
        .and_then(parse_capability_list);
    let session = inbound.attach(advertised).map_err(|e| e.to_string())?;
    info!(server_id, "Inbound peer attached");

    let reply = Message::response_to(
        handshake,
        true,
        json!({
            "hubId": hub.config().hub_id,
            "capabilities": capability_list(&bridge.capabilities()),
        }),
        None,
    )
    .with_server_id(server_id.to_string());
    Ok((session, reply))
}

async fn pump_inbound(mut socket: WebSocket, mut session: InboundSession) {
    let mut heartbeat = tokio::time::interval(INBOUND_HEARTBEAT);
    heartbeat.tick().await;

    let reason = loop {
        tokio::select! {
            frame = socket.recv() => match frame {
                Some(Ok(WsMessage::Text(text))) => session.deliver(text.as_str()),
                Some(Ok(WsMessage::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => session.deliver(text),
                    Err(_) => warn!("Dropping non-UTF-8 binary frame from inbound peer"),
                },
                Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => session.touch(),
                Some(Ok(WsMessage::Close(_))) | None => break "peer closed",
                Some(Err(e)) => {
                    debug!(error = %e, "Inbound socket error");
                    break "socket error";
                }
            },
            outgoing = session.next_outgoing() => match outgoing {
                Some(text) => {
                    if socket.send(WsMessage::Text(text.into())).await.is_err() {
                        break "send failed";
                    }
                }
                None => {
                    let _ = socket.send(WsMessage::Close(None)).await;
                    break "closed by hub";
                }
            },
            _ = heartbeat.tick() => {
                if !session.is_current() {
                    let _ = socket.send(WsMessage::Close(None)).await;
                    break "replaced by newer socket";
                }
                if socket.send(WsMessage::Ping(Bytes::new())).await.is_err() {
                    break "heartbeat failed";
                }
            }
        }
    };
    session.closed(reason);
}
