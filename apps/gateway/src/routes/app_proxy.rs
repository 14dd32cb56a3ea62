//! Endpoints that forward into the user's pod: the control WebSocket and
//! the two HTTP reverse proxies.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Path, Request, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::SinkExt as _;
use futures_util::StreamExt as _;

use crate::auth::middleware::AuthUser;
use crate::error::ApiError;
use crate::AppState;

/// `{"status": "connected" | "disconnected"}`.
pub async fn is_connected(State(state): State<AppState>, AuthUser { user }: AuthUser) -> Response {
    let status = if state.gateway.is_user_connected(&user) {
        "connected"
    } else {
        "disconnected"
    };
    Json(serde_json::json!({ "status": status })).into_response()
}

/// Upgrade to the control channel of the user's session.
pub async fn on_control_websocket(
    State(state): State<AppState>,
    AuthUser { user }: AuthUser,
    ws: WebSocketUpgrade,
) -> Response {
    match state.gateway.control_peer(&user) {
        Ok(control) => ws
            .on_upgrade(move |socket| control.attach_client(socket))
            .into_response(),
        Err(e) => {
            tracing::trace!(code = %e.code, "refusing control websocket");
            // The client asked for an upgrade; deliver the error as a close
            // frame instead of an HTTP status.
            ws.on_upgrade(move |socket| close_with_error(socket, e))
                .into_response()
        }
    }
}

async fn close_with_error(socket: WebSocket, e: ApiError) {
    let (mut sink, _stream) = socket.split();
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: 1008,
            reason: format!("{}: {}", e.status.as_u16(), e.message).into(),
        })))
        .await;
    let _ = sink.close().await;
}

/// Reverse proxy to the pod application API; `/api/app` is stripped.
pub async fn proxy_app(
    State(state): State<AppState>,
    AuthUser { user }: AuthUser,
    Path(path): Path<String>,
    req: Request,
) -> Response {
    let target = match req.uri().query() {
        Some(query) => format!("/{path}?{query}"),
        None => format!("/{path}"),
    };
    match state.gateway.proxy_app_request(&user, &target, req).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// Reverse proxy to the pod host API; `/api/host` becomes `/api`.
pub async fn proxy_host(
    State(state): State<AppState>,
    AuthUser { user }: AuthUser,
    Path(path): Path<String>,
    req: Request,
) -> Response {
    let target = match req.uri().query() {
        Some(query) => format!("/api/{path}?{query}"),
        None => format!("/api/{path}"),
    };
    match state.gateway.proxy_host_request(&user, &target, req).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}
