//! The framebuffer WebSocket endpoint and its probe.

use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::auth::middleware::AuthUser;
use crate::gateway::VncSettings;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct VncQuery {
    #[serde(rename = "useGuacamole")]
    use_guacamole: Option<String>,
    quality: Option<String>,
    scale: Option<i32>,
}

impl VncQuery {
    fn settings(&self) -> VncSettings {
        VncSettings {
            scaling: self.scale.unwrap_or(100),
        }
    }
}

/// Upgrade the client and open a session toward the user's pod.
pub async fn on_websocket(
    State(state): State<AppState>,
    AuthUser { user }: AuthUser,
    Query(query): Query<VncQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let use_guacamole = query.use_guacamole.as_deref() == Some("true");
    let settings = query.settings();
    let quality = query.quality.clone().unwrap_or_default();

    // Admission and pod allocation happen before the upgrade so their
    // failures are plain HTTP errors.
    match state.gateway.prepare_session(&user, use_guacamole).await {
        Ok(target) => {
            let gateway = state.gateway.clone();
            ws.on_upgrade(move |socket| {
                gateway.run_session(socket, user, target, use_guacamole, settings, quality)
            })
            .into_response()
        }
        Err(e) => {
            tracing::debug!(code = %e.code, "refused VNC session");
            e.into_response()
        }
    }
}

/// Ensure a pod exists for the user without opening a session.
pub async fn probe(
    State(state): State<AppState>,
    AuthUser { user }: AuthUser,
    Query(query): Query<VncQuery>,
) -> Response {
    match state.gateway.probe(&user, query.settings()).await {
        Ok(()) => "Ok".into_response(),
        Err(e) => e.into_response(),
    }
}
