//! Reverse proxy to one HTTP endpoint of the assigned pod.

use axum::body::Body;
use axum::extract::Request;
use axum::http::header::{
    HeaderName, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING, UPGRADE,
};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Headers that describe the hop, not the payload; the HTTP stacks on both
/// sides re-frame the streamed bodies themselves.
const HOP_BY_HOP: [HeaderName; 5] = [CONNECTION, TRANSFER_ENCODING, UPGRADE, HOST, CONTENT_LENGTH];

/// Proxy handle bound to a single base URL (`http://<pod-ip>:<port>`).
#[derive(Debug, Clone)]
pub struct PodProxy {
    base: String,
    client: reqwest::Client,
}

impl PodProxy {
    pub fn new(base: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            base: base.into(),
            client,
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Forward the request to `base + path_and_query`, streaming both bodies.
    pub async fn forward(&self, path_and_query: &str, req: Request) -> Response {
        let (parts, body) = req.into_parts();
        let url = format!("{}{}", self.base, path_and_query);

        let mut outbound = self
            .client
            .request(parts.method, &url)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()));
        for (name, value) in &parts.headers {
            if HOP_BY_HOP.iter().any(|h| h == name) {
                continue;
            }
            outbound = outbound.header(name, value);
        }

        let upstream = match outbound.send().await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(?e, url = %url, "failed to reach pod endpoint");
                return (StatusCode::BAD_GATEWAY, "Pod endpoint unreachable").into_response();
            }
        };

        let mut builder = Response::builder().status(upstream.status());
        for (name, value) in upstream.headers() {
            if HOP_BY_HOP.iter().any(|h| h == name) {
                continue;
            }
            builder = builder.header(name, value);
        }

        builder
            .body(Body::from_stream(upstream.bytes_stream()))
            .unwrap_or_else(|e| {
                tracing::warn!(?e, "failed to build proxied response");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            })
    }
}
