//! HTTP surface of the gateway.

mod app_proxy;
mod auth;
mod health;
mod vnc;

use axum::http::header::{HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use axum::http::Method;
use axum::middleware;
use axum::response::Response;
use axum::routing::{any, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::AppState;

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/login", post(auth::login))
        .route("/logout", post(auth::logout))
        .route("/isAuthenticated", get(auth::is_authenticated))
        .route("/connected", get(app_proxy::is_connected))
        .route("/vnc/ws", get(vnc::on_websocket))
        .route("/vnc/ws/probe", get(vnc::probe))
        .route("/app/ws", get(app_proxy::on_control_websocket))
        .route("/app/{*path}", any(app_proxy::proxy_app))
        .route("/host/{*path}", any(app_proxy::proxy_host));

    Router::new()
        .merge(health::router())
        .nest("/api", api)
        .layer(cors_layer(&state))
        .layer(middleware::from_fn(secure_headers))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Fixed allow-list for the QA portal origins. Preflights to `/api/app/*`
/// are answered by the layer before any authentication runs.
fn cors_layer(state: &AppState) -> CorsLayer {
    let origins: Vec<HeaderValue> = if state.config.production {
        vec![HeaderValue::from_static("https://qa.hama.com")]
    } else {
        vec![
            HeaderValue::from_static("https://qa-test.hama.com"),
            HeaderValue::from_static("https://qa-rc.hama.com"),
            HeaderValue::from_static("http://localhost:8081"),
        ]
    };

    let db = HeaderName::from_static("db");
    CorsLayer::new()
        .allow_origin(origins)
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([db.clone(), AUTHORIZATION, CONTENT_TYPE])
        .expose_headers([db])
}

async fn secure_headers(req: axum::extract::Request, next: middleware::Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        "Content-Security-Policy",
        HeaderValue::from_static(
            "default-src 'self'; script-src 'self' localhost:5173 'unsafe-inline'; \
             connect-src 'self' ws: wss: localhost:5173; img-src * data: blob: 'unsafe-inline'; \
             frame-src *; style-src 'self' localhost:5173 'unsafe-inline';",
        ),
    );
    headers.insert(
        "Referrer-Policy",
        HeaderValue::from_static("origin-when-cross-origin"),
    );
    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("X-Frame-Options", HeaderValue::from_static("deny"));
    headers.insert("X-XSS-Protection", HeaderValue::from_static("0"));
    response
}
