//! Login, logout and the authentication probe.

use std::collections::HashMap;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{HeaderValue, CONTENT_TYPE, ORIGIN, SET_COOKIE};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Form;

use crate::auth::middleware::AuthUser;
use crate::AppState;

const LOGIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Proxy the credentials to the LFS service endpoint. On success the
/// upstream cookie is re-issued under the gateway's own cookie name.
pub async fn login(
    State(state): State<AppState>,
    Form(mut form): Form<HashMap<String, String>>,
) -> Response {
    if state.config.production {
        let db = form.get("db").cloned().unwrap_or_default();
        if db.to_lowercase() != "lfs" {
            return (
                StatusCode::BAD_REQUEST,
                format!("Invalid db selected in production: {db}"),
            )
                .into_response();
        }
    }

    // Ask the endpoint for a v2 (encrypted-claims) token.
    form.insert("version".to_string(), "2".to_string());

    let upstream_url = format!("{}/user/login", state.config.lfs_service_endpoint);
    let upstream = match reqwest::Client::new()
        .post(&upstream_url)
        .header(ORIGIN, "javalfs")
        .form(&form)
        .timeout(LOGIN_TIMEOUT)
        .send()
        .await
    {
        Ok(resp) => resp,
        Err(e) => {
            tracing::warn!(?e, "failed to call login endpoint of LFS");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server error").into_response();
        }
    };

    let status = upstream.status();
    let content_type = upstream.headers().get(CONTENT_TYPE).cloned();
    let upstream_cookie = upstream
        .headers()
        .get(SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = upstream.bytes().await.unwrap_or_default();

    let mut builder = Response::builder().status(status);
    if let Some(ct) = content_type {
        builder = builder.header(CONTENT_TYPE, ct);
    }

    if status == StatusCode::OK {
        let Some(raw) = upstream_cookie else {
            tracing::warn!("no cookie received from login endpoint on http 200");
            return (StatusCode::INTERNAL_SERVER_ERROR, "No cookie set").into_response();
        };
        tracing::debug!("received cookie from login endpoint");
        builder = builder.header(
            SET_COOKIE,
            rename_cookie(&raw, &state.config.jwt_cookie_name),
        );
    } else {
        tracing::debug!(status = status.as_u16(), "login failed");
    }

    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

pub async fn is_authenticated(AuthUser { user: _ }: AuthUser) -> &'static str {
    "Ok"
}

/// Clear the auth cookie and forward a stop request to the pod host API.
pub async fn logout(
    State(state): State<AppState>,
    AuthUser { user }: AuthUser,
    req: Request,
) -> Response {
    // The cookie is decided before the proxy starts writing; no header is
    // touched after dispatch begins.
    let cleared = format!(
        "{}=; Path=/; Max-Age=0; HttpOnly",
        state.config.jwt_cookie_name
    );

    let mut response = match state.gateway.proxy_host_request(&user, "/api/stop", req).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    };
    if let Ok(value) = HeaderValue::from_str(&cleared) {
        response.headers_mut().append(SET_COOKIE, value);
    }
    response
}

/// Re-issue an upstream cookie under our own name with the gateway's
/// attributes, keeping only the upstream lifetime.
fn rename_cookie(raw: &str, name: &str) -> String {
    let (first, attrs) = match raw.split_once(';') {
        Some((first, attrs)) => (first, Some(attrs)),
        None => (raw, None),
    };
    let value = first.split_once('=').map(|(_, v)| v).unwrap_or("").trim();

    let mut cookie = format!("{name}={value}; Path=/; HttpOnly; SameSite=Strict");
    if let Some(attrs) = attrs {
        for attr in attrs.split(';') {
            let attr = attr.trim();
            let lower = attr.to_ascii_lowercase();
            if lower.starts_with("expires=") || lower.starts_with("max-age=") {
                cookie.push_str("; ");
                cookie.push_str(attr);
            }
        }
    }
    cookie
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rename_cookie_rewrites_name_and_attributes() {
        let cookie = rename_cookie(
            "lfs_session=abc123; Path=/login; Expires=Wed, 21 Oct 2026 07:28:00 GMT; Secure",
            "JWTAuthentication",
        );
        assert_eq!(
            cookie,
            "JWTAuthentication=abc123; Path=/; HttpOnly; SameSite=Strict; \
             Expires=Wed, 21 Oct 2026 07:28:00 GMT"
        );
    }

    #[test]
    fn rename_cookie_without_attributes() {
        let cookie = rename_cookie("token=xyz", "JWTAuthentication");
        assert_eq!(cookie, "JWTAuthentication=xyz; Path=/; HttpOnly; SameSite=Strict");
    }

    #[test]
    fn rename_cookie_keeps_max_age() {
        let cookie = rename_cookie("t=v; Max-Age=3600", "C");
        assert!(cookie.ends_with("Max-Age=3600"));
    }
}
