//! Authentication extractor for all protected routes.

use axum::extract::FromRequestParts;
use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::request::Parts;

use crate::auth::claims;
use crate::error::ApiError;
use crate::models::user::{Database, User};
use crate::AppState;

/// Authenticated user extracted from the `Authorization: Bearer <token>`
/// header or the gateway's authentication cookie.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user: User,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts.headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
        let bearer = header.and_then(|v| v.strip_prefix("Bearer "));
        let cookie = cookie_value(parts, &state.config.jwt_cookie_name);

        let token = match (bearer, cookie) {
            (Some(token), _) => token.to_string(),
            (None, Some(token)) => token,
            (None, None) => {
                return Err(match header {
                    Some(raw) => {
                        tracing::debug!(header = %raw, "received malformed bearer header");
                        ApiError::unauthorized("Malformed token")
                    }
                    None => ApiError::forbidden("No authorization token or cookie given"),
                });
            }
        };

        let claims = claims::validate_token(&token, &state.config.jwt_key).map_err(|e| {
            tracing::debug!(?e, "not authorized");
            ApiError::unauthorized("Unauthorized")
        })?;

        let user = claims.to_user(&state.config.jwt_key).map_err(|e| {
            tracing::error!(%e, "failed to convert claims to user");
            ApiError::unauthorized("Unauthorized")
        })?;

        if state.config.production && user.database != Database::Lfs {
            return Err(ApiError::unauthorized("Invalid db selected in production"));
        }

        Ok(AuthUser { user })
    }
}

/// Read a cookie value from the request headers.
fn cookie_value(parts: &Parts, name: &str) -> Option<String> {
    for header in parts.headers.get_all(COOKIE) {
        let Ok(raw) = header.to_str() else { continue };
        for pair in raw.split(';') {
            let pair = pair.trim();
            if let Some(value) = pair.strip_prefix(name) {
                if let Some(value) = value.strip_prefix('=') {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}
