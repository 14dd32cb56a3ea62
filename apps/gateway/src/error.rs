use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Structured API error returned to clients.
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
}

/// Application-level error type that converts into an HTTP response.
///
/// When a session is torn down because of one of these, `message` is also
/// the reason text of the 1008 close frame sent to the client.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "FORBIDDEN", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    /// A session for this identifier already exists (409).
    pub fn user_already_exists() -> Self {
        Self::new(
            StatusCode::CONFLICT,
            "USER_ALREADY_EXISTS",
            "USER_ALREADY_EXISTS",
        )
    }

    /// The `Db` request header disagrees with the session's database (409).
    pub fn database_mismatch() -> Self {
        Self::new(
            StatusCode::CONFLICT,
            "DATABASE_MISMATCH",
            "Database mismatch between VNC db and requested db",
        )
    }

    /// The user has no session to dispatch the request to (421).
    pub fn not_connected() -> Self {
        Self::new(
            StatusCode::MISDIRECTED_REQUEST,
            "NOT_CONNECTED",
            "User is not connected to an LFS.X instance",
        )
    }

    /// A dependent connection (VNC session, control peer) is missing (424).
    pub fn no_vnc_connection() -> Self {
        Self::new(
            StatusCode::FAILED_DEPENDENCY,
            "NO_VNC_CONNECTION",
            "No VNC connection established for your user",
        )
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: ApiErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}
