//! Error codes and the API error payload
//!
//! Policy and validation failures are returned to the caller with a machine
//! readable code. Anything unanticipated becomes a generic 500 whose detail
//! stays in the logs.

use crate::origins::RegistryError;
use crate::storage::StorageError;
use crate::vault::VaultError;
use axum::{
    extract::rejection::JsonRejection,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::error;

/// Error code catalogue
pub mod codes {
    // Backend server (1xxx)
    pub const SERVER_STARTUP_FAILED: &str = "ERR-1001";
    pub const DATABASE_CONNECTION_FAILED: &str = "ERR-1002";

    // API endpoint (2xxx)
    pub const INVALID_REQUEST: &str = "ERR-2001";
    pub const MISSING_PARAMETERS: &str = "ERR-2002";
    pub const BACKEND_NOT_AVAILABLE: &str = "ERR-2003";
    pub const ORIGIN_NOT_ALLOWED: &str = "ERR-2004";
    pub const INVALID_ORIGIN: &str = "ERR-2005";
    pub const RATE_LIMITED: &str = "ERR-2006";

    // Browser automation (3xxx)
    pub const BROWSER_LAUNCH_FAILED: &str = "ERR-3001";
    pub const PAGE_LOAD_TIMEOUT: &str = "ERR-3002";
    pub const ELEMENT_NOT_FOUND: &str = "ERR-3003";
    pub const AUTOMATION_TIMEOUT: &str = "ERR-3004";
    pub const SCREENSHOT_FAILED: &str = "ERR-3005";

    // Authentication (4xxx)
    pub const INVALID_CREDENTIALS: &str = "ERR-4001";
    pub const LOGIN_FAILED: &str = "ERR-4002";
    pub const MFA_REQUIRED: &str = "ERR-4003";
    pub const SESSION_EXPIRED: &str = "ERR-4004";
    pub const OAUTH_TOKEN_NOT_FOUND: &str = "ERR-4005";

    // Network (5xxx)
    pub const NETWORK_ERROR: &str = "ERR-5001";
    pub const CONNECTION_TIMEOUT: &str = "ERR-5002";
    pub const INVALID_URL: &str = "ERR-5003";

    // Validation (6xxx)
    pub const VALIDATION_ERROR: &str = "ERR-6001";
    pub const INVALID_EMAIL: &str = "ERR-6002";
    pub const INVALID_PASSWORD: &str = "ERR-6003";
}

/// Human readable message for an error code
pub fn error_message(code: &str) -> &'static str {
    match code {
        codes::SERVER_STARTUP_FAILED => "Backend server failed to start",
        codes::DATABASE_CONNECTION_FAILED => "Database connection failed",
        codes::INVALID_REQUEST => "Invalid request format",
        codes::MISSING_PARAMETERS => "Missing required parameters",
        codes::BACKEND_NOT_AVAILABLE => "Backend service not available",
        codes::ORIGIN_NOT_ALLOWED => "Origin not allowed",
        codes::INVALID_ORIGIN => "Invalid origin",
        codes::RATE_LIMITED => "Too many requests, please try again later",
        codes::BROWSER_LAUNCH_FAILED => "Failed to launch browser automation",
        codes::PAGE_LOAD_TIMEOUT => "Page load timeout - server may be unreachable",
        codes::ELEMENT_NOT_FOUND => "Required page element not found",
        codes::AUTOMATION_TIMEOUT => "Automation process timeout",
        codes::SCREENSHOT_FAILED => "Failed to capture screenshot",
        codes::INVALID_CREDENTIALS => "Invalid username or password",
        codes::LOGIN_FAILED => "Login failed - check credentials",
        codes::MFA_REQUIRED => "Multi-factor authentication required (not supported)",
        codes::SESSION_EXPIRED => "Session expired",
        codes::OAUTH_TOKEN_NOT_FOUND => "OAuth credentials not found after login",
        codes::NETWORK_ERROR => "Network error occurred",
        codes::CONNECTION_TIMEOUT => "Connection timeout",
        codes::INVALID_URL => "Invalid or malformed URL",
        codes::VALIDATION_ERROR => "Validation error",
        codes::INVALID_EMAIL => "Invalid email format",
        codes::INVALID_PASSWORD => "Invalid password format",
        _ => "Unknown error",
    }
}

/// Error payload returned to callers
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub success: bool,
    pub error_code: String,
    pub error_message: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(code: &str, details: Option<String>) -> Self {
        Self::with_details(code, details.map(serde_json::Value::String))
    }

    pub fn with_details(code: &str, details: Option<serde_json::Value>) -> Self {
        Self {
            success: false,
            error_code: code.to_string(),
            error_message: error_message(code).to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            details,
        }
    }
}

/// A single rejected request field
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &str, message: &str) -> Self {
        Self {
            field: field.to_string(),
            message: message.to_string(),
        }
    }
}

/// Errors surfaced by HTTP handlers and middleware
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Missing parameter: {0}")]
    MissingParameters(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid fields: {}", .0.len())]
    InvalidFields(Vec<FieldError>),

    #[error("Origin already exists: {0}")]
    DuplicateOrigin(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid origin: {0}")]
    InvalidOrigin(String),

    #[error("Origin not allowed: {0}")]
    OriginNotAllowed(String),

    #[error("Rate limit exceeded: retry after {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    #[error("Credential retrieval failed: {message}")]
    RetrievalFailed {
        code: Option<String>,
        message: String,
    },

    #[error("Upstream error ({status}): {message}")]
    Upstream {
        status: StatusCode,
        code: &'static str,
        message: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// HTTP status and error code for this error
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, codes::INVALID_REQUEST),
            ApiError::MissingParameters(_) => (StatusCode::BAD_REQUEST, codes::MISSING_PARAMETERS),
            ApiError::InvalidUrl(_) => (StatusCode::BAD_REQUEST, codes::INVALID_URL),
            ApiError::Validation(_) | ApiError::InvalidFields(_) => {
                (StatusCode::BAD_REQUEST, codes::VALIDATION_ERROR)
            }
            ApiError::DuplicateOrigin(_) => (StatusCode::CONFLICT, codes::VALIDATION_ERROR),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, codes::VALIDATION_ERROR),
            ApiError::InvalidOrigin(_) => (StatusCode::FORBIDDEN, codes::INVALID_ORIGIN),
            ApiError::OriginNotAllowed(_) => (StatusCode::FORBIDDEN, codes::ORIGIN_NOT_ALLOWED),
            ApiError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, codes::RATE_LIMITED),
            ApiError::RetrievalFailed { .. } => (StatusCode::BAD_REQUEST, codes::LOGIN_FAILED),
            ApiError::Upstream { status, code, .. } => (*status, *code),
            ApiError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, codes::BACKEND_NOT_AVAILABLE)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, default_code) = self.status_and_code();

        let (code, details) = match &self {
            ApiError::InvalidRequest(d)
            | ApiError::MissingParameters(d)
            | ApiError::InvalidUrl(d)
            | ApiError::Validation(d) => (default_code, Some(d.clone())),
            ApiError::InvalidFields(fields) => {
                let details = serde_json::to_value(fields).ok();
                let body = ErrorResponse::with_details(default_code, details);
                return (status, Json(body)).into_response();
            }
            ApiError::Upstream { message, .. } => (default_code, Some(message.clone())),
            ApiError::DuplicateOrigin(_) => (default_code, Some("Origin already exists".into())),
            ApiError::NotFound(what) => (default_code, Some(format!("{} not found", what))),
            ApiError::InvalidOrigin(_) => (default_code, None),
            ApiError::OriginNotAllowed(_) => (default_code, None),
            ApiError::RateLimited { retry_after } => (
                default_code,
                Some(format!("Try again in {} seconds", retry_after_secs(*retry_after))),
            ),
            ApiError::RetrievalFailed { code, message } => {
                let code = code
                    .as_deref()
                    .filter(|c| error_message(c) != "Unknown error")
                    .unwrap_or(default_code);
                (code, Some(message.clone()))
            }
            ApiError::Internal(detail) => {
                error!(error = %detail, "Unhandled API error");
                (default_code, None)
            }
        };

        let mut response = (status, Json(ErrorResponse::new(code, details))).into_response();

        if let ApiError::RateLimited { retry_after } = &self {
            let secs = retry_after_secs(*retry_after);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

/// Whole seconds to advertise in `Retry-After`, never zero
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::DuplicateOrigin(origin) => ApiError::DuplicateOrigin(origin),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::InvalidRequest(rejection.body_text())
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<VaultError> for ApiError {
    fn from(err: VaultError) -> Self {
        ApiError::Internal(err.to_string())
    }
}
