//! Error types for llm-router.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Result type alias for llm-router operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for llm-router.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("No available targets")]
    NoTargets,

    #[error("Unknown target '{0}'")]
    UnknownTarget(String),

    #[error("Upstream request to '{target}' failed: {source}")]
    Upstream {
        target: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Provider '{provider}' returned {status}: {body}")]
    ProviderStatus {
        provider: String,
        status: u16,
        body: String,
    },

    /// A provider answered with a body that could not be translated. The raw
    /// payload is kept so callers can diagnose it.
    #[error("Malformed response from provider '{provider}': {message}; raw: {raw}")]
    Translation {
        provider: String,
        message: String,
        raw: String,
    },

    #[error("Provider '{provider}' does not support {endpoint}")]
    Unsupported { provider: String, endpoint: String },

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("authentication failed")]
    Auth,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Transport failure talking to `target`.
    ///
    /// The request URL is stripped from `source`: provider URLs can carry an
    /// API key as a query parameter.
    pub fn upstream(target: impl Into<String>, source: reqwest::Error) -> Self {
        Error::Upstream {
            target: target.into(),
            source: source.without_url(),
        }
    }

    /// HTTP status for the client-facing envelope.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Config(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::NoTargets => StatusCode::SERVICE_UNAVAILABLE,
            Error::UnknownTarget(_) => StatusCode::BAD_GATEWAY,
            Error::Upstream { source, .. } if source.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            Error::Upstream { .. } | Error::Translation { .. } => StatusCode::BAD_GATEWAY,
            Error::ProviderStatus { status, .. } => StatusCode::from_u16(*status)
                .ok()
                .filter(|s| s.is_client_error() || s.is_server_error())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            Error::Unsupported { .. } => StatusCode::NOT_IMPLEMENTED,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Auth => StatusCode::UNAUTHORIZED,
        }
    }

    /// Machine-readable error type for the envelope.
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::NoTargets => "service_unavailable",
            Error::BadRequest(_) => "invalid_request_error",
            Error::Auth => "authentication_error",
            Error::Unsupported { .. } => "unsupported_endpoint",
            Error::Upstream { .. }
            | Error::ProviderStatus { .. }
            | Error::Translation { .. }
            | Error::UnknownTarget(_) => "upstream_error",
            Error::Config(_) | Error::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // OpenAI-compatible error format
        let body = serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "code": status.as_u16()
            }
        });

        (status, axum::Json(body)).into_response()
    }
}
