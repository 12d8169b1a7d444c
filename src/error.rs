use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Unified error type for the sitepulse-ingest service.
///
/// `Clone` is deliberate: the token broker hands one refresh outcome to every
/// coalesced waiter, so errors must be shareable as values.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IngestError {
    // ── Credential Errors ───────────────────────────────────────────────
    #[error("No stored credential for {0}")]
    NoCredential(String),

    #[error("Credential expired, re-authorization required: {0}")]
    CredentialExpired(String),

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Credential envelope integrity check failed: {0}")]
    Integrity(String),

    // ── Source Errors ───────────────────────────────────────────────────
    #[error("Source rejected request: {0}")]
    SourceRejected(String),

    // ── Request Errors ──────────────────────────────────────────────────
    #[error("Authentication required")]
    Unauthorized,

    #[error("Insufficient permissions: {0}")]
    Forbidden(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    // ── Internal ────────────────────────────────────────────────────────
    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IngestError {
    /// Whether a caller may retry this error within the same run.
    pub fn is_transient(&self) -> bool {
        matches!(self, IngestError::ProviderUnavailable(_))
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(e: sqlx::Error) -> Self {
        tracing::error!("Database error: {e}");
        IngestError::Database(e.to_string())
    }
}

impl From<anyhow::Error> for IngestError {
    fn from(e: anyhow::Error) -> Self {
        IngestError::Internal(e.to_string())
    }
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            IngestError::NoCredential(_) => (StatusCode::NOT_FOUND, "no_credential"),
            IngestError::CredentialExpired(_) => (StatusCode::UNAUTHORIZED, "credential_expired"),
            IngestError::ProviderUnavailable(_) => {
                (StatusCode::BAD_GATEWAY, "provider_unavailable")
            }
            IngestError::Integrity(_) => (StatusCode::INTERNAL_SERVER_ERROR, "integrity_error"),
            IngestError::SourceRejected(_) => (StatusCode::BAD_GATEWAY, "source_rejected"),
            IngestError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            IngestError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
            IngestError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            IngestError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            IngestError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database_error"),
            IngestError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = json!({
            "error": {
                "code": code,
                "message": self.to_string(),
            }
        });

        (status, axum::Json(body)).into_response()
    }
}
