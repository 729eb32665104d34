// Error taxonomy shared by every component. Five kinds, matching the
// propagation rules each component follows: validation errors never start a
// pipeline, attestation failures terminate one, transient faults are
// retried below this layer before they ever surface, permanent faults and
// internal bugs are both fatal but are logged with different urgency.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("attestation failed at stage {stage}: {reason}")]
    Attestation { stage: &'static str, reason: String },

    #[error("dependency unavailable after retries: {0}")]
    Transient(String),

    #[error("permanent dependency fault: {0}")]
    Permanent(String),

    #[error("internal invariant violation: {0}")]
    Internal(String),

    #[error("not found")]
    NotFound,

    #[error("unauthorized")]
    Unauthorized,
}

impl AppError {
    pub fn status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Attestation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Permanent(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Transient vs. permanent classification for a raw `reqwest` failure —
/// used by every HTTP-backed adapter to decide whether to retry.
pub fn classify_reqwest_error(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.status().map(|s| s.is_server_error()).unwrap_or(false)
}
