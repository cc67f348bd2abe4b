use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Crate-wide classified error. Every subsystem's internal error type
/// converts into one of these at its boundary (spec §7: "errors are
/// classified at the lowest layer and surfaced as typed values carrying
/// a kind tag and human message").
#[derive(Debug, Clone, thiserror::Error)]
pub enum AppError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("recipient refused: {0}")]
    RecipientRejected(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("imap error: {0}")]
    Imap(String),
    #[error("rate limit exceeded")]
    RateLimit { limit: i32 },
    #[error("could not parse response: {0}")]
    Parse(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Auth(_) => "auth_error",
            AppError::RecipientRejected(_) => "recipient_rejected",
            AppError::Connection(_) => "connection_error",
            AppError::Imap(_) => "imap_error",
            AppError::RateLimit { .. } => "rate_limit_exceeded",
            AppError::Parse(_) => "parse_error",
            AppError::NotFound(_) => "not_found",
            AppError::InvalidInput(_) => "invalid_input",
            AppError::Internal(_) => "internal_error",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Auth(_) | AppError::RecipientRejected(_) => StatusCode::BAD_GATEWAY,
            AppError::Connection(_) => StatusCode::BAD_GATEWAY,
            AppError::Imap(_) => StatusCode::BAD_GATEWAY,
            AppError::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Parse(_) => StatusCode::BAD_GATEWAY,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidInput(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<i32>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let limit = match &self {
            AppError::RateLimit { limit } => Some(*limit),
            _ => None,
        };
        let body = ErrorBody {
            error: self.kind().to_string(),
            limit,
        };
        (status, axum::Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<sea_orm::DbErr> for AppError {
    fn from(err: sea_orm::DbErr) -> Self {
        AppError::Internal(err.to_string())
    }
}
