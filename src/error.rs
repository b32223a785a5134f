use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use thiserror::Error;

/// Request-terminal errors. Each maps to one HTTP status and is returned to
/// the caller as `{"error": "..."}`; nothing here is retried.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("only the booking's customer, its assigned worker, or an admin may do this")]
    Unauthorized,

    #[error("{0}")]
    InvalidState(String),

    #[error("{0}")]
    InvalidDate(String),

    #[error("booking schedule is unusable: {0}")]
    InvalidBooking(String),

    #[error("{0}")]
    Validation(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unauthorized => StatusCode::FORBIDDEN,
            ApiError::InvalidState(_) => StatusCode::CONFLICT,
            ApiError::InvalidDate(_)
            | ApiError::InvalidBooking(_)
            | ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Database(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if self.status_code().is_server_error() {
            log::error!("Request failed: {self}");
        }
        HttpResponse::build(self.status_code())
            .json(serde_json::json!({ "error": self.to_string() }))
    }
}
