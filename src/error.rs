use actix_web::{http::StatusCode, HttpResponse};
use serde_json::json;

pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type. Background pipelines log and keep going; API
/// handlers bubble these up and let `ResponseError` shape the reply.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Undecodable packet or DNS record. Dropped at the extractor.
    #[error("malformed input: {0}")]
    InputMalformed(String),

    /// Connection/IO error against the store; background writers retry on
    /// the next flush, API callers get a 500.
    #[error("store error: {0}")]
    StoreTransient(String),

    /// Unique-constraint violation.
    #[error("conflict: {0}")]
    StoreConflict(String),

    /// Feed download failed; recorded in feed metadata.
    #[error("feed unavailable: {0}")]
    FeedUnavailable(String),

    /// Update requested inside the 3 h throttle window.
    #[error("feed throttled, {hours_remaining:.1}h remaining")]
    FeedThrottled { hours_remaining: f64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not authenticated")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(String),

    /// Out-of-range or inconsistent request parameters.
    #[error("{0}")]
    Invalid(String),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::Invalid(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(ref err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Error::StoreConflict(e.to_string())
            }
            _ => Error::StoreTransient(e.to_string()),
        }
    }
}

impl From<r2d2::Error> for Error {
    fn from(e: r2d2::Error) -> Self {
        Error::StoreTransient(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(e.to_string())
    }
}

impl actix_web::error::ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::Invalid(_) | Error::InputMalformed(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::StoreConflict(_) => StatusCode::CONFLICT,
            Error::FeedThrottled { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::FeedUnavailable(_)
            | Error::StoreTransient(_)
            | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let body = match self {
            Error::FeedThrottled { hours_remaining } => json!({
                "detail": self.to_string(),
                "throttled": true,
                "hours_remaining": hours_remaining,
            }),
            _ => json!({ "detail": self.to_string() }),
        };
        HttpResponse::build(self.status_code()).json(body)
    }
}
