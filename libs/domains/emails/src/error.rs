use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use sea_orm::{DbErr, RuntimeErr, SqlErr, SqlxError};

use crate::models::EmailStatus;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EmailError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Email not found: {0}")]
    NotFound(Uuid),

    /// The record was not in the status the caller expected.
    #[error("Email {id} is {actual}, expected {expected}")]
    StaleState {
        id: Uuid,
        expected: EmailStatus,
        actual: EmailStatus,
    },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The store refused the operation or returned data that does not decode.
    #[error("Store rejected operation: {0}")]
    StoreRejected(String),

    /// The broker did not acknowledge in time; the event may still have been stored.
    #[error("Publish timed out: {0}")]
    PublishTimeout(String),

    #[error("Operation canceled")]
    Canceled,

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Publish rejected: {0}")]
    PublishRejected(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Permanent failure: {0}")]
    Permanent(String),
}

pub type EmailResult<T> = Result<T, EmailError>;

impl EmailError {
    /// Whether the same call may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EmailError::StoreUnavailable(_)
                | EmailError::PublishTimeout(_)
                | EmailError::Canceled
                | EmailError::Transient(_)
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            EmailError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            EmailError::NotFound(_) => StatusCode::NOT_FOUND,
            EmailError::StaleState { .. } | EmailError::ConstraintViolation(_) => {
                StatusCode::CONFLICT
            }
            EmailError::PublishRejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EmailError::StoreUnavailable(_)
            | EmailError::PublishTimeout(_)
            | EmailError::Canceled
            | EmailError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            EmailError::Permanent(_) => StatusCode::BAD_GATEWAY,
            EmailError::StoreRejected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailError::InvalidInput(_) => "INVALID_INPUT",
            EmailError::NotFound(_) => "NOT_FOUND",
            EmailError::StaleState { .. } => "STALE_STATE",
            EmailError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            EmailError::PublishTimeout(_) => "PUBLISH_TIMEOUT",
            EmailError::Canceled => "CANCELED",
            EmailError::ConstraintViolation(_) => "CONSTRAINT_VIOLATION",
            EmailError::PublishRejected(_) => "PUBLISH_REJECTED",
            EmailError::Transient(_) => "TRANSIENT",
            EmailError::Permanent(_) => "PERMANENT",
            EmailError::StoreRejected(_) => "STORE_REJECTED",
        }
    }

    /// Integer code for logging and monitoring
    pub fn code(&self) -> i32 {
        match self {
            EmailError::InvalidInput(_) => 3001,
            EmailError::NotFound(_) => 3002,
            EmailError::StaleState { .. } => 3003,
            EmailError::StoreUnavailable(_) => 3004,
            EmailError::PublishTimeout(_) => 3005,
            EmailError::Canceled => 3006,
            EmailError::ConstraintViolation(_) => 3007,
            EmailError::PublishRejected(_) => 3008,
            EmailError::Transient(_) => 3009,
            EmailError::Permanent(_) => 3010,
            EmailError::StoreRejected(_) => 3011,
        }
    }
}

/// JSON error body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: i32,
    pub error: String,
    pub message: String,
}

impl IntoResponse for EmailError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!(error_code = self.code(), error = %self, "Request failed");
        } else {
            tracing::debug!(error_code = self.code(), error = %self, "Request rejected");
        }

        let body = Json(ErrorResponse {
            code: self.code(),
            error: self.as_str().to_string(),
            message: self.to_string(),
        });

        (status, body).into_response()
    }
}

impl From<validator::ValidationErrors> for EmailError {
    fn from(err: validator::ValidationErrors) -> Self {
        EmailError::InvalidInput(err.to_string())
    }
}

/// Unique and foreign key violations are conflicts. Only failures of the
/// connection itself are retryable; anything else the database refused, or
/// that failed to decode, fails the same way on every attempt.
impl From<DbErr> for EmailError {
    fn from(err: DbErr) -> Self {
        if let Some(
            SqlErr::UniqueConstraintViolation(msg) | SqlErr::ForeignKeyConstraintViolation(msg),
        ) = err.sql_err()
        {
            return EmailError::ConstraintViolation(msg);
        }

        if matches!(err, DbErr::ConnectionAcquire(_) | DbErr::Conn(_)) {
            return EmailError::StoreUnavailable(err.to_string());
        }

        match driver_error(&err) {
            Some(
                SqlxError::Io(_)
                | SqlxError::Tls(_)
                | SqlxError::Protocol(_)
                | SqlxError::PoolTimedOut
                | SqlxError::PoolClosed
                | SqlxError::WorkerCrashed,
            ) => EmailError::StoreUnavailable(err.to_string()),
            Some(SqlxError::Database(db)) => match db.code().as_deref() {
                Some(code) if is_transient_sqlstate(code) => {
                    EmailError::StoreUnavailable(err.to_string())
                }
                // Class 23: integrity constraint violation (NOT NULL, CHECK, ...)
                Some(code) if code.starts_with("23") => {
                    EmailError::ConstraintViolation(db.message().to_string())
                }
                _ => EmailError::StoreRejected(err.to_string()),
            },
            _ => EmailError::StoreRejected(err.to_string()),
        }
    }
}

fn driver_error(err: &DbErr) -> Option<&SqlxError> {
    match err {
        DbErr::Exec(RuntimeErr::SqlxError(e)) | DbErr::Query(RuntimeErr::SqlxError(e)) => {
            Some(e.as_ref())
        }
        _ => None,
    }
}

/// Connection exceptions, insufficient resources, operator intervention,
/// serialization failures and deadlocks.
fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08")
        || code.starts_with("53")
        || code.starts_with("57")
        || code == "40001"
        || code == "40P01"
}
