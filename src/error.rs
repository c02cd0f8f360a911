use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("storage operation failed: {0}")]
    StorageFailure(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::StorageFailure(_) => "storage_failure",
        }
    }
}

impl IntoResponse for StoreError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.code(),
            message: self.to_string(),
        });
        (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::StorageFailure(err.to_string())
    }
}
