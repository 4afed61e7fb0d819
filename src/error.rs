//! 统一的 API 错误类型与转换。

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::fmt;
use std::io::ErrorKind;

use crate::storage::StorageError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
    RangeNotSatisfiable(u64),
    Forbidden(String),
    MethodNotAllowed,
    PayloadTooLarge(u64),
    PreconditionFailed(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::RangeNotSatisfiable(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::BadRequest(msg)
            | ApiError::NotFound(msg)
            | ApiError::Internal(msg)
            | ApiError::Forbidden(msg)
            | ApiError::PreconditionFailed(msg) => f.write_str(msg),
            ApiError::RangeNotSatisfiable(_) => f.write_str("range not satisfiable"),
            ApiError::MethodNotAllowed => f.write_str("method not allowed"),
            ApiError::PayloadTooLarge(limit) => {
                write!(f, "payload exceeds the {limit} byte limit")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            ApiError::RangeNotSatisfiable(size) => {
                let mut headers = HeaderMap::new();
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
                (status, headers, "range not satisfiable").into_response()
            }
            ApiError::MethodNotAllowed => {
                let mut headers = HeaderMap::new();
                headers.insert(
                    header::ALLOW,
                    HeaderValue::from_static("GET, HEAD, POST, PUT, MKCOL, DELETE"),
                );
                (status, headers, "method not allowed").into_response()
            }
            other => (status, other.to_string()).into_response(),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::BoundaryViolation => ApiError::Forbidden("path escapes the volume".into()),
            StorageError::RootProtected => {
                ApiError::Forbidden("the volume root cannot be deleted".into())
            }
            StorageError::NotADirectory => ApiError::BadRequest("path is not a directory".into()),
            StorageError::InvalidArchive(msg) => {
                ApiError::BadRequest(format!("invalid archive: {msg}"))
            }
            StorageError::Io(err) => match err.kind() {
                ErrorKind::NotFound => ApiError::NotFound(err.to_string()),
                _ => ApiError::Internal(err.to_string()),
            },
        }
    }
}
