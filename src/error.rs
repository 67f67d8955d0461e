use std::io;
use std::path::PathBuf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::key::ContentKey;

/// Failures of the content store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("content not found: {0}")]
    NotFound(String),

    #[error("invalid content key '{0}'")]
    InvalidKey(String),

    #[error("chunk hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        expected: ContentKey,
        actual: ContentKey,
    },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("chunk source has been disposed")]
    Disposed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("destination already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Protocol(_) => StatusCode::BAD_REQUEST,
            Error::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Error::Storage(StorageError::NotFound(_)) => StatusCode::NOT_FOUND,
            Error::Storage(StorageError::InvalidKey(_)) => StatusCode::BAD_REQUEST,
            Error::AlreadyExists(_) => StatusCode::CONFLICT,
            Error::Http(_) => StatusCode::BAD_GATEWAY,
            Error::Storage(_)
            | Error::Disposed
            | Error::Io(_)
            | Error::Cancelled
            | Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::METHOD_NOT_ALLOWED {
            return status.into_response();
        }
        (status, self.to_string()).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            Error::MethodNotAllowed.status_code(),
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(
            Error::Storage(StorageError::NotFound("abc".into())).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::AlreadyExists(PathBuf::from("/tmp/x")).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::Disposed.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_display() {
        let err = Error::protocol("GET returned status 404 Not Found");
        assert_eq!(
            err.to_string(),
            "protocol error: GET returned status 404 Not Found"
        );
        let err = Error::AlreadyExists(PathBuf::from("/tmp/out.bin"));
        assert_eq!(err.to_string(), "destination already exists: /tmp/out.bin");
    }
}
