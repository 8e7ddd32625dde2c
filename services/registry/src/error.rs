//! Error types for the registry

use axum::extract::multipart::MultipartError;
use axum::extract::rejection::{
    BytesRejection, JsonRejection, PathRejection, QueryRejection,
};
use axum::extract::multipart::MultipartRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::archive::ArchiveError;

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No image is registered under this name
    #[error("image \"{0}\" not found")]
    NotFound(String),

    /// An image with this name is already registered
    #[error("image \"{0}\" already exists")]
    AlreadyExists(String),

    /// The image exists but has no data attached
    #[error("image \"{0}\" has no data")]
    NoData(String),

    /// The uploaded artifact or its manifest could not be understood
    #[error("bad image format: {0}")]
    Malformed(String),

    /// An image name failed validation
    #[error("invalid image name: {0:?}")]
    InvalidName(String),

    /// A request body could not be decoded
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The request body exceeds the upload limit
    #[error("upload too large: {0}")]
    TooLarge(String),

    /// The lineage of `image` refers to a parent that is not registered
    #[error("lineage of \"{image}\" is broken: parent \"{parent}\" not found")]
    ParentNotFound {
        /// The image whose ancestry was requested
        image: String,
        /// The missing parent
        parent: String,
    },

    /// The lineage of `image` revisits `parent`
    #[error("lineage of \"{image}\" is cyclic at \"{parent}\"")]
    LineageCycle {
        /// The image whose ancestry was requested
        image: String,
        /// The first name visited twice
        parent: String,
    },

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    /// The metadata snapshot could not be encoded
    #[error("metadata encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RegistryError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::NotFound(_) | RegistryError::NoData(_) => StatusCode::NOT_FOUND,
            RegistryError::AlreadyExists(_) => StatusCode::CONFLICT,
            RegistryError::Malformed(_)
            | RegistryError::InvalidName(_)
            | RegistryError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RegistryError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            RegistryError::ParentNotFound { .. }
            | RegistryError::LineageCycle { .. }
            | RegistryError::Storage(_)
            | RegistryError::Encoding(_)
            | RegistryError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistryError::NotFound(_) => "NAME_UNKNOWN",
            RegistryError::AlreadyExists(_) => "NAME_CONFLICT",
            RegistryError::NoData(_) => "BLOB_UNKNOWN",
            RegistryError::Malformed(_) | RegistryError::InvalidRequest(_) => "IMAGE_INVALID",
            RegistryError::InvalidName(_) => "NAME_INVALID",
            RegistryError::TooLarge(_) => "SIZE_INVALID",
            RegistryError::ParentNotFound { .. } | RegistryError::LineageCycle { .. } => {
                "LINEAGE_BROKEN"
            }
            RegistryError::Storage(_) | RegistryError::Encoding(_) | RegistryError::Io(_) => {
                "UNKNOWN"
            }
        }
    }
}

impl From<ArchiveError> for RegistryError {
    fn from(error: ArchiveError) -> Self {
        if error.is_malformed() {
            RegistryError::Malformed(error.to_string())
        } else {
            RegistryError::Io(std::io::Error::other(error))
        }
    }
}

impl RegistryError {
    /// Classify a request the extractors refused to decode.
    fn rejected(status: StatusCode, message: String) -> Self {
        if status == StatusCode::PAYLOAD_TOO_LARGE {
            RegistryError::TooLarge(message)
        } else {
            RegistryError::InvalidRequest(message)
        }
    }
}

macro_rules! from_rejection {
    ($($rejection:ty),+ $(,)?) => {
        $(
            impl From<$rejection> for RegistryError {
                fn from(rejection: $rejection) -> Self {
                    Self::rejected(rejection.status(), rejection.body_text())
                }
            }
        )+
    };
}

from_rejection!(
    BytesRejection,
    JsonRejection,
    MultipartError,
    MultipartRejection,
    PathRejection,
    QueryRejection,
);

/// Error response format
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let code = self.error_code();
        let message = self.to_string();

        let body = ErrorResponse {
            errors: vec![ErrorDetail { code, message }],
        };

        (status, axum::Json(body)).into_response()
    }
}
