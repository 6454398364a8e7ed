use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use plugmyai_store::StoreError;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Errors returned by HTTP handlers, rendered as
/// `{"error": {"message": ..., "type": ...}}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("no available provider for model: {0}")]
    NoProviderAvailable(String),
    #[error("{0}")]
    Upstream(String),
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
    #[error("{0}")]
    Internal(String),
}

/// Body of the `error` member.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) | ApiError::NoProviderAvailable(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Upstream(_) | ApiError::Storage(_) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest(_) | ApiError::NoProviderAvailable(_) => {
                "invalid_request_error"
            }
            ApiError::Unauthorized(_) => "authentication_error",
            ApiError::Forbidden(_) => "permission_error",
            ApiError::NotFound(_) => "not_found_error",
            ApiError::Upstream(_) => "upstream_error",
            ApiError::Storage(_) | ApiError::Internal(_) => "server_error",
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            message: self.to_string(),
            kind: self.kind(),
        }
    }
}

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Storage(e) = &self {
            error!(error = %e, "storage failure");
        }
        let status = self.status();
        (status, Json(ErrorEnvelope { error: self.body() })).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::InvalidRequest(format!("invalid request body: {}", rejection.body_text()))
    }
}

/// Failures while bringing the daemon up.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("opening store: {0}")]
    Store(#[from] StoreError),
    #[error("binding listener: {0}")]
    Io(#[from] std::io::Error),
}
