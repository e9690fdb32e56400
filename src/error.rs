//! Caller-facing error taxonomy.
//!
//! Every module error converts into [`ApiError`], which renders as a JSON
//! envelope `{"error": <message>, "code": <kind>}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::fileswap::FileSwapError;
use crate::hostinfo::HostInfoError;
use crate::httpc::HttpError;
use crate::topology::{TopologyError, UnknownKind};
use crate::utils::netutil::AddressError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "badRequest",
            ApiError::NotFound(_) => "notFound",
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        let body = Json(json!({
            "error": self.to_string(),
            "code": self.code(),
        }));
        (status, body).into_response()
    }
}

impl From<AddressError> for ApiError {
    fn from(e: AddressError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<UnknownKind> for ApiError {
    fn from(e: UnknownKind) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<HttpError> for ApiError {
    fn from(e: HttpError) -> Self {
        if e.is_not_found() {
            ApiError::NotFound(e.to_string())
        } else {
            ApiError::Internal(e.to_string())
        }
    }
}

impl From<TopologyError> for ApiError {
    fn from(e: TopologyError) -> Self {
        match e {
            TopologyError::InvalidAddress(_) => ApiError::BadRequest(e.to_string()),
            TopologyError::NotFound(_) => ApiError::NotFound(e.to_string()),
            TopologyError::RequestFailed(ref source)
            | TopologyError::ClientRequestFailed { ref source, .. }
                if source.is_not_found() =>
            {
                ApiError::NotFound(e.to_string())
            }
            _ => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<FileSwapError> for ApiError {
    fn from(e: FileSwapError) -> Self {
        match e {
            FileSwapError::BadRequest(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<HostInfoError> for ApiError {
    fn from(e: HostInfoError) -> Self {
        match e {
            HostInfoError::NotConfigured => ApiError::NotFound(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}
