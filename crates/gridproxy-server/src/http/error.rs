use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use gridproxy_types::ParseError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::bus::BusError;
use crate::error::StoreError;

/// Everything a handler can fail with, rendered as `{"error": "..."}`.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadGateway(String),

    #[error("{0}")]
    Internal(String),
}

impl HttpError {
    pub fn status(&self) -> StatusCode {
        match self {
            HttpError::BadRequest(_) => StatusCode::BAD_REQUEST,
            HttpError::NotFound(_) => StatusCode::NOT_FOUND,
            HttpError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            HttpError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<StoreError> for HttpError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NodeNotFound | StoreError::FarmNotFound => {
                HttpError::NotFound(err.to_string())
            }
            StoreError::InvalidFilter(e) => HttpError::BadRequest(e.to_string()),
            other => HttpError::Internal(other.to_string()),
        }
    }
}

impl From<ParseError> for HttpError {
    fn from(err: ParseError) -> Self {
        HttpError::BadRequest(err.to_string())
    }
}

impl From<BusError> for HttpError {
    fn from(err: BusError) -> Self {
        HttpError::BadGateway(err.to_string())
    }
}
