pub mod admin;
pub mod health;
pub mod queue;
pub mod token;

use crate::{queue::QueueError, store::StoreError};
use axum::{
    response::{IntoResponse, Response},
    Json,
};
use http::StatusCode;
use serde_json::json;

impl IntoResponse for QueueError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Self::NotFound => (StatusCode::NOT_FOUND, "not-found"),
            Self::DeviceMismatch => (StatusCode::FORBIDDEN, "device-mismatch"),
            Self::EventDisabled => (StatusCode::FORBIDDEN, "event-disabled"),
            Self::AlreadyAdmitted => (StatusCode::CONFLICT, "already-admitted"),
            Self::Conflict => (StatusCode::CONFLICT, "conflict"),
            Self::Malformed(_) => (StatusCode::BAD_REQUEST, "malformed"),
            Self::Cancelled => (StatusCode::REQUEST_TIMEOUT, "cancelled"),
            Self::Store(StoreError::Timeout) => (StatusCode::SERVICE_UNAVAILABLE, "store-timeout"),
            Self::Store(StoreError::Transient(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "store-transient")
            }
            Self::Store(StoreError::LeaseLost) => (StatusCode::SERVICE_UNAVAILABLE, "lease-lost"),
            Self::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "store-internal"),
        };
        let body = Json(json!({
            "code": code,
            "error": self.to_string(),
        }));
        (status, body).into_response()
    }
}
