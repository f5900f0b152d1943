use crate::{
    queue::QueueError,
    store::Store,
    token::{TokenVerifier, VerifyError},
};
use axum::{
    response::{IntoResponse, Response},
    Extension, Json,
};
use http::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct VerifyPayload {
    pub token: String,
    pub device_id: String,
}

// Verification outcomes are part of the normal protocol: a failed check is a
// 200 with `ok: false`, only store trouble is an error status.
pub(crate) async fn verify(
    Extension(verifier): Extension<Arc<TokenVerifier>>,
    Extension(store): Extension<Arc<dyn Store>>,
    Json(payload): Json<VerifyPayload>,
) -> Response {
    let now_ms = store.now_ms();
    match verifier
        .verify_presented(store.as_ref(), &payload.token, &payload.device_id, now_ms)
        .await
    {
        Ok(binding) => (
            StatusCode::OK,
            Json(json!({ "ok": true, "binding": binding })),
        )
            .into_response(),
        Err(VerifyError::Store(error)) => QueueError::Store(error).into_response(),
        Err(error) => {
            let reason: &'static str = (&error).into();
            (
                StatusCode::OK,
                Json(json!({ "ok": false, "reason": reason })),
            )
                .into_response()
        }
    }
}
