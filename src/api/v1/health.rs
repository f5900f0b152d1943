use crate::store::Store;
use axum::{
    response::{IntoResponse, Response},
    Extension, Json,
};
use http::StatusCode;
use serde_json::json;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::warn;

pub(crate) async fn health(Extension(store): Extension<Arc<dyn Store>>) -> Response {
    let started = Instant::now();
    match store.ping().await {
        Ok(()) => {
            let latency_ms = started.elapsed().as_millis() as u64;
            (
                StatusCode::OK,
                Json(json!({ "ok": true, "store_latency_ms": latency_ms })),
            )
                .into_response()
        }
        Err(error) => {
            warn!(%error, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "ok": false, "error": error.to_string() })),
            )
                .into_response()
        }
    }
}
