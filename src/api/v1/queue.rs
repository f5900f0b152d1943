use crate::{
    entries::QueueId,
    queue::{HeartbeatOutput, JoinOutput, QueueError, QueueManager, StatusOutput},
};
use axum::{Extension, Json};
use http::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize)]
pub struct JoinPayload {
    pub event_id: String,
    pub device_id: String,
    pub user_id: Option<String>,
    pub priority: Option<i32>,
}

pub(crate) async fn join(
    Extension(manager): Extension<Arc<QueueManager>>,
    Extension(shutdown): Extension<CancellationToken>,
    Json(payload): Json<JoinPayload>,
) -> Result<Json<JoinOutput>, QueueError> {
    let output = manager
        .join(
            &payload.event_id,
            &payload.device_id,
            payload.user_id,
            payload.priority.unwrap_or(0),
            &shutdown,
        )
        .await?;
    Ok(Json(output))
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatPayload {
    pub queue_id: String,
    pub device_id: String,
}

pub(crate) async fn heartbeat(
    Extension(manager): Extension<Arc<QueueManager>>,
    Extension(shutdown): Extension<CancellationToken>,
    Json(payload): Json<HeartbeatPayload>,
) -> Result<Json<HeartbeatOutput>, QueueError> {
    let output = manager
        .heartbeat(&QueueId(payload.queue_id), &payload.device_id, &shutdown)
        .await?;
    Ok(Json(output))
}

#[derive(Debug, Deserialize)]
pub struct StatusParams {
    pub queue_id: String,
}

pub(crate) async fn status(
    Extension(manager): Extension<Arc<QueueManager>>,
    Extension(shutdown): Extension<CancellationToken>,
    axum::extract::Query(params): axum::extract::Query<StatusParams>,
) -> Result<Json<StatusOutput>, QueueError> {
    let output = manager
        .status(&QueueId(params.queue_id), &shutdown)
        .await?;
    Ok(Json(output))
}

pub(crate) async fn leave(
    Extension(manager): Extension<Arc<QueueManager>>,
    Extension(shutdown): Extension<CancellationToken>,
    Json(payload): Json<HeartbeatPayload>,
) -> Result<StatusCode, QueueError> {
    manager
        .leave(&QueueId(payload.queue_id), &payload.device_id, &shutdown)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
