//! Administrative surface. Authentication happens out-of-band (a fronting
//! proxy); these handlers translate JSON to core operations only.

use crate::{
    entries::{QueueEntry, QueueId},
    events::EventConfig,
    queue::{guarded, QueueError, QueueManager},
    release::ReleaseController,
    store::Store,
};
use axum::{extract::Query, Extension, Json};
use http::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct EventPayload {
    pub event_id: String,
    pub release_rate: f64,
    pub capacity: Option<u64>,
    pub token_ttl_ms: u64,
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

const fn enabled_default() -> bool {
    true
}

pub(crate) async fn upsert_event(
    Extension(store): Extension<Arc<dyn Store>>,
    Extension(shutdown): Extension<CancellationToken>,
    Json(payload): Json<EventPayload>,
) -> Result<Json<EventConfig>, QueueError> {
    let config = EventConfig {
        event_id: payload.event_id,
        release_rate: payload.release_rate,
        capacity: payload.capacity,
        token_ttl_ms: payload.token_ttl_ms,
        heartbeat_timeout_ms: payload.heartbeat_timeout_ms,
        enabled: payload.enabled,
    };
    config
        .validate()
        .map_err(|error| QueueError::Malformed(error.to_string()))?;
    guarded(&shutdown, store.put_event(&config)).await?;
    info!(event_id = %config.event_id, release_rate = config.release_rate, "Event updated");
    Ok(Json(config))
}

pub(crate) async fn list_events(
    Extension(store): Extension<Arc<dyn Store>>,
    Extension(shutdown): Extension<CancellationToken>,
) -> Result<Json<Vec<EventConfig>>, QueueError> {
    let mut events = Vec::new();
    for event_id in guarded(&shutdown, store.event_ids()).await? {
        if let Some(event) = guarded(&shutdown, store.event(&event_id)).await? {
            events.push(event);
        }
    }
    Ok(Json(events))
}

#[derive(Debug, Deserialize)]
pub struct ListQueueParams {
    pub event_id: String,
    pub limit: Option<u64>,
}

pub(crate) async fn list_queue(
    Extension(manager): Extension<Arc<QueueManager>>,
    Extension(shutdown): Extension<CancellationToken>,
    Query(params): Query<ListQueueParams>,
) -> Result<Json<Vec<QueueEntry>>, QueueError> {
    let entries = manager
        .list_waiting(&params.event_id, params.limit.unwrap_or(100), &shutdown)
        .await?;
    Ok(Json(entries))
}

#[derive(Debug, Deserialize)]
pub struct QueueIdPayload {
    pub queue_id: String,
}

pub(crate) async fn force_admit(
    Extension(controller): Extension<Arc<ReleaseController>>,
    Extension(shutdown): Extension<CancellationToken>,
    Json(payload): Json<QueueIdPayload>,
) -> Result<Json<QueueEntry>, QueueError> {
    let entry = controller
        .force_admit(&QueueId(payload.queue_id), &shutdown)
        .await?;
    Ok(Json(entry))
}

pub(crate) async fn revoke(
    Extension(manager): Extension<Arc<QueueManager>>,
    Extension(shutdown): Extension<CancellationToken>,
    Json(payload): Json<QueueIdPayload>,
) -> Result<StatusCode, QueueError> {
    manager
        .revoke(&QueueId(payload.queue_id), &shutdown)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct DrainPayload {
    pub event_id: String,
}

pub(crate) async fn drain(
    Extension(manager): Extension<Arc<QueueManager>>,
    Extension(shutdown): Extension<CancellationToken>,
    Json(payload): Json<DrainPayload>,
) -> Result<Json<Value>, QueueError> {
    let drained = manager.drain(&payload.event_id, &shutdown).await?;
    Ok(Json(json!({ "event_id": payload.event_id, "drained": drained })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        release::Options as ReleaseOptions,
        store::memory::MemoryStore,
        test_util::{queue_options, test_event, test_keys, test_metrics},
        token::TokenSigner,
    };
    use axum::response::IntoResponse;
    use clap::Parser;

    struct Admin {
        store: Arc<MemoryStore>,
        dyn_store: Extension<Arc<dyn Store>>,
        manager: Extension<Arc<QueueManager>>,
        controller: Extension<Arc<ReleaseController>>,
        shutdown: Extension<CancellationToken>,
    }

    fn setup() -> Admin {
        let store = Arc::new(MemoryStore::new());
        let metrics = test_metrics();
        let manager = Arc::new(QueueManager::new(
            store.clone(),
            metrics.clone(),
            queue_options(),
        ));
        let controller = Arc::new(ReleaseController::new(
            store.clone(),
            TokenSigner::new(test_keys()),
            metrics,
            ReleaseOptions::parse_from(["anteroom"]),
        ));
        Admin {
            store: store.clone(),
            dyn_store: Extension(store as Arc<dyn Store>),
            manager: Extension(manager),
            controller: Extension(controller),
            shutdown: Extension(CancellationToken::new()),
        }
    }

    fn payload(event_id: &str) -> EventPayload {
        let event = test_event(event_id);
        EventPayload {
            event_id: event.event_id,
            release_rate: event.release_rate,
            capacity: event.capacity,
            token_ttl_ms: event.token_ttl_ms,
            heartbeat_timeout_ms: event.heartbeat_timeout_ms,
            enabled: event.enabled,
        }
    }

    #[tokio::test]
    async fn upsert_validates_and_persists() {
        let admin = setup();

        let created = upsert_event(
            admin.dyn_store.clone(),
            admin.shutdown.clone(),
            Json(payload("ev1")),
        )
        .await
        .unwrap();
        assert!(created.0.enabled);
        assert!(admin.store.event("ev1").await.unwrap().is_some());

        let mut bad = payload("ev2");
        bad.release_rate = -3.0;
        let rejected = upsert_event(admin.dyn_store.clone(), admin.shutdown.clone(), Json(bad))
            .await
            .unwrap_err();
        assert_eq!(rejected.into_response().status(), StatusCode::BAD_REQUEST);

        let listed = list_events(admin.dyn_store, admin.shutdown).await.unwrap();
        assert_eq!(listed.0.len(), 1);
    }

    #[tokio::test]
    async fn force_admit_revoke_and_drain_flow() {
        let admin = setup();
        upsert_event(
            admin.dyn_store.clone(),
            admin.shutdown.clone(),
            Json(payload("ev1")),
        )
        .await
        .unwrap();

        for device in ["d1", "d2", "d3"] {
            crate::api::v1::queue::join(
                admin.manager.clone(),
                admin.shutdown.clone(),
                Json(crate::api::v1::queue::JoinPayload {
                    event_id: "ev1".into(),
                    device_id: device.into(),
                    user_id: None,
                    priority: None,
                }),
            )
            .await
            .unwrap();
        }

        let waiting = list_queue(
            admin.manager.clone(),
            admin.shutdown.clone(),
            Query(ListQueueParams {
                event_id: "ev1".into(),
                limit: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(waiting.0.len(), 3);

        let target = waiting.0[1].queue_id.to_string();
        let admitted = force_admit(
            admin.controller.clone(),
            admin.shutdown.clone(),
            Json(QueueIdPayload {
                queue_id: target.clone(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(admitted.0.device_id, "d2");

        let revoked = revoke(
            admin.manager.clone(),
            admin.shutdown.clone(),
            Json(QueueIdPayload { queue_id: target }),
        )
        .await
        .unwrap();
        assert_eq!(revoked, StatusCode::NO_CONTENT);

        let drained = drain(
            admin.manager.clone(),
            admin.shutdown.clone(),
            Json(DrainPayload {
                event_id: "ev1".into(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(drained.0["drained"], 2);
        assert_eq!(admin.store.queue_len("ev1").await.unwrap(), 0);
    }
}
