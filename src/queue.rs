use crate::{
    entries::{EntryState, QueueEntry, QueueId, PRIORITY_MAX, PRIORITY_MIN},
    events::EventConfig,
    metrics::Metrics,
    store::{JoinOutcome, JoinRequest, Store, StoreError},
    util,
};
use clap::Parser;
use serde::Serialize;
use std::{future::Future, sync::Arc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq, Parser)]
#[group(skip)]
pub struct Options {
    /// How many front entries a position read examines for stale heartbeats.
    #[clap(long, env = "EVICT_SCAN_LIMIT", default_value = "64")]
    pub evict_scan_limit: u64,

    /// Attempts for a join against transient store faults.
    #[clap(long, env = "JOIN_RETRIES", default_value = "3")]
    pub join_retries: u32,

    /// Heartbeats younger than this are accepted but not persisted.
    #[clap(long, env = "HEARTBEAT_WRITE_GUARD_MS", default_value = "1000")]
    pub heartbeat_write_guard_ms: u64,

    /// Entries expired per store call while draining an event.
    #[clap(long, env = "DRAIN_BATCH", default_value = "256")]
    pub drain_batch: u64,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("unknown queue or event id")]
    NotFound,
    #[error("device does not match this entry")]
    DeviceMismatch,
    #[error("device already holds a valid admission")]
    AlreadyAdmitted,
    #[error("event is not accepting joins")]
    EventDisabled,
    #[error("entry is immutable after join")]
    Conflict,
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Serialize)]
pub struct JoinOutput {
    pub queue_id: QueueId,
    pub state: EntryState,
    pub position: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_wait_s: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatOutput {
    pub state: EntryState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct StatusOutput {
    pub state: EntryState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_wait_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Owns the per-event queue entities: join, heartbeat, status and leave,
/// plus opportunistic eviction of stale waiters so observed positions only
/// count live peers.
pub struct QueueManager {
    store: Arc<dyn Store>,
    metrics: Arc<Metrics>,
    options: Options,
}

impl QueueManager {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, metrics: Arc<Metrics>, options: Options) -> Self {
        Self {
            store,
            metrics,
            options,
        }
    }

    pub async fn join(
        &self,
        event_id: &str,
        device_id: &str,
        user_id: Option<String>,
        priority: i32,
        cancel: &CancellationToken,
    ) -> Result<JoinOutput, QueueError> {
        if device_id.is_empty() {
            return Err(QueueError::Malformed("device_id must not be empty".into()));
        }
        if !(PRIORITY_MIN..=PRIORITY_MAX).contains(&priority) {
            return Err(QueueError::Malformed(format!(
                "priority must be in {PRIORITY_MIN}..={PRIORITY_MAX}"
            )));
        }

        self.with_retry(cancel, move || {
            self.try_join(event_id, device_id, user_id.clone(), priority, cancel)
        })
        .await
    }

    async fn try_join(
        &self,
        event_id: &str,
        device_id: &str,
        user_id: Option<String>,
        priority: i32,
        cancel: &CancellationToken,
    ) -> Result<JoinOutput, QueueError> {
        let event = guarded(cancel, self.store.event(event_id))
            .await?
            .ok_or(QueueError::NotFound)?;
        if !event.enabled {
            return Err(QueueError::EventDisabled);
        }

        let request = JoinRequest {
            queue_id: QueueId::new(),
            event_id: event_id.to_owned(),
            device_id: device_id.to_owned(),
            user_id,
            priority,
            entry_ttl_ms: event.entry_ttl_ms(),
        };

        match guarded(cancel, self.store.join(&request)).await? {
            JoinOutcome::Joined { queue_id, rank } => {
                self.metrics
                    .queue_joins_total
                    .with_label_values(&[event_id, &priority.to_string()])
                    .inc();
                debug!(%queue_id, event_id, device_id, rank, "Joined queue");
                Ok(Self::join_output(queue_id, rank, &event))
            }
            JoinOutcome::Existing { queue_id, rank } => {
                Ok(Self::join_output(queue_id, rank, &event))
            }
            JoinOutcome::AlreadyAdmitted => Err(QueueError::AlreadyAdmitted),
            JoinOutcome::PriorityConflict => Err(QueueError::Conflict),
        }
    }

    pub async fn heartbeat(
        &self,
        queue_id: &QueueId,
        device_id: &str,
        cancel: &CancellationToken,
    ) -> Result<HeartbeatOutput, QueueError> {
        self.with_retry(cancel, move || {
            self.try_heartbeat(queue_id, device_id, cancel)
        })
        .await
    }

    async fn try_heartbeat(
        &self,
        queue_id: &QueueId,
        device_id: &str,
        cancel: &CancellationToken,
    ) -> Result<HeartbeatOutput, QueueError> {
        let entry = guarded(cancel, self.store.entry(queue_id))
            .await?
            .ok_or(QueueError::NotFound)?;
        if entry.device_id != device_id {
            return Err(QueueError::DeviceMismatch);
        }

        let output = if entry.state == EntryState::Waiting {
            guarded(
                cancel,
                self.store
                    .touch(queue_id, self.options.heartbeat_write_guard_ms),
            )
            .await?;
            let (position, _) = self.waiting_position(&entry, cancel).await?;
            let state = if position.is_some() {
                EntryState::Waiting
            } else {
                EntryState::Expired
            };
            HeartbeatOutput { state, position }
        } else {
            // Permitted on admitted entries, but extends nothing: the token's
            // own expiry governs.
            HeartbeatOutput {
                state: entry.state,
                position: None,
            }
        };
        self.metrics
            .queue_heartbeats_total
            .with_label_values(&[&entry.event_id])
            .inc();
        Ok(output)
    }

    pub async fn status(
        &self,
        queue_id: &QueueId,
        cancel: &CancellationToken,
    ) -> Result<StatusOutput, QueueError> {
        let entry = guarded(cancel, self.store.entry(queue_id))
            .await?
            .ok_or(QueueError::NotFound)?;

        match entry.state {
            EntryState::Waiting => {
                let (position, estimated_wait_s) = self.waiting_position(&entry, cancel).await?;
                let state = if position.is_some() {
                    EntryState::Waiting
                } else {
                    EntryState::Expired
                };
                Ok(StatusOutput {
                    state,
                    position,
                    estimated_wait_s,
                    token: None,
                })
            }
            EntryState::Admitted => {
                let now = self.store.now_ms();
                if entry.expires_at_ms.is_some_and(|expires| now >= expires) {
                    return Ok(StatusOutput {
                        state: EntryState::Expired,
                        position: None,
                        estimated_wait_s: None,
                        token: None,
                    });
                }
                Ok(StatusOutput {
                    state: EntryState::Admitted,
                    position: None,
                    estimated_wait_s: None,
                    token: entry.token,
                })
            }
            state => Ok(StatusOutput {
                state,
                position: None,
                estimated_wait_s: None,
                token: None,
            }),
        }
    }

    /// Best-effort removal: the entry transitions to `revoked` and leaves the
    /// queue index. Admitted entries also enter the revocation set.
    pub async fn leave(
        &self,
        queue_id: &QueueId,
        device_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError> {
        let entry = guarded(cancel, self.store.entry(queue_id))
            .await?
            .ok_or(QueueError::NotFound)?;
        if entry.device_id != device_id {
            return Err(QueueError::DeviceMismatch);
        }
        guarded(cancel, self.store.retire(queue_id)).await?;
        Ok(())
    }

    /// Admin revocation, not bound to a device.
    pub async fn revoke(
        &self,
        queue_id: &QueueId,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError> {
        guarded(cancel, self.store.retire(queue_id))
            .await?
            .ok_or(QueueError::NotFound)?;
        Ok(())
    }

    /// Admin drain: stop accepting joins and expire every waiting entry.
    pub async fn drain(
        &self,
        event_id: &str,
        cancel: &CancellationToken,
    ) -> Result<u64, QueueError> {
        let mut event = guarded(cancel, self.store.event(event_id))
            .await?
            .ok_or(QueueError::NotFound)?;
        if event.enabled {
            event.enabled = false;
            guarded(cancel, self.store.put_event(&event)).await?;
        }
        let mut drained = 0;
        loop {
            let batch = guarded(
                cancel,
                self.store.drain_waiting(event_id, self.options.drain_batch),
            )
            .await?;
            drained += batch;
            if batch < self.options.drain_batch {
                return Ok(drained);
            }
        }
    }

    /// Admin listing of the queue front.
    pub async fn list_waiting(
        &self,
        event_id: &str,
        limit: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        guarded(cancel, self.store.peek_waiting(event_id, limit))
            .await
            .map_err(Into::into)
    }

    fn join_output(queue_id: QueueId, rank: u64, event: &EventConfig) -> JoinOutput {
        let position = rank + 1;
        JoinOutput {
            queue_id,
            state: EntryState::Waiting,
            position,
            estimated_wait_s: estimate_wait(position, event.release_rate),
        }
    }

    /// 1-based live position of a waiting entry. Entries at the front whose
    /// heartbeat lapsed are evicted first, so the position reflects live
    /// peers only. Returns `None` when this entry itself was evicted.
    async fn waiting_position(
        &self,
        entry: &QueueEntry,
        cancel: &CancellationToken,
    ) -> Result<(Option<u64>, Option<f64>), QueueError> {
        let event = guarded(cancel, self.store.event(&entry.event_id)).await?;
        if let Some(event) = &event {
            guarded(
                cancel,
                self.store.evict_stale(
                    &entry.event_id,
                    event.heartbeat_timeout_ms,
                    self.options.evict_scan_limit,
                ),
            )
            .await?;
        }
        let position = guarded(cancel, self.store.rank(&entry.event_id, &entry.queue_id))
            .await?
            .map(|rank| rank + 1);
        let estimated_wait_s = match (position, &event) {
            (Some(position), Some(event)) => estimate_wait(position, event.release_rate),
            _ => None,
        };
        Ok((position, estimated_wait_s))
    }

    async fn with_retry<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, QueueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Err(QueueError::Store(error))
                    if error.retryable() && attempt < self.options.join_retries =>
                {
                    debug!(attempt, %error, "Retrying after transient store fault");
                    let backoff = util::retry_backoff(attempt);
                    tokio::select! {
                        () = cancel.cancelled() => return Err(QueueError::Cancelled),
                        () = tokio::time::sleep(backoff) => {}
                    }
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

fn estimate_wait(position: u64, release_rate: f64) -> Option<f64> {
    (release_rate > 0.0).then(|| position as f64 / release_rate)
}

pub(crate) async fn guarded<T>(
    cancel: &CancellationToken,
    operation: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, QueueError> {
    tokio::select! {
        () = cancel.cancelled() => Err(QueueError::Cancelled),
        result = operation => result.map_err(QueueError::from),
    }
}
