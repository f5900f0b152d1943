use crate::{
    entries::{EntryState, QueueEntry, QueueId},
    events::EventConfig,
    metrics::Metrics,
    queue::{guarded, QueueError},
    store::{BucketState, Store, StoreError, BUCKET_STATE_TTL_MS},
    token::{SignError, TokenBinding, TokenSigner},
};
use clap::Parser;
use rand::Rng;
use std::{
    collections::{hash_map::Entry, HashMap},
    mem,
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug, PartialEq, Eq, Parser)]
#[group(skip)]
pub struct Options {
    /// Scheduler cadence.
    #[clap(long, env = "TICK_INTERVAL_MS", default_value = "1000")]
    pub tick_interval_ms: u64,

    /// Run the safety sweep on every Nth tick.
    #[clap(long, env = "SWEEP_EVERY_TICKS", default_value = "10")]
    pub sweep_every_ticks: u64,

    /// Upper bound on admissions per event per tick.
    #[clap(long, env = "MAX_ADMIT_BATCH", default_value = "128")]
    pub max_admit_batch: u64,

    /// Hard deadline for draining the in-flight batch on stop.
    #[clap(long, env = "STOP_DEADLINE_MS", default_value = "5000")]
    pub stop_deadline_ms: u64,
}

impl Options {
    fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    /// Lease TTL is twice the tick so a healthy holder always renews first.
    fn lease_ttl_ms(&self) -> u64 {
        self.tick_interval_ms.max(1) * 2
    }
}

/// Front entries examined for lapsed heartbeats on each safety sweep.
const SWEEP_EVICT_LIMIT: u64 = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Stopped,
    Running,
    Stopping,
}

enum ControllerState {
    Stopped,
    Running {
        cancel: CancellationToken,
        handle: JoinHandle<()>,
    },
    Stopping,
}

#[derive(Debug, Error)]
enum TickError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("token minting failed: {0}")]
    Sign(#[from] SignError),
}

impl TickError {
    fn retryable(&self) -> bool {
        matches!(self, Self::Store(error) if error.retryable())
    }
}

/// Per-event token bucket. Derived state; the persisted snapshot only bounds
/// how much burst survives a restart.
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// The scheduler: on each tick, for every enabled event, takes the event
/// lease, computes an admission budget from the token bucket, occupancy and
/// capacity, and admits that many waiters with freshly minted tokens.
pub struct ReleaseController {
    store: Arc<dyn Store>,
    signer: TokenSigner,
    metrics: Arc<Metrics>,
    options: Options,
    state: tokio::sync::Mutex<ControllerState>,
}

impl ReleaseController {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        signer: TokenSigner,
        metrics: Arc<Metrics>,
        options: Options,
    ) -> Self {
        Self {
            store,
            signer,
            metrics,
            options,
            state: tokio::sync::Mutex::new(ControllerState::Stopped),
        }
    }

    pub async fn start(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        if !matches!(*state, ControllerState::Stopped) {
            warn!("Release controller already running");
            return;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(self).run(cancel.clone()));
        *state = ControllerState::Running { cancel, handle };
        info!(
            tick_interval_ms = self.options.tick_interval_ms,
            "Release controller started"
        );
    }

    /// Stop ticking. Waits for the in-flight batch to drain or for the hard
    /// deadline, whichever comes first.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        let ControllerState::Running { cancel, handle } =
            mem::replace(&mut *state, ControllerState::Stopping)
        else {
            *state = ControllerState::Stopped;
            return;
        };
        drop(state);

        cancel.cancel();
        let abort = handle.abort_handle();
        let deadline = Duration::from_millis(self.options.stop_deadline_ms);
        if tokio::time::timeout(deadline, handle).await.is_err() {
            warn!("In-flight batch did not drain before the stop deadline");
            abort.abort();
        }
        *self.state.lock().await = ControllerState::Stopped;
        info!("Release controller stopped");
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        match &*self.state.lock().await {
            ControllerState::Stopped => Lifecycle::Stopped,
            ControllerState::Running { .. } => Lifecycle::Running,
            ControllerState::Stopping => Lifecycle::Stopping,
        }
    }

    /// Admin force-admit: one specific waiting entry, out of queue order.
    pub async fn force_admit(
        &self,
        queue_id: &QueueId,
        cancel: &CancellationToken,
    ) -> Result<QueueEntry, QueueError> {
        let entry = guarded(cancel, self.store.entry(queue_id))
            .await?
            .ok_or(QueueError::NotFound)?;
        match entry.state {
            EntryState::Waiting => {}
            EntryState::Admitted => return Err(QueueError::AlreadyAdmitted),
            EntryState::Expired | EntryState::Revoked => return Err(QueueError::Conflict),
        }
        let event = guarded(cancel, self.store.event(&entry.event_id))
            .await?
            .ok_or(QueueError::NotFound)?;

        let token = self
            .mint_for(&entry, &event)
            .map_err(|error| QueueError::Store(StoreError::Backend(error.to_string())))?;
        let admitted = guarded(
            cancel,
            self.store
                .admit_one(&event.event_id, queue_id, &token, event.token_ttl_ms),
        )
        .await?
        .ok_or(QueueError::Conflict)?;

        self.observe_admission(&admitted);
        info!(%queue_id, event_id = %event.event_id, "Force-admitted entry");
        Ok(admitted)
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let tick_interval = self.options.tick_interval();
        let max_backoff = Duration::from_secs(30);
        let mut delay = tick_interval;
        let mut buckets: HashMap<String, Bucket> = HashMap::new();
        let mut tick = 0_u64;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
            tick += 1;
            match self.tick(&mut buckets, tick, &cancel).await {
                Ok(()) => delay = tick_interval,
                Err(error) if error.retryable() => {
                    delay = (delay * 2).min(max_backoff);
                    warn!(%error, backoff_ms = delay.as_millis() as u64, "Store saturated, backing off");
                }
                Err(error) => {
                    delay = tick_interval;
                    error!(%error, "Tick failed");
                }
            }
        }
        debug!("Release controller loop exited");
    }

    async fn tick(
        &self,
        buckets: &mut HashMap<String, Bucket>,
        tick_no: u64,
        cancel: &CancellationToken,
    ) -> Result<(), TickError> {
        let event_ids = self.store.event_ids().await?;
        let mut saturated = None;

        for event_id in &event_ids {
            // Cancellation aborts before the next batch; a batch already in
            // flight completes, partial rollback would break monotonicity.
            if cancel.is_cancelled() {
                break;
            }
            if let Err(error) = self.process_event(event_id, buckets).await {
                warn!(event_id, %error, "Event admission failed, retrying next tick");
                if error.retryable() && saturated.is_none() {
                    saturated = Some(error);
                }
            }
        }

        if tick_no % self.options.sweep_every_ticks.max(1) == 0 {
            self.safety_sweep(&event_ids).await;
        }

        saturated.map_or(Ok(()), Err)
    }

    async fn process_event(
        &self,
        event_id: &str,
        buckets: &mut HashMap<String, Bucket>,
    ) -> Result<(), TickError> {
        let Some(event) = self.store.event(event_id).await? else {
            return Ok(());
        };
        if !event.enabled {
            return Ok(());
        }

        let nonce = lease_nonce();
        if !self
            .store
            .acquire_lease(event_id, &nonce, self.options.lease_ttl_ms())
            .await?
        {
            // Another replica admits for this event this tick.
            return Ok(());
        }

        let outcome = self.admit_batch(&event, buckets, &nonce).await;
        if let Err(error) = self.store.release_lease(event_id, &nonce).await {
            debug!(event_id, %error, "Lease release failed, expires on its own");
        }
        outcome
    }

    async fn admit_batch(
        &self,
        event: &EventConfig,
        buckets: &mut HashMap<String, Bucket>,
        nonce: &str,
    ) -> Result<(), TickError> {
        let bucket = match buckets.entry(event.event_id.clone()) {
            Entry::Occupied(occupied) => occupied.into_mut(),
            Entry::Vacant(vacant) => {
                let restored = self.restore_bucket(&vacant.key().clone(), event).await?;
                vacant.insert(restored)
            }
        };

        let elapsed = bucket.last_refill.elapsed().as_secs_f64();
        bucket.last_refill = Instant::now();
        bucket.tokens = (bucket.tokens + event.release_rate * elapsed).min(event.bucket_capacity());

        let queue_len = self.store.queue_len(&event.event_id).await?;
        let admitted_count = self.store.admitted_count(&event.event_id).await?;
        let headroom = event
            .capacity
            .map_or(u64::MAX, |capacity| capacity.saturating_sub(admitted_count));
        let budget = (bucket.tokens.floor() as u64)
            .min(queue_len)
            .min(headroom)
            .min(self.options.max_admit_batch);
        if budget == 0 {
            self.persist_bucket(event, bucket).await?;
            return Ok(());
        }

        let candidates = self.store.peek_waiting(&event.event_id, budget).await?;
        let mut grants = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            grants.push((candidate.queue_id.clone(), self.mint_for(candidate, event)?));
        }

        // Tokens are minted before the pop so an entry is never observably
        // admitted without its token; the script re-checks queue order and
        // the lease, and admits a prefix of the grants at most.
        let admitted = self
            .store
            .admit_front(&event.event_id, nonce, event.token_ttl_ms, &grants)
            .await?;

        for entry in &admitted {
            self.observe_admission(entry);
            info!(
                queue_id = %entry.queue_id,
                event_id = %event.event_id,
                device_id = %entry.device_id,
                "Admitted entry"
            );
        }

        bucket.tokens -= admitted.len() as f64;
        self.persist_bucket(event, bucket).await?;
        Ok(())
    }

    async fn restore_bucket(
        &self,
        event_id: &str,
        event: &EventConfig,
    ) -> Result<Bucket, TickError> {
        let saved = self.store.bucket(event_id).await?;
        let now = self.store.now_ms();
        let tokens = saved
            .filter(|state| now.saturating_sub(state.updated_at_ms) <= BUCKET_STATE_TTL_MS)
            .map_or(0.0, |state| state.tokens.clamp(0.0, event.bucket_capacity()));
        Ok(Bucket {
            tokens,
            last_refill: Instant::now(),
        })
    }

    async fn persist_bucket(&self, event: &EventConfig, bucket: &Bucket) -> Result<(), TickError> {
        self.store
            .save_bucket(
                &event.event_id,
                &BucketState {
                    tokens: bucket.tokens,
                    updated_at_ms: self.store.now_ms(),
                },
            )
            .await?;
        Ok(())
    }

    fn mint_for(&self, entry: &QueueEntry, event: &EventConfig) -> Result<String, SignError> {
        let now = self.store.now_ms();
        self.signer.mint(&TokenBinding {
            device_id: entry.device_id.clone(),
            event_id: event.event_id.clone(),
            expires_at_ms: now + event.token_ttl_ms,
            issued_at_ms: now,
            queue_id: entry.queue_id.clone(),
            user_id: entry.user_id.clone(),
        })
    }

    fn observe_admission(&self, entry: &QueueEntry) {
        self.metrics
            .admissions_total
            .with_label_values(&[&entry.event_id])
            .inc();
        if let Some(admitted_at) = entry.admitted_at_ms {
            let waited_s = admitted_at.saturating_sub(entry.joined_at_ms) as f64 / 1000.0;
            self.metrics
                .wait_time_seconds
                .with_label_values(&[&entry.event_id])
                .observe(waited_s);
        }
    }

    async fn safety_sweep(&self, event_ids: &[String]) {
        for event_id in event_ids {
            let event = match self.store.event(event_id).await {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(error) => {
                    warn!(event_id, %error, "Sweep skipped");
                    continue;
                }
            };
            if let Err(error) = self
                .store
                .evict_stale(event_id, event.heartbeat_timeout_ms, SWEEP_EVICT_LIMIT)
                .await
            {
                warn!(event_id, %error, "Stale-waiter eviction failed");
            }
            match self.store.sweep_expired(event_id).await {
                Ok(swept) if swept > 0 => debug!(event_id, swept, "Swept expired admissions"),
                Ok(_) => {}
                Err(error) => warn!(event_id, %error, "Sweep failed"),
            }
            if let Ok(queue_len) = self.store.queue_len(event_id).await {
                self.metrics
                    .queue_length
                    .with_label_values(&[event_id])
                    .set(queue_len as i64);
            }
            self.metrics
                .release_rate
                .with_label_values(&[event_id])
                .set(event.release_rate);
        }
        if let Err(error) = self.store.sweep_revoked(self.store.now_ms()).await {
            warn!(%error, "Revocation sweep failed");
        }
    }
}

fn lease_nonce() -> String {
    hex::encode(rand::thread_rng().gen::<[u8; 16]>())
}
