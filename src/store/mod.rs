//! Store adapter: a thin façade over a Redis-class key/value engine exposing
//! only the operations the core needs.
//!
//! The store is the single source of truth for queue state. Multi-key writes
//! run inside single atomic scripts so a failure cannot split an entry from
//! its index. Every operation is bounded by the configured per-operation
//! timeout; transport faults carry an explicit retryable bit, logical
//! outcomes (missing entry, lost lease, replaced head) are modelled in the
//! return types.

use crate::{
    entries::{EntryState, QueueEntry, QueueId},
    events::EventConfig,
};
use async_trait::async_trait;
use clap::Parser;
use thiserror::Error;

#[cfg(test)]
pub mod memory;
pub mod redis;

/// Lifetime of persisted release-controller bucket state. Stale snapshots are
/// discarded on restart so a long outage cannot bank admissions.
pub const BUCKET_STATE_TTL_MS: u64 = 60_000;

#[derive(Clone, Debug, PartialEq, Eq, Parser)]
#[group(skip)]
pub struct Options {
    /// Store connection string.
    ///
    /// Example: `redis://127.0.0.1:6379/0`
    #[clap(long, env = "STORE_ADDR", default_value = "redis://127.0.0.1:6379")]
    pub store_addr: String,

    /// Deadline applied to every store operation.
    #[clap(long, env = "STORE_OP_TIMEOUT_MS", default_value = "2000")]
    pub op_timeout_ms: u64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Transport-level fault; the operation may be retried.
    #[error("store unavailable: {0}")]
    Transient(String),

    #[error("store operation timed out")]
    Timeout,

    /// The event lease was not held at commit time. The batch was not
    /// published.
    #[error("event lease lost")]
    LeaseLost,

    /// The store returned a payload the core cannot decode.
    #[error("undecodable store payload: {0}")]
    Decode(String),

    #[error("store error: {0}")]
    Backend(String),
}

impl StoreError {
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Inputs to the atomic join script. The queue id is generated by the caller;
/// `joined_at` and the queue score are assigned store-side so replicas with
/// skewed clocks cannot reorder arrivals.
#[derive(Clone, Debug)]
pub struct JoinRequest {
    pub queue_id: QueueId,
    pub event_id: String,
    pub device_id: String,
    pub user_id: Option<String>,
    pub priority: i32,
    pub entry_ttl_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Fresh entry inserted. `rank` is 0-based.
    Joined { queue_id: QueueId, rank: u64 },
    /// The device already waits in this event's queue; join is idempotent.
    Existing { queue_id: QueueId, rank: u64 },
    /// The device holds a still-valid admission.
    AlreadyAdmitted,
    /// Re-join attempted with a different priority. Entries are immutable
    /// after join.
    PriorityConflict,
}

/// Persisted release-controller token bucket snapshot.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BucketState {
    pub tokens: f64,
    pub updated_at_ms: u64,
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// The store's notion of current time. Read-side comparisons against
    /// store-written timestamps go through this so they share one clock.
    fn now_ms(&self) -> u64 {
        crate::util::now_ms()
    }

    /// Cheap liveness probe, used by `/health`.
    async fn ping(&self) -> StoreResult<()>;

    // Event configuration.
    async fn put_event(&self, config: &EventConfig) -> StoreResult<()>;
    async fn event(&self, event_id: &str) -> StoreResult<Option<EventConfig>>;
    async fn event_ids(&self) -> StoreResult<Vec<String>>;

    // Queue entries.
    async fn join(&self, request: &JoinRequest) -> StoreResult<JoinOutcome>;
    async fn entry(&self, queue_id: &QueueId) -> StoreResult<Option<QueueEntry>>;
    /// Refresh `last_heartbeat_ms` on an existing entry, unless the previous
    /// heartbeat is younger than `min_interval_ms` (write guard). Returns
    /// whether the heartbeat was persisted.
    async fn touch(&self, queue_id: &QueueId, min_interval_ms: u64) -> StoreResult<bool>;
    /// 0-based rank of a waiting entry in its event queue.
    async fn rank(&self, event_id: &str, queue_id: &QueueId) -> StoreResult<Option<u64>>;
    async fn queue_len(&self, event_id: &str) -> StoreResult<u64>;
    async fn admitted_count(&self, event_id: &str) -> StoreResult<u64>;
    /// Front of the queue in admission order, entries resolved.
    async fn peek_waiting(&self, event_id: &str, limit: u64) -> StoreResult<Vec<QueueEntry>>;
    /// Remove waiting entries at the front whose last heartbeat is older than
    /// the timeout. Examines at most `limit` entries; returns how many were
    /// evicted.
    async fn evict_stale(
        &self,
        event_id: &str,
        heartbeat_timeout_ms: u64,
        limit: u64,
    ) -> StoreResult<u64>;
    /// Revoke an entry: waiting entries leave the queue index, admitted
    /// entries additionally join the revocation set until their token expiry.
    /// Returns the state the entry was in, if it exists.
    async fn retire(&self, queue_id: &QueueId) -> StoreResult<Option<EntryState>>;

    // Admission.
    /// Atomically pop granted entries from the front of the queue, in queue
    /// order, marking each admitted with its pre-minted token. Stops at the
    /// first head entry without a grant, so a concurrently changed front
    /// admits fewer rather than out of order. Fails with [`StoreError::LeaseLost`]
    /// when `lease_nonce` no longer holds the event lease.
    async fn admit_front(
        &self,
        event_id: &str,
        lease_nonce: &str,
        token_ttl_ms: u64,
        grants: &[(QueueId, String)],
    ) -> StoreResult<Vec<QueueEntry>>;
    /// Admit one specific waiting entry out of order (admin force-admit).
    async fn admit_one(
        &self,
        event_id: &str,
        queue_id: &QueueId,
        token: &str,
        token_ttl_ms: u64,
    ) -> StoreResult<Option<QueueEntry>>;
    /// Trim the admitted index of entries past their token expiry.
    async fn sweep_expired(&self, event_id: &str) -> StoreResult<u64>;
    /// Expire up to `limit` waiting entries (admin drain). Returns how many
    /// were removed; callers loop until the queue is empty.
    async fn drain_waiting(&self, event_id: &str, limit: u64) -> StoreResult<u64>;

    // Event lease.
    async fn acquire_lease(&self, event_id: &str, nonce: &str, ttl_ms: u64) -> StoreResult<bool>;
    async fn release_lease(&self, event_id: &str, nonce: &str) -> StoreResult<bool>;

    // Token revocation.
    async fn revoke(&self, queue_id: &QueueId, until_ms: u64) -> StoreResult<()>;
    async fn is_revoked(&self, queue_id: &QueueId, now_ms: u64) -> StoreResult<bool>;
    async fn sweep_revoked(&self, now_ms: u64) -> StoreResult<u64>;

    // Release-controller bucket persistence.
    async fn bucket(&self, event_id: &str) -> StoreResult<Option<BucketState>>;
    async fn save_bucket(&self, event_id: &str, state: &BucketState) -> StoreResult<()>;
}

// Key layout. Uniqueness is the only contract; the shapes below are shared
// with the Lua scripts in `redis.rs`.
pub(crate) fn queue_key(event_id: &str) -> String {
    format!("event:{event_id}:queue")
}

pub(crate) fn admitted_key(event_id: &str) -> String {
    format!("event:{event_id}:admitted")
}

pub(crate) fn entry_key(queue_id: &QueueId) -> String {
    format!("entry:{queue_id}")
}

pub(crate) fn device_key(event_id: &str, device_id: &str) -> String {
    format!("event:{event_id}:device:{device_id}")
}

pub(crate) fn lease_key(event_id: &str) -> String {
    format!("event:{event_id}:lock")
}

pub(crate) fn bucket_key(event_id: &str) -> String {
    format!("event:{event_id}:bucket")
}

pub(crate) fn config_key(event_id: &str) -> String {
    format!("event:{event_id}:config")
}

pub(crate) const EVENTS_KEY: &str = "events";
pub(crate) const REVOKED_KEY: &str = "token:revoked";
