//! In-memory [`Store`] used by unit tests. Mirrors the semantics of the
//! Redis scripts, with a manually advanced clock so scheduler tests stay
//! deterministic.

use super::{
    BucketState, JoinOutcome, JoinRequest, Store, StoreError, StoreResult, BUCKET_STATE_TTL_MS,
};
use crate::{
    entries::{EntryState, QueueEntry, QueueId, PRIORITY_STRIDE, SCORE_EPOCH_MS},
    events::EventConfig,
};
use async_trait::async_trait;
use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

#[derive(Default)]
struct Inner {
    events: HashMap<String, EventConfig>,
    entries: HashMap<String, QueueEntry>,
    // Queue index per event, ordered by (score, queue_id).
    queues: HashMap<String, BTreeSet<(i64, String)>>,
    // Admitted index per event, ordered by (expires_at_ms, queue_id).
    admitted: HashMap<String, BTreeSet<(u64, String)>>,
    devices: HashMap<(String, String), String>,
    revoked: HashMap<String, u64>,
    leases: HashMap<String, (String, u64)>,
    buckets: HashMap<String, BucketState>,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    now_ms: AtomicU64,
    fail_remaining: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            inner: Mutex::default(),
            now_ms: AtomicU64::new(SCORE_EPOCH_MS + 1_000_000),
            fail_remaining: AtomicU64::new(0),
        }
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    pub fn advance(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }

    /// Make the next `count` operations fail with a retryable transport
    /// error.
    pub fn fail_next(&self, count: u64) {
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    fn take_failure(&self) -> StoreResult<()> {
        let remaining = self.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Transient("injected".to_owned()));
        }
        Ok(())
    }

    fn score(priority: i32, joined_at_ms: u64) -> i64 {
        i64::from(priority) * PRIORITY_STRIDE
            + i64::try_from(joined_at_ms.saturating_sub(SCORE_EPOCH_MS)).unwrap_or(i64::MAX)
    }

    fn lease_held(inner: &Inner, event_id: &str, nonce: &str, now: u64) -> bool {
        inner
            .leases
            .get(event_id)
            .is_some_and(|(held, until)| held == nonce && *until > now)
    }

    fn drop_device_mapping(inner: &mut Inner, event_id: &str, device_id: &str, queue_id: &str) {
        let key = (event_id.to_owned(), device_id.to_owned());
        if inner.devices.get(&key).map(String::as_str) == Some(queue_id) {
            inner.devices.remove(&key);
        }
    }

    fn admit_entry(inner: &mut Inner, queue_id: &str, token: &str, now: u64, token_ttl_ms: u64) {
        let Some(entry) = inner.entries.get_mut(queue_id) else {
            return;
        };
        let expires = now + token_ttl_ms;
        entry.state = EntryState::Admitted;
        entry.admitted_at_ms = Some(now);
        entry.expires_at_ms = Some(expires);
        entry.token = Some(token.to_owned());
        let event_id = entry.event_id.clone();
        let device_id = entry.device_id.clone();
        inner
            .admitted
            .entry(event_id.clone())
            .or_default()
            .insert((expires, queue_id.to_owned()));
        inner
            .devices
            .insert((event_id, device_id), queue_id.to_owned());
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    async fn ping(&self) -> StoreResult<()> {
        self.take_failure()
    }

    async fn put_event(&self, config: &EventConfig) -> StoreResult<()> {
        self.take_failure()?;
        let mut inner = self.inner.lock().unwrap();
        inner.events.insert(config.event_id.clone(), config.clone());
        Ok(())
    }

    async fn event(&self, event_id: &str) -> StoreResult<Option<EventConfig>> {
        self.take_failure()?;
        let inner = self.inner.lock().unwrap();
        Ok(inner.events.get(event_id).cloned())
    }

    async fn event_ids(&self) -> StoreResult<Vec<String>> {
        self.take_failure()?;
        let inner = self.inner.lock().unwrap();
        let mut ids: Vec<String> = inner.events.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn join(&self, request: &JoinRequest) -> StoreResult<JoinOutcome> {
        self.take_failure()?;
        let now = self.now_ms();
        let mut inner = self.inner.lock().unwrap();

        let device = (request.event_id.clone(), request.device_id.clone());
        if let Some(existing) = inner.devices.get(&device).cloned() {
            match inner.entries.get(&existing) {
                Some(entry) if entry.state == EntryState::Waiting => {
                    if entry.priority != request.priority {
                        return Ok(JoinOutcome::PriorityConflict);
                    }
                    let rank = inner
                        .queues
                        .get(&request.event_id)
                        .and_then(|queue| {
                            queue.iter().position(|(_, id)| *id == existing)
                        })
                        .unwrap_or(0) as u64;
                    return Ok(JoinOutcome::Existing {
                        queue_id: QueueId(existing),
                        rank,
                    });
                }
                Some(entry)
                    if entry.state == EntryState::Admitted
                        && entry.expires_at_ms.is_some_and(|exp| exp > now) =>
                {
                    return Ok(JoinOutcome::AlreadyAdmitted);
                }
                _ => {
                    inner.devices.remove(&device);
                }
            }
        }

        let queue_id = request.queue_id.0.clone();
        inner.entries.insert(
            queue_id.clone(),
            QueueEntry {
                queue_id: request.queue_id.clone(),
                event_id: request.event_id.clone(),
                device_id: request.device_id.clone(),
                user_id: request.user_id.clone(),
                priority: request.priority,
                joined_at_ms: now,
                last_heartbeat_ms: now,
                state: EntryState::Waiting,
                admitted_at_ms: None,
                expires_at_ms: None,
                token: None,
            },
        );
        let score = Self::score(request.priority, now);
        let queue = inner.queues.entry(request.event_id.clone()).or_default();
        queue.insert((score, queue_id.clone()));
        let rank = queue.iter().position(|(_, id)| *id == queue_id).unwrap_or(0) as u64;
        inner.devices.insert(device, queue_id);
        Ok(JoinOutcome::Joined {
            queue_id: request.queue_id.clone(),
            rank,
        })
    }

    async fn entry(&self, queue_id: &QueueId) -> StoreResult<Option<QueueEntry>> {
        self.take_failure()?;
        let inner = self.inner.lock().unwrap();
        Ok(inner.entries.get(&queue_id.0).cloned())
    }

    async fn touch(&self, queue_id: &QueueId, min_interval_ms: u64) -> StoreResult<bool> {
        self.take_failure()?;
        let now = self.now_ms();
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.get_mut(&queue_id.0) {
            if now.saturating_sub(entry.last_heartbeat_ms) >= min_interval_ms {
                entry.last_heartbeat_ms = now;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn rank(&self, event_id: &str, queue_id: &QueueId) -> StoreResult<Option<u64>> {
        self.take_failure()?;
        let inner = self.inner.lock().unwrap();
        Ok(inner.queues.get(event_id).and_then(|queue| {
            queue
                .iter()
                .position(|(_, id)| *id == queue_id.0)
                .map(|rank| rank as u64)
        }))
    }

    async fn queue_len(&self, event_id: &str) -> StoreResult<u64> {
        self.take_failure()?;
        let inner = self.inner.lock().unwrap();
        Ok(inner.queues.get(event_id).map_or(0, |queue| queue.len() as u64))
    }

    async fn admitted_count(&self, event_id: &str) -> StoreResult<u64> {
        self.take_failure()?;
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .admitted
            .get(event_id)
            .map_or(0, |index| index.len() as u64))
    }

    async fn peek_waiting(&self, event_id: &str, limit: u64) -> StoreResult<Vec<QueueEntry>> {
        self.take_failure()?;
        let inner = self.inner.lock().unwrap();
        let Some(queue) = inner.queues.get(event_id) else {
            return Ok(Vec::new());
        };
        Ok(queue
            .iter()
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .filter_map(|(_, id)| inner.entries.get(id).cloned())
            .collect())
    }

    async fn evict_stale(
        &self,
        event_id: &str,
        heartbeat_timeout_ms: u64,
        limit: u64,
    ) -> StoreResult<u64> {
        self.take_failure()?;
        let now = self.now_ms();
        let cutoff = now.saturating_sub(heartbeat_timeout_ms);
        let mut inner = self.inner.lock().unwrap();

        let front: Vec<(i64, String)> = inner
            .queues
            .get(event_id)
            .map(|queue| {
                queue
                    .iter()
                    .take(usize::try_from(limit).unwrap_or(usize::MAX))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let mut removed = 0;
        for (score, queue_id) in front {
            let stale = match inner.entries.get(&queue_id) {
                None => true,
                Some(entry) => entry.last_heartbeat_ms < cutoff,
            };
            if !stale {
                continue;
            }
            if let Some(queue) = inner.queues.get_mut(event_id) {
                queue.remove(&(score, queue_id.clone()));
            }
            if let Some(entry) = inner.entries.get_mut(&queue_id) {
                entry.state = EntryState::Expired;
                let device_id = entry.device_id.clone();
                Self::drop_device_mapping(&mut inner, event_id, &device_id, &queue_id);
            }
            removed += 1;
        }
        Ok(removed)
    }

    async fn retire(&self, queue_id: &QueueId) -> StoreResult<Option<EntryState>> {
        self.take_failure()?;
        let now = self.now_ms();
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.entries.get(&queue_id.0).cloned() else {
            return Ok(None);
        };
        let prior = entry.state;
        match prior {
            EntryState::Waiting => {
                let score = Self::score(entry.priority, entry.joined_at_ms);
                if let Some(queue) = inner.queues.get_mut(&entry.event_id) {
                    queue.remove(&(score, queue_id.0.clone()));
                }
            }
            EntryState::Admitted => {
                if let Some(expires) = entry.expires_at_ms {
                    if let Some(index) = inner.admitted.get_mut(&entry.event_id) {
                        index.remove(&(expires, queue_id.0.clone()));
                    }
                    if expires > now {
                        inner.revoked.insert(queue_id.0.clone(), expires);
                    }
                }
            }
            EntryState::Expired | EntryState::Revoked => return Ok(Some(prior)),
        }
        if let Some(entry) = inner.entries.get_mut(&queue_id.0) {
            entry.state = EntryState::Revoked;
        }
        Self::drop_device_mapping(&mut inner, &entry.event_id, &entry.device_id, &queue_id.0);
        Ok(Some(prior))
    }

    async fn admit_front(
        &self,
        event_id: &str,
        lease_nonce: &str,
        token_ttl_ms: u64,
        grants: &[(QueueId, String)],
    ) -> StoreResult<Vec<QueueEntry>> {
        self.take_failure()?;
        let now = self.now_ms();
        let mut inner = self.inner.lock().unwrap();
        if !Self::lease_held(&inner, event_id, lease_nonce, now) {
            return Err(StoreError::LeaseLost);
        }

        let grants: HashMap<&str, &str> = grants
            .iter()
            .map(|(queue_id, token)| (queue_id.0.as_str(), token.as_str()))
            .collect();

        let mut admitted = Vec::new();
        loop {
            let Some(head) = inner
                .queues
                .get(event_id)
                .and_then(|queue| queue.iter().next().cloned())
            else {
                break;
            };
            let Some(token) = grants.get(head.1.as_str()).copied() else {
                break;
            };
            if let Some(queue) = inner.queues.get_mut(event_id) {
                queue.remove(&head);
            }
            Self::admit_entry(&mut inner, &head.1, token, now, token_ttl_ms);
            if let Some(entry) = inner.entries.get(&head.1) {
                admitted.push(entry.clone());
            }
        }
        Ok(admitted)
    }

    async fn admit_one(
        &self,
        event_id: &str,
        queue_id: &QueueId,
        token: &str,
        token_ttl_ms: u64,
    ) -> StoreResult<Option<QueueEntry>> {
        self.take_failure()?;
        let now = self.now_ms();
        let mut inner = self.inner.lock().unwrap();
        let Some(member) = inner.queues.get(event_id).and_then(|queue| {
            queue
                .iter()
                .find(|(_, id)| *id == queue_id.0)
                .cloned()
        }) else {
            return Ok(None);
        };
        if let Some(queue) = inner.queues.get_mut(event_id) {
            queue.remove(&member);
        }
        Self::admit_entry(&mut inner, &queue_id.0, token, now, token_ttl_ms);
        Ok(inner.entries.get(&queue_id.0).cloned())
    }

    async fn sweep_expired(&self, event_id: &str) -> StoreResult<u64> {
        self.take_failure()?;
        let now = self.now_ms();
        let mut inner = self.inner.lock().unwrap();
        let due: Vec<(u64, String)> = inner
            .admitted
            .get(event_id)
            .map(|index| {
                index
                    .iter()
                    .take_while(|(expires, _)| *expires <= now)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        for (expires, queue_id) in &due {
            if let Some(index) = inner.admitted.get_mut(event_id) {
                index.remove(&(*expires, queue_id.clone()));
            }
            if let Some(entry) = inner.entries.get_mut(queue_id) {
                entry.state = EntryState::Expired;
                let device_id = entry.device_id.clone();
                Self::drop_device_mapping(&mut inner, event_id, &device_id, queue_id);
            }
        }
        Ok(due.len() as u64)
    }

    async fn drain_waiting(&self, event_id: &str, limit: u64) -> StoreResult<u64> {
        self.take_failure()?;
        let mut inner = self.inner.lock().unwrap();
        let batch: Vec<(i64, String)> = inner
            .queues
            .get(event_id)
            .map(|queue| {
                queue
                    .iter()
                    .take(usize::try_from(limit).unwrap_or(usize::MAX))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        for (score, queue_id) in &batch {
            if let Some(queue) = inner.queues.get_mut(event_id) {
                queue.remove(&(*score, queue_id.clone()));
            }
            if let Some(entry) = inner.entries.get_mut(queue_id) {
                entry.state = EntryState::Expired;
                let device_id = entry.device_id.clone();
                Self::drop_device_mapping(&mut inner, event_id, &device_id, queue_id);
            }
        }
        Ok(batch.len() as u64)
    }

    async fn acquire_lease(&self, event_id: &str, nonce: &str, ttl_ms: u64) -> StoreResult<bool> {
        self.take_failure()?;
        let now = self.now_ms();
        let mut inner = self.inner.lock().unwrap();
        match inner.leases.get(event_id) {
            Some((_, until)) if *until > now => Ok(false),
            _ => {
                inner
                    .leases
                    .insert(event_id.to_owned(), (nonce.to_owned(), now + ttl_ms));
                Ok(true)
            }
        }
    }

    async fn release_lease(&self, event_id: &str, nonce: &str) -> StoreResult<bool> {
        self.take_failure()?;
        let mut inner = self.inner.lock().unwrap();
        if inner
            .leases
            .get(event_id)
            .is_some_and(|(held, _)| held == nonce)
        {
            inner.leases.remove(event_id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn revoke(&self, queue_id: &QueueId, until_ms: u64) -> StoreResult<()> {
        self.take_failure()?;
        let mut inner = self.inner.lock().unwrap();
        inner.revoked.insert(queue_id.0.clone(), until_ms);
        Ok(())
    }

    async fn is_revoked(&self, queue_id: &QueueId, now_ms: u64) -> StoreResult<bool> {
        self.take_failure()?;
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .revoked
            .get(&queue_id.0)
            .is_some_and(|until| now_ms < *until))
    }

    async fn sweep_revoked(&self, now_ms: u64) -> StoreResult<u64> {
        self.take_failure()?;
        let mut inner = self.inner.lock().unwrap();
        let before = inner.revoked.len();
        inner.revoked.retain(|_, until| *until > now_ms);
        Ok((before - inner.revoked.len()) as u64)
    }

    async fn bucket(&self, event_id: &str) -> StoreResult<Option<BucketState>> {
        self.take_failure()?;
        let now = self.now_ms();
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .buckets
            .get(event_id)
            .filter(|state| now.saturating_sub(state.updated_at_ms) <= BUCKET_STATE_TTL_MS)
            .copied())
    }

    async fn save_bucket(&self, event_id: &str, state: &BucketState) -> StoreResult<()> {
        self.take_failure()?;
        let mut inner = self.inner.lock().unwrap();
        inner.buckets.insert(event_id.to_owned(), *state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{join_request, test_event};

    #[tokio::test]
    async fn join_is_ordered_by_priority_then_arrival() {
        let store = MemoryStore::new();
        store.put_event(&test_event("ev1")).await.unwrap();

        store.join(&join_request("ev1", "d1", 0)).await.unwrap();
        store.advance(10);
        store.join(&join_request("ev1", "d2", 0)).await.unwrap();
        store.advance(10);
        store.join(&join_request("ev1", "d3", -1)).await.unwrap();

        let front = store.peek_waiting("ev1", 10).await.unwrap();
        let devices: Vec<&str> = front.iter().map(|e| e.device_id.as_str()).collect();
        assert_eq!(devices, vec!["d3", "d1", "d2"]);
    }

    #[tokio::test]
    async fn admit_front_requires_the_lease() {
        let store = MemoryStore::new();
        store.put_event(&test_event("ev1")).await.unwrap();
        let outcome = store.join(&join_request("ev1", "d1", 0)).await.unwrap();
        let JoinOutcome::Joined { queue_id, .. } = outcome else {
            panic!("expected fresh join");
        };

        let grants = vec![(queue_id, "tok".to_owned())];
        let missing = store.admit_front("ev1", "nonce", 60_000, &grants).await;
        assert!(matches!(missing, Err(StoreError::LeaseLost)));

        assert!(store.acquire_lease("ev1", "nonce", 2_000).await.unwrap());
        let admitted = store
            .admit_front("ev1", "nonce", 60_000, &grants)
            .await
            .unwrap();
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].state, EntryState::Admitted);
        assert_eq!(admitted[0].token.as_deref(), Some("tok"));
    }

    #[tokio::test]
    async fn injected_failures_surface_as_transient() {
        let store = MemoryStore::new();
        store.fail_next(1);
        let err = store.ping().await.unwrap_err();
        assert!(err.retryable());
        store.ping().await.unwrap();
    }
}
