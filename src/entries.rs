use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt::{Display, Formatter},
};
use strum::{Display as StrumDisplay, EnumString};
use uuid::Uuid;

/// Accepted bounds for the join `priority` field. Lower admits earlier.
///
/// The bounds keep `priority * 2^40 + joined_at_offset` exactly representable
/// in the store's double-width sorted-set score.
pub const PRIORITY_MIN: i32 = -4096;
pub const PRIORITY_MAX: i32 = 4095;

/// Base of the joined-at offset inside queue scores: 2025-01-01T00:00:00Z in
/// Unix milliseconds. Store-side scripts embed the same constant.
pub const SCORE_EPOCH_MS: u64 = 1_735_689_600_000;

/// Score distance between adjacent priorities.
pub const PRIORITY_STRIDE: i64 = 1 << 40;

#[derive(Debug, Hash, Serialize, Deserialize, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename = "queue_id")]
pub struct QueueId(pub String);

impl QueueId {
    // Create a random queue id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for QueueId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for QueueId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Entry lifecycle. Transitions are monotone: `waiting` may become any other
/// state, `admitted` may only expire or be revoked, terminal states never
/// re-enter `waiting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, StrumDisplay, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EntryState {
    Waiting,
    Admitted,
    Expired,
    Revoked,
}

impl EntryState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Expired | Self::Revoked)
    }
}

/// One device's presence in an event's queue, from join to terminal state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueEntry {
    pub queue_id: QueueId,
    pub event_id: String,
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub priority: i32,
    pub joined_at_ms: u64,
    pub last_heartbeat_ms: u64,
    pub state: EntryState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admitted_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl QueueEntry {
    /// Queue order within an event is strictly ascending by this score, with
    /// the member id as the store-side tie break.
    #[must_use]
    pub fn queue_score(priority: i32, joined_at_ms: u64) -> f64 {
        let offset = joined_at_ms.saturating_sub(SCORE_EPOCH_MS);
        (i64::from(priority) * PRIORITY_STRIDE) as f64 + offset as f64
    }

    pub(crate) fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        Some(Self {
            queue_id: QueueId(fields.get("queue_id")?.clone()),
            event_id: fields.get("event_id")?.clone(),
            device_id: fields.get("device_id")?.clone(),
            user_id: fields.get("user_id").cloned(),
            priority: fields.get("priority")?.parse().ok()?,
            joined_at_ms: fields.get("joined_at_ms")?.parse().ok()?,
            last_heartbeat_ms: fields.get("last_heartbeat_ms")?.parse().ok()?,
            state: fields.get("state")?.parse().ok()?,
            admitted_at_ms: match fields.get("admitted_at_ms") {
                Some(raw) => Some(raw.parse().ok()?),
                None => None,
            },
            expires_at_ms: match fields.get("expires_at_ms") {
                Some(raw) => Some(raw.parse().ok()?),
                None => None,
            },
            token: fields.get("token").cloned(),
        })
    }
}
