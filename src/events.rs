use serde::{Deserialize, Serialize};
use std::{collections::HashMap, time::Duration};
use thiserror::Error;

/// Extra lifetime granted to entry records beyond their useful window, so
/// late status reads still resolve to a terminal state instead of not-found.
pub const ENTRY_TTL_SLACK_MS: u64 = 60_000;

/// Admission policy for one protected resource.
///
/// Events are created and updated through the admin surface; the core only
/// reads them and never deletes them implicitly.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventConfig {
    pub event_id: String,
    /// Admissions per second. Fractional rates are allowed; zero never admits.
    pub release_rate: f64,
    /// Maximum simultaneous admitted holders. Unbounded if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u64>,
    pub token_ttl_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub enabled: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventConfigError {
    #[error("event_id must be 1..=128 chars of [A-Za-z0-9._-]")]
    InvalidId,
    #[error("release_rate must be a finite number >= 0")]
    InvalidRate,
    #[error("token_ttl_ms must be positive")]
    InvalidTokenTtl,
    #[error("heartbeat_timeout_ms must be positive")]
    InvalidHeartbeatTimeout,
}

impl EventConfig {
    pub fn validate(&self) -> Result<(), EventConfigError> {
        let id_ok = !self.event_id.is_empty()
            && self.event_id.len() <= 128
            && self
                .event_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !id_ok {
            return Err(EventConfigError::InvalidId);
        }
        if !self.release_rate.is_finite() || self.release_rate < 0.0 {
            return Err(EventConfigError::InvalidRate);
        }
        if self.token_ttl_ms == 0 {
            return Err(EventConfigError::InvalidTokenTtl);
        }
        if self.heartbeat_timeout_ms == 0 {
            return Err(EventConfigError::InvalidHeartbeatTimeout);
        }
        Ok(())
    }

    #[must_use]
    pub fn token_ttl(&self) -> Duration {
        Duration::from_millis(self.token_ttl_ms)
    }

    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Lifetime of the backing entry record.
    #[must_use]
    pub fn entry_ttl_ms(&self) -> u64 {
        self.heartbeat_timeout_ms.max(self.token_ttl_ms) + ENTRY_TTL_SLACK_MS
    }

    /// Token bucket capacity: one admission of burst minimum, otherwise one
    /// tick worth of the configured rate.
    #[must_use]
    pub fn bucket_capacity(&self) -> f64 {
        self.release_rate.ceil().max(1.0)
    }

    pub(crate) fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("release_rate", self.release_rate.to_string()),
            ("token_ttl_ms", self.token_ttl_ms.to_string()),
            ("heartbeat_timeout_ms", self.heartbeat_timeout_ms.to_string()),
            ("enabled", u8::from(self.enabled).to_string()),
        ];
        if let Some(capacity) = self.capacity {
            fields.push(("capacity", capacity.to_string()));
        }
        fields
    }

    pub(crate) fn from_fields(event_id: &str, fields: &HashMap<String, String>) -> Option<Self> {
        Some(Self {
            event_id: event_id.to_owned(),
            release_rate: fields.get("release_rate")?.parse().ok()?,
            capacity: match fields.get("capacity") {
                Some(raw) => Some(raw.parse().ok()?),
                None => None,
            },
            token_ttl_ms: fields.get("token_ttl_ms")?.parse().ok()?,
            heartbeat_timeout_ms: fields.get("heartbeat_timeout_ms")?.parse().ok()?,
            enabled: fields.get("enabled").map(String::as_str) == Some("1"),
        })
    }
}
