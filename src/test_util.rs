#![cfg(test)]

use crate::{
    entries::QueueId, events::EventConfig, keys::Keys, metrics::Metrics, queue, release,
    store::JoinRequest, Options,
};
use clap::Parser;
use std::sync::Arc;

#[must_use]
pub fn test_options() -> Options {
    let args: Vec<&str> = vec!["anteroom", "--token-secret", "unit-test-secret-0000"];
    Options::parse_from(args)
}

#[must_use]
pub fn test_keys() -> Arc<Keys> {
    Arc::new(Keys::new(&test_options().keys).unwrap())
}

#[must_use]
pub fn test_metrics() -> Arc<Metrics> {
    Metrics::new().unwrap()
}

#[must_use]
pub fn queue_options() -> queue::Options {
    test_options().queue
}

#[must_use]
pub fn release_options() -> release::Options {
    test_options().release
}

#[must_use]
pub fn test_event(event_id: &str) -> EventConfig {
    EventConfig {
        event_id: event_id.to_owned(),
        release_rate: 1.0,
        capacity: None,
        token_ttl_ms: 60_000,
        heartbeat_timeout_ms: 10_000,
        enabled: true,
    }
}

#[must_use]
pub fn join_request(event_id: &str, device_id: &str, priority: i32) -> JoinRequest {
    JoinRequest {
        queue_id: QueueId::new(),
        event_id: event_id.to_owned(),
        device_id: device_id.to_owned(),
        user_id: None,
        priority,
        entry_ttl_ms: 120_000,
    }
}
