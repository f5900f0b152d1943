use rand::Rng;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Retry backoff for the given attempt (1-based), with random jitter so
/// concurrent replicas do not retry in lockstep.
#[must_use]
pub fn retry_backoff(attempt: u32) -> Duration {
    let base = 50 * u64::from(attempt);
    let jitter = rand::thread_rng().gen_range(0..=base);
    Duration::from_millis(base + jitter)
}
