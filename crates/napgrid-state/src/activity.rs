//! Activity tracker — last-invocation timestamp per function.
//!
//! Written by the proxy and the dispatcher on every call, read by the
//! autoscaler to measure idle time. Timestamps are microseconds since the
//! Unix epoch and never move backwards: a write older than the stored
//! value is ignored. A touch always advances the stored value, by one
//! microsecond when the clock has not moved since the previous touch.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Current wall-clock time in microseconds since the Unix epoch; the unit
/// of activity timestamps.
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Shared, cloneable map of function name to last-call timestamp.
#[derive(Clone, Default)]
pub struct ActivityTracker {
    last_calls: Arc<RwLock<HashMap<String, u64>>>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a call to `function` at the current time. The stored value
    /// strictly increases on every touch.
    pub fn touch(&self, function: &str) -> u64 {
        let now = now_us();
        let mut map = self
            .last_calls
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = map.entry(function.to_string()).or_insert(0);
        *entry = now.max(entry.saturating_add(1));
        *entry
    }

    /// Record a call at `timestamp_us`, keeping the larger of the stored
    /// and supplied values. Returns the value now stored.
    pub fn record(&self, function: &str, timestamp_us: u64) -> u64 {
        let mut map = self
            .last_calls
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = map.entry(function.to_string()).or_insert(timestamp_us);
        if timestamp_us > *entry {
            *entry = timestamp_us;
        }
        *entry
    }

    pub fn last_call(&self, function: &str) -> Option<u64> {
        self.last_calls
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(function)
            .copied()
    }

    /// Latest activity across every tracked function.
    pub fn latest_overall(&self) -> Option<u64> {
        self.last_calls
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .copied()
            .max()
    }

    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.last_calls
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
