//! Destination liveness.
//!
//! Every poll from a display destination is a heartbeat. A destination is
//! active while its last heartbeat is at most [`STALE_AFTER`] old; a
//! destination that was never seen is inactive. Stale entries are never
//! cleaned up, they simply read as inactive.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// How long a heartbeat keeps a destination active.
pub const STALE_AFTER: Duration = Duration::from_secs(10);

/// Last heartbeat per destination, behind a single lock.
#[derive(Debug)]
pub struct LivenessTracker {
    last_seen: Mutex<HashMap<String, Instant>>,
    window: Duration,
}

impl LivenessTracker {
    pub fn new() -> Self {
        Self::with_window(STALE_AFTER)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            last_seen: Mutex::new(HashMap::new()),
            window,
        }
    }

    /// Record "now" for `destination`, overwriting any earlier heartbeat.
    pub fn heartbeat(&self, destination: &str) {
        let now = Instant::now();
        let mut last_seen = self.last_seen.lock().unwrap_or_else(PoisonError::into_inner);
        last_seen.insert(destination.to_string(), now);
        trace!(destination = %destination, "Heartbeat");
    }

    pub fn is_active(&self, destination: &str) -> bool {
        let last_seen = self.last_seen.lock().unwrap_or_else(PoisonError::into_inner);
        last_seen
            .get(destination)
            .is_some_and(|seen| seen.elapsed() <= self.window)
    }

    /// Currently active destinations, sorted by name.
    pub fn active_destinations(&self) -> Vec<String> {
        let last_seen = self.last_seen.lock().unwrap_or_else(PoisonError::into_inner);
        let mut active: Vec<String> = last_seen
            .iter()
            .filter(|(_, seen)| seen.elapsed() <= self.window)
            .map(|(name, _)| name.clone())
            .collect();
        active.sort();
        active
    }
}

impl Default for LivenessTracker {
    fn default() -> Self {
        Self::new()
    }
}
