//! Media Dispatch Queue.
//!
//! One ordered sequence shared by every destination. Each destination sees
//! only its own entries, oldest first, and may hold at most `capacity` of
//! them at a time. Once a destination is full new payloads are refused; old
//! ones are never evicted.
//!
//! ```text
//!   enqueue(main:a) enqueue(side:b) enqueue(main:c)
//!   queue: [main:a, side:b, main:c]
//!   dequeue_for("main") -> main:a   queue: [side:b, main:c]
//! ```
//!
//! Polling doubles as a heartbeat: [`MediaQueue::dequeue_for`] marks the
//! destination alive before looking for work.

use crate::liveness::LivenessTracker;
use crate::snapshot::{Action, MediaSpec};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Media handed to a destination, shaped for the screen overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub media_path: String,
    pub max_duration: String,
    pub volume: f64,
    #[serde(rename = "screen")]
    pub destination: String,
    pub action_id: String,
    pub skip_on_next_action: bool,
    pub show_user_info: bool,
    pub display_text: String,
}

impl DispatchPayload {
    pub fn from_action(action: &Action, media: &MediaSpec) -> Self {
        Self {
            kind: media.kind.clone(),
            media_path: media.media_path.clone(),
            max_duration: media.max_duration.clone(),
            volume: media.volume,
            destination: action.destination.clone(),
            action_id: action.id.clone(),
            skip_on_next_action: action.skip_on_next_action,
            show_user_info: action.show_user_info,
            display_text: action.display_text.clone(),
        }
    }
}

pub struct MediaQueue {
    entries: Mutex<VecDeque<DispatchPayload>>,
    capacity: AtomicUsize,
    liveness: Arc<LivenessTracker>,
}

impl MediaQueue {
    pub fn new(capacity: usize, liveness: Arc<LivenessTracker>) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: AtomicUsize::new(capacity),
            liveness,
        }
    }

    /// Per-destination limit. Entries already queued above a lowered limit stay.
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::Relaxed);
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Append `payload` unless its destination is already at capacity.
    pub fn enqueue(&self, payload: DispatchPayload) -> bool {
        let capacity = self.capacity();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        let queued = entries
            .iter()
            .filter(|p| p.destination == payload.destination)
            .count();
        if queued >= capacity {
            debug!(
                destination = %payload.destination,
                queued = queued,
                capacity = capacity,
                "Media queue full for destination"
            );
            return false;
        }

        entries.push_back(payload);
        true
    }

    /// Heartbeat `destination`, then take its oldest payload.
    pub fn dequeue_for(&self, destination: &str) -> Option<DispatchPayload> {
        self.liveness.heartbeat(destination);

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let index = entries.iter().position(|p| p.destination == destination)?;
        let payload = entries.remove(index);

        debug!(
            destination = %destination,
            remaining = entries.len(),
            "Media dequeued"
        );
        payload
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len_for(&self, destination: &str) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|p| p.destination == destination)
            .count()
    }
}
