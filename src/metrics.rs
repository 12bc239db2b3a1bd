//! Process counters exposed at `/metrics`.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug)]
pub struct Metrics {
    pub events_received: AtomicU64,
    pub actions_fired: AtomicU64,
    pub actions_skipped: AtomicU64,
    pub commands_sent: AtomicU64,
    pub commands_failed: AtomicU64,
    pub media_enqueued: AtomicU64,
    pub media_refused: AtomicU64,
    pub media_delivered: AtomicU64,
    pub comments_queued: AtomicU64,
    pub comments_dropped: AtomicU64,
    pub comments_spoken: AtomicU64,
    pub speech_failed: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            events_received: AtomicU64::new(0),
            actions_fired: AtomicU64::new(0),
            actions_skipped: AtomicU64::new(0),
            commands_sent: AtomicU64::new(0),
            commands_failed: AtomicU64::new(0),
            media_enqueued: AtomicU64::new(0),
            media_refused: AtomicU64::new(0),
            media_delivered: AtomicU64::new(0),
            comments_queued: AtomicU64::new(0),
            comments_dropped: AtomicU64::new(0),
            comments_spoken: AtomicU64::new(0),
            speech_failed: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> Value {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let uptime = self.uptime_seconds();

        let uptime_str = if uptime < 60 {
            format!("{}s", uptime)
        } else if uptime < 3600 {
            format!("{}m {}s", uptime / 60, uptime % 60)
        } else {
            format!("{}h {}m {}s", uptime / 3600, (uptime % 3600) / 60, uptime % 60)
        };

        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_seconds": uptime,
            "uptime": uptime_str,
            "events": { "received": load(&self.events_received) },
            "actions": {
                "fired": load(&self.actions_fired),
                "skipped": load(&self.actions_skipped)
            },
            "commands": {
                "sent": load(&self.commands_sent),
                "failed": load(&self.commands_failed)
            },
            "media": {
                "enqueued": load(&self.media_enqueued),
                "refused": load(&self.media_refused),
                "delivered": load(&self.media_delivered)
            },
            "comments": {
                "queued": load(&self.comments_queued),
                "dropped": load(&self.comments_dropped),
                "spoken": load(&self.comments_spoken),
                "speech_failed": load(&self.speech_failed)
            }
        })
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
