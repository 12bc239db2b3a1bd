//! Comment Queue and its drain worker.
//!
//! Chat messages that pass the text-to-speech filter are rendered,
//! truncated once to `max_chars_tts` characters and queued. The queue is
//! bounded: when full, the new comment is dropped and the producer moves on.
//!
//! A single [`CommentDrain`] pops at most one comment per tick and hands it
//! to the [`SpeechSink`]. A failed speech is logged and not requeued.

use crate::event::ChatEvent;
use crate::metrics::Metrics;
use crate::shutdown::ShutdownSignal;
use crate::sinks::SpeechSink;
use crate::snapshot::{ConfigStore, TtsConfig};
use regex::{Captures, Regex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// TTS filter type admitting only fan-club members.
pub const FILTER_FAN_CLUB: &str = "fanClub";

/// TTS filter type admitting every chat message.
pub const FILTER_ALL: &str = "all";

/// Render the text to speak for `chat`, or `None` if the filter rejects it.
pub fn speakable_comment(chat: &ChatEvent, tts: &TtsConfig, template: &str) -> Option<String> {
    if !tts.enabled || chat.comment.trim().is_empty() {
        return None;
    }

    let admitted = match tts.kind.as_str() {
        FILTER_FAN_CLUB => chat.user.is_fan(),
        FILTER_ALL => true,
        other => {
            debug!(filter = %other, "Unknown TTS filter type, comment ignored");
            false
        }
    };

    admitted.then(|| render_template(template, chat))
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{(user|comment)\}").expect("placeholder pattern is valid"))
}

/// Fill `{user}` and `{comment}` in one pass, so substituted text is never rescanned.
fn render_template(template: &str, chat: &ChatEvent) -> String {
    placeholder_pattern()
        .replace_all(template, |caps: &Captures| match &caps[1] {
            "user" => chat.user.display_name().to_string(),
            _ => chat.comment.clone(),
        })
        .into_owned()
}

/// Cut `text` to at most `max_chars` characters.
fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => &text[..byte_index],
        None => text,
    }
}

pub struct CommentQueue {
    entries: Mutex<VecDeque<String>>,
    capacity: AtomicUsize,
    max_chars: AtomicUsize,
}

impl CommentQueue {
    pub fn new(capacity: usize, max_chars: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: AtomicUsize::new(capacity),
            max_chars: AtomicUsize::new(max_chars),
        }
    }

    pub fn set_limits(&self, capacity: usize, max_chars: usize) {
        self.capacity.store(capacity, Ordering::Relaxed);
        self.max_chars.store(max_chars, Ordering::Relaxed);
    }

    /// Truncate and append `text`; false when the queue is full.
    pub fn enqueue(&self, text: &str) -> bool {
        let text = truncate_chars(text, self.max_chars.load(Ordering::Relaxed));
        let capacity = self.capacity.load(Ordering::Relaxed);

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() >= capacity {
            debug!(capacity = capacity, "Comment queue full, dropping comment");
            return false;
        }

        entries.push_back(text.to_string());
        true
    }

    pub fn pop(&self) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Background worker moving comments from the queue to the speech sink.
pub struct CommentDrain {
    queue: Arc<CommentQueue>,
    sink: Arc<dyn SpeechSink>,
    config: Arc<ConfigStore>,
    metrics: Arc<Metrics>,
    interval: Duration,
    task: OnceLock<JoinHandle<()>>,
}

impl CommentDrain {
    pub fn new(
        queue: Arc<CommentQueue>,
        sink: Arc<dyn SpeechSink>,
        config: Arc<ConfigStore>,
        metrics: Arc<Metrics>,
        interval: Duration,
    ) -> Self {
        Self {
            queue,
            sink,
            config,
            metrics,
            interval,
            task: OnceLock::new(),
        }
    }

    /// Spawn the drain loop. Only the first call starts a task; later calls
    /// return false and leave the running loop alone.
    pub fn start(self: &Arc<Self>, shutdown: ShutdownSignal) -> bool {
        let mut started = false;
        self.task.get_or_init(|| {
            started = true;
            let drain = self.clone();
            tokio::spawn(async move { drain.run(shutdown).await })
        });

        if !started {
            debug!("Comment drain already running");
        }
        started
    }

    pub fn is_running(&self) -> bool {
        self.task.get().is_some_and(|task| !task.is_finished())
    }

    async fn run(&self, shutdown: ShutdownSignal) {
        info!(interval_ms = self.interval.as_millis() as u64, "Comment drain started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.drain_one().await,
            }
        }

        info!(remaining = self.queue.len(), "Comment drain stopped");
    }

    /// Speak the oldest queued comment, if any.
    pub async fn drain_one(&self) {
        let Some(text) = self.queue.pop() else {
            return;
        };

        let volume = self.config.current().document.volume;
        debug!(text = %text, "Speaking comment");

        match self.sink.speak(&text, volume).await {
            Ok(()) => Metrics::incr(&self.metrics.comments_spoken),
            Err(e) => {
                Metrics::incr(&self.metrics.speech_failed);
                warn!(sink = %self.sink.name(), error = %e, "Speech failed, comment dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Viewer;
    use crate::sinks::testing::RecordingSpeechSink;
    use crate::snapshot::Snapshot;
    use serde_json::json;

    const TEMPLATE: &str = "{user} says {comment}";

    fn chat(viewer: Viewer, comment: &str) -> ChatEvent {
        ChatEvent {
            comment: comment.to_string(),
            user: viewer,
        }
    }

    fn tts(kind: &str) -> TtsConfig {
        TtsConfig {
            enabled: true,
            kind: kind.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_fan_club_filter() {
        let fan = Viewer::new("steve").with_badge("fans_badge_icon_lv2");
        let viewer = Viewer::new("alex");

        assert_eq!(
            speakable_comment(&chat(fan, "hello"), &tts(FILTER_FAN_CLUB), TEMPLATE),
            Some("steve says hello".to_string())
        );
        assert_eq!(
            speakable_comment(&chat(viewer, "hello"), &tts(FILTER_FAN_CLUB), TEMPLATE),
            None
        );
    }

    #[test]
    fn test_all_filter_and_disabled() {
        let viewer = Viewer::new("alex");
        assert!(speakable_comment(&chat(viewer.clone(), "hi"), &tts(FILTER_ALL), TEMPLATE).is_some());

        let mut disabled = tts(FILTER_ALL);
        disabled.enabled = false;
        assert!(speakable_comment(&chat(viewer.clone(), "hi"), &disabled, TEMPLATE).is_none());
        assert!(speakable_comment(&chat(viewer.clone(), "  "), &tts(FILTER_ALL), TEMPLATE).is_none());
        assert!(speakable_comment(&chat(viewer, "hi"), &tts("subscribers"), TEMPLATE).is_none());
    }

    #[test]
    fn test_placeholders_inside_names_are_left_alone() {
        let viewer = Viewer::new("{comment}");
        assert_eq!(
            speakable_comment(&chat(viewer, "hi"), &tts(FILTER_ALL), TEMPLATE),
            Some("{comment} says hi".to_string())
        );

        let viewer = Viewer::new("alex");
        assert_eq!(
            speakable_comment(&chat(viewer, "ask {user}"), &tts(FILTER_ALL), "{comment} from {user}"),
            Some("ask {user} from alex".to_string())
        );
    }

    #[test]
    fn test_truncation_at_enqueue() {
        let queue = CommentQueue::new(5, 5);
        assert!(queue.enqueue("hello world"));
        assert_eq!(queue.pop(), Some("hello".to_string()));
    }

    #[test]
    fn test_truncation_counts_characters() {
        let queue = CommentQueue::new(5, 3);
        queue.enqueue("çğüş");
        assert_eq!(queue.pop(), Some("çğü".to_string()));
        assert_eq!(truncate_chars("ab", 5), "ab");
        assert_eq!(truncate_chars("abc", 0), "");
    }

    #[test]
    fn test_overflow_drops_newest() {
        let queue = CommentQueue::new(2, 100);
        assert!(queue.enqueue("one"));
        assert!(queue.enqueue("two"));
        assert!(!queue.enqueue("three"));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(), Some("one".to_string()));
        assert_eq!(queue.pop(), Some("two".to_string()));
        assert!(queue.is_empty());
    }

    fn drain_with(sink: Arc<RecordingSpeechSink>, queue: Arc<CommentQueue>) -> Arc<CommentDrain> {
        let snapshot = Snapshot::from_value(json!({"volume": 0.7})).unwrap();
        Arc::new(CommentDrain::new(
            queue,
            sink,
            Arc::new(ConfigStore::with_snapshot("unused.json", snapshot)),
            Arc::new(Metrics::new()),
            Duration::from_millis(200),
        ))
    }

    #[tokio::test]
    async fn test_drain_one_uses_snapshot_volume() {
        let sink = Arc::new(RecordingSpeechSink::default());
        let queue = Arc::new(CommentQueue::new(5, 100));
        queue.enqueue("hello");

        let drain = drain_with(sink.clone(), queue.clone());
        drain.drain_one().await;
        drain.drain_one().await;

        assert_eq!(*sink.spoken.lock().unwrap(), vec![("hello".to_string(), 0.7)]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_failed_speech_is_not_requeued() {
        let sink = Arc::new(RecordingSpeechSink {
            fail: true,
            ..Default::default()
        });
        let queue = Arc::new(CommentQueue::new(5, 100));
        queue.enqueue("hello");

        let drain = drain_with(sink.clone(), queue.clone());
        drain.drain_one().await;

        assert_eq!(sink.spoken(), vec!["hello"]);
        assert!(queue.is_empty());
        assert_eq!(drain.metrics.speech_failed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_pops_one_per_tick() {
        let sink = Arc::new(RecordingSpeechSink::default());
        let queue = Arc::new(CommentQueue::new(10, 100));
        for text in ["a", "b", "c", "d", "e"] {
            queue.enqueue(text);
        }

        let drain = drain_with(sink.clone(), queue.clone());
        let shutdown = ShutdownSignal::new();
        assert!(drain.start(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(sink.spoken(), vec!["a", "b"]);
        assert_eq!(queue.len(), 3);
        shutdown.trigger();
    }

    #[tokio::test]
    async fn test_second_start_is_ignored() {
        let sink = Arc::new(RecordingSpeechSink::default());
        let drain = drain_with(sink, Arc::new(CommentQueue::new(5, 100)));
        let shutdown = ShutdownSignal::new();

        assert!(drain.start(shutdown.clone()));
        assert!(!drain.start(shutdown.clone()));
        assert!(drain.is_running());

        shutdown.trigger();
    }

    #[tokio::test]
    async fn test_drain_stops_on_shutdown() {
        let sink = Arc::new(RecordingSpeechSink::default());
        let drain = drain_with(sink, Arc::new(CommentQueue::new(5, 100)));
        let shutdown = ShutdownSignal::new();
        drain.start(shutdown.clone());

        shutdown.trigger();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!drain.is_running());
    }
}
