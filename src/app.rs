//! Application context.
//!
//! Every shared component is constructed once here and handed out by
//! reference. Reloads go through [`AppContext::reload`] so the queue limits
//! follow the snapshot that was just swapped in.

use crate::comments::{speakable_comment, CommentDrain, CommentQueue};
use crate::config::{ConfigError, ServerSettings};
use crate::event::{ChatEvent, LiveEvent};
use crate::liveness::LivenessTracker;
use crate::media_queue::{DispatchPayload, MediaQueue};
use crate::metrics::Metrics;
use crate::resolver::ActionResolver;
use crate::shutdown::ShutdownSignal;
use crate::sinks::{CommandSink, HttpSpeechSink, LogSink, ServerTapSink, SinkError, SpeechSink};
use crate::snapshot::{ConfigStore, Snapshot};
use crate::source::{
    EventHandler, IngestError, IngestSource, StreamHandle, StreamTracker, TrackingError,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// Routes each tracked event: chat to the comment queue, the rest to the
/// resolver.
pub struct EventPipeline {
    resolver: ActionResolver,
    comments: Arc<CommentQueue>,
    config: Arc<ConfigStore>,
    metrics: Arc<Metrics>,
    template: String,
}

impl EventPipeline {
    pub async fn process(&self, event: &LiveEvent) {
        Metrics::incr(&self.metrics.events_received);

        match event {
            LiveEvent::Chat(chat) => {
                self.queue_comment(chat);
            }
            _ => {
                self.resolver.resolve(event).await;
            }
        }
    }

    /// Queue `chat` for speech if the TTS filter admits it.
    fn queue_comment(&self, chat: &ChatEvent) -> bool {
        let snapshot = self.config.current();
        let Some(text) =
            speakable_comment(chat, &snapshot.document.events.text_to_speech, &self.template)
        else {
            return false;
        };

        if self.comments.enqueue(&text) {
            Metrics::incr(&self.metrics.comments_queued);
            true
        } else {
            Metrics::incr(&self.metrics.comments_dropped);
            false
        }
    }
}

#[async_trait]
impl EventHandler for EventPipeline {
    async fn handle(&self, event: LiveEvent) {
        self.process(&event).await;
    }
}

pub struct AppContext {
    pub settings: ServerSettings,
    pub config: Arc<ConfigStore>,
    pub liveness: Arc<LivenessTracker>,
    pub media: Arc<MediaQueue>,
    pub comments: Arc<CommentQueue>,
    pub drain: Arc<CommentDrain>,
    pub commands: Arc<dyn CommandSink>,
    pub pipeline: Arc<EventPipeline>,
    pub ingest: Arc<IngestSource>,
    pub tracker: StreamTracker,
    pub metrics: Arc<Metrics>,
    pub shutdown: ShutdownSignal,
}

impl AppContext {
    /// Build the context with the sinks chosen by `settings`.
    pub fn new(settings: ServerSettings, config: ConfigStore) -> Self {
        let config = Arc::new(config);

        let (commands, speech): (Arc<dyn CommandSink>, Arc<dyn SpeechSink>) =
            if settings.sinks.dry_run {
                info!("Dry run: commands and speech are only logged");
                let sink = Arc::new(LogSink::new());
                let commands: Arc<dyn CommandSink> = sink.clone();
                let speech: Arc<dyn SpeechSink> = sink;
                (commands, speech)
            } else {
                let commands: Arc<dyn CommandSink> = Arc::new(
                    ServerTapSink::new(config.clone()).with_timeout(settings.command_timeout()),
                );
                let speech: Arc<dyn SpeechSink> = Arc::new(
                    HttpSpeechSink::new(settings.sinks.tts_url.clone())
                        .with_timeout(settings.tts_timeout()),
                );
                (commands, speech)
            };

        Self::with_sinks(settings, config, commands, speech)
    }

    pub fn with_sinks(
        settings: ServerSettings,
        config: Arc<ConfigStore>,
        commands: Arc<dyn CommandSink>,
        speech: Arc<dyn SpeechSink>,
    ) -> Self {
        let snapshot = config.current();
        let limits = &snapshot.document;

        let metrics = Arc::new(Metrics::new());
        let liveness = Arc::new(LivenessTracker::new());
        let media = Arc::new(MediaQueue::new(
            limits.max_media_queue_length,
            liveness.clone(),
        ));
        let comments = Arc::new(CommentQueue::new(
            limits.max_comment_queue_length,
            limits.max_chars_tts,
        ));

        let drain = Arc::new(CommentDrain::new(
            comments.clone(),
            speech,
            config.clone(),
            metrics.clone(),
            settings.comment_interval(),
        ));

        let pipeline = Arc::new(EventPipeline {
            resolver: ActionResolver::new(
                config.clone(),
                liveness.clone(),
                media.clone(),
                commands.clone(),
                metrics.clone(),
            ),
            comments: comments.clone(),
            config: config.clone(),
            metrics: metrics.clone(),
            template: settings.comments.template.clone(),
        });

        let ingest = Arc::new(IngestSource::new());
        let tracker = StreamTracker::new(ingest.clone(), pipeline.clone());

        Self {
            settings,
            config,
            liveness,
            media,
            comments,
            drain,
            commands,
            pipeline,
            ingest,
            tracker,
            metrics,
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Start the comment drain. Later calls are no-ops.
    pub fn start(&self) -> bool {
        self.drain.start(self.shutdown.clone())
    }

    /// Re-read the snapshot from disk; on error the prior one stays active.
    pub fn reload(&self) -> Result<Arc<Snapshot>, ConfigError> {
        self.config
            .reload_then(|snapshot| self.apply_limits(snapshot))
    }

    /// Validate and persist a new document, then swap it in.
    pub fn replace_config(&self, document: Value) -> Result<Arc<Snapshot>, ConfigError> {
        self.config
            .replace_document_then(document, |snapshot| self.apply_limits(snapshot))
    }

    fn apply_limits(&self, snapshot: &Snapshot) {
        let document = &snapshot.document;
        self.media.set_capacity(document.max_media_queue_length);
        self.comments
            .set_limits(document.max_comment_queue_length, document.max_chars_tts);

        info!(
            rules = snapshot.rules.len(),
            media_capacity = document.max_media_queue_length,
            comment_capacity = document.max_comment_queue_length,
            max_chars_tts = document.max_chars_tts,
            "Snapshot applied"
        );
    }

    /// Destination poll: heartbeat plus at most one payload.
    pub fn poll(&self, destination: &str) -> Option<DispatchPayload> {
        let payload = self.media.dequeue_for(destination);
        if let Some(payload) = &payload {
            Metrics::incr(&self.metrics.media_delivered);
            debug!(destination = %destination, action_id = %payload.action_id, "Media delivered");
        }
        payload
    }

    pub async fn start_tracking(&self, identity: &str) -> Result<StreamHandle, TrackingError> {
        self.tracker.start(identity).await
    }

    pub async fn stop_tracking(&self) -> Option<StreamHandle> {
        self.tracker.stop().await
    }

    /// Feed one event into the tracked stream.
    pub async fn ingest(&self, event: LiveEvent) -> Result<(), IngestError> {
        self.ingest.push(event).await
    }

    /// Send a manual command outside of any rule.
    pub async fn send_command(&self, command: &str) -> Result<(), SinkError> {
        let result = self.commands.send(command).await;
        match &result {
            Ok(()) => Metrics::incr(&self.metrics.commands_sent),
            Err(_) => Metrics::incr(&self.metrics.commands_failed),
        }
        result
    }

    /// Stop the drain and release the tracked stream, giving its listener
    /// up to the shutdown grace period to finish the event in hand.
    pub async fn close(&self) {
        self.shutdown.trigger();
        let grace = self.shutdown.grace_period();
        if let Some(handle) = self.tracker.stop_within(grace).await {
            info!(identity = %handle.identity, "Tracked stream closed on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Viewer;
    use crate::sinks::testing::{RecordingCommandSink, RecordingSpeechSink};
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct Harness {
        app: AppContext,
        commands: Arc<RecordingCommandSink>,
        _dir: tempfile::TempDir,
    }

    fn document() -> Value {
        json!({
            "max_chars_tts": 12,
            "max_comment_que_length": 2,
            "max_media_que_length": 1,
            "events": {
                "specifiedGift": [{"gift_name": "Rose", "action_id": ["a1"], "enabled": true}],
                "textToSpeech": {"enabled": true, "type": "all"}
            },
            "actions": {
                "a1": {
                    "screen": "main",
                    "commands": ["say hi"],
                    "play_media": {"type": "video", "media_path": "rose.mp4"}
                }
            }
        })
    }

    fn harness(document: Value) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        std::fs::write(&path, document.to_string()).unwrap();

        let commands = Arc::new(RecordingCommandSink::default());
        let app = AppContext::with_sinks(
            ServerSettings::default(),
            Arc::new(ConfigStore::load(&path).unwrap()),
            commands.clone(),
            Arc::new(RecordingSpeechSink::default()),
        );

        Harness {
            app,
            commands,
            _dir: dir,
        }
    }

    fn rose() -> LiveEvent {
        LiveEvent::gift(Viewer::new("steve"), "rose", 1)
    }

    #[test]
    fn test_limits_come_from_snapshot() {
        let h = harness(document());
        assert_eq!(h.app.media.capacity(), 1);

        h.app.comments.enqueue("a very long comment");
        assert_eq!(h.app.comments.pop().unwrap().chars().count(), 12);
    }

    #[tokio::test]
    async fn test_chat_goes_to_comment_queue() {
        let h = harness(document());

        for text in ["one", "two", "three"] {
            h.app.pipeline.process(&LiveEvent::chat(Viewer::new("alex"), text)).await;
        }

        assert_eq!(h.app.comments.len(), 2);
        assert_eq!(h.app.comments.pop(), Some("alex says on".to_string()));
        assert_eq!(h.app.metrics.comments_dropped.load(Ordering::Relaxed), 1);
        assert_eq!(h.app.metrics.events_received.load(Ordering::Relaxed), 3);
        assert!(h.commands.sent().is_empty());
    }

    #[tokio::test]
    async fn test_gift_goes_to_resolver() {
        let h = harness(document());
        h.app.poll("main");

        h.app.pipeline.process(&rose()).await;

        assert_eq!(h.commands.sent(), vec!["say hi"]);
        let payload = h.app.poll("main").unwrap();
        assert_eq!(payload.media_path, "rose.mp4");
        assert_eq!(h.app.metrics.media_delivered.load(Ordering::Relaxed), 1);
        assert!(h.app.poll("main").is_none());
    }

    #[tokio::test]
    async fn test_reload_refreshes_limits() {
        let h = harness(document());

        let mut updated = document();
        updated["max_media_que_length"] = json!(4);
        updated["max_comment_que_length"] = json!(7);
        std::fs::write(h.app.config.path(), updated.to_string()).unwrap();

        h.app.reload().unwrap();
        assert_eq!(h.app.media.capacity(), 4);
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_limits() {
        let h = harness(document());
        std::fs::write(h.app.config.path(), "{ not json").unwrap();

        assert!(h.app.reload().is_err());
        assert_eq!(h.app.media.capacity(), 1);
        assert_eq!(h.app.config.current().rules.len(), 1);
    }

    #[tokio::test]
    async fn test_replace_config_applies_limits() {
        let h = harness(document());

        let mut updated = document();
        updated["max_media_que_length"] = json!(3);
        h.app.replace_config(updated).unwrap();
        assert_eq!(h.app.media.capacity(), 3);

        let mut invalid = document();
        invalid["events"]["coinCount"] = json!([{"min_coin": 9, "max_coin": 1, "enabled": true}]);
        assert!(h.app.replace_config(invalid).is_err());
        assert_eq!(h.app.media.capacity(), 3);
    }

    #[test]
    fn test_concurrent_replaces_leave_limits_matching_disk() {
        let h = harness(document());

        for _ in 0..200 {
            std::thread::scope(|scope| {
                for capacity in [1, 9] {
                    let app = &h.app;
                    scope.spawn(move || {
                        let mut updated = document();
                        updated["max_media_que_length"] = json!(capacity);
                        app.replace_config(updated).unwrap();
                    });
                }
            });

            let on_disk = h.app.config.raw_document().unwrap()["max_media_que_length"].clone();
            assert_eq!(on_disk, json!(h.app.config.current().document.max_media_queue_length));
            assert_eq!(on_disk, json!(h.app.media.capacity()));
        }
    }

    #[tokio::test]
    async fn test_ingest_requires_tracking() {
        let h = harness(document());
        assert_eq!(h.app.ingest(rose()).await, Err(IngestError::NotTracking));
    }

    #[tokio::test]
    async fn test_tracked_events_reach_resolver() {
        let h = harness(document());
        h.app.poll("main");

        h.app.start_tracking("streamer").await.unwrap();
        h.app.ingest(rose()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(h.commands.sent(), vec!["say hi"]);
        assert_eq!(h.app.media.len_for("main"), 1);

        assert_eq!(h.app.stop_tracking().await.unwrap().identity, "streamer");
    }

    #[tokio::test]
    async fn test_manual_command_counts() {
        let h = harness(document());
        h.app.send_command("time set day").await.unwrap();

        assert_eq!(h.commands.sent(), vec!["time set day"]);
        assert_eq!(h.app.metrics.commands_sent.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_dry_run_selects_log_sink() {
        // No server_url in the snapshot.
        let store = || ConfigStore::with_snapshot("unused.json", Snapshot::default());

        let live = AppContext::new(ServerSettings::default(), store());
        assert_eq!(live.commands.name(), "servertap");
        assert!(live.send_command("say hi").await.is_err());

        let mut settings = ServerSettings::default();
        settings.sinks.dry_run = true;
        let dry = AppContext::new(settings, store());
        assert_eq!(dry.commands.name(), "log");
        assert!(dry.send_command("say hi").await.is_ok());
    }

    #[tokio::test]
    async fn test_close_stops_drain_and_stream() {
        let h = harness(document());
        assert!(h.app.start());
        h.app.start_tracking("streamer").await.unwrap();

        h.app.close().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!h.app.drain.is_running());
        assert!(h.app.tracker.current().await.is_none());
    }

    struct StalledCommandSink;

    #[async_trait]
    impl CommandSink for StalledCommandSink {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn send(&self, _command: &str) -> Result<(), SinkError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_close_is_bounded_by_grace_period() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        std::fs::write(&path, document().to_string()).unwrap();

        let mut app = AppContext::with_sinks(
            ServerSettings::default(),
            Arc::new(ConfigStore::load(&path).unwrap()),
            Arc::new(StalledCommandSink),
            Arc::new(RecordingSpeechSink::default()),
        );
        app.shutdown = ShutdownSignal::with_grace_period(Duration::from_millis(50));

        app.poll("main");
        app.start_tracking("streamer").await.unwrap();
        app.ingest(rose()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let closed = tokio::time::timeout(Duration::from_secs(1), app.close()).await;

        assert!(closed.is_ok());
        assert!(app.tracker.current().await.is_none());
    }
}
