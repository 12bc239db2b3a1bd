//! Live event sources and the tracked stream.
//!
//! An [`EventSource`] hands out one ordered [`EventStream`] per tracked
//! identity. The [`StreamTracker`] owns the single tracked stream of the
//! process: starting a new one first closes the previous subscription, and
//! a listener task feeds each event, fully handled one at a time, to an
//! [`EventHandler`].
//!
//! The built-in [`IngestSource`] is fed over HTTP by an external bridge
//! that holds the actual live-stream connection.
//!
//! ```text
//! bridge --POST /api/v1/events--> IngestSource --EventStream--> listener --> EventHandler
//! ```

use crate::event::LiveEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Events buffered between the ingest endpoint and the listener.
const DEFAULT_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("identity must not be empty")]
    InvalidIdentity,

    #[error("source rejected '{identity}': {reason}")]
    Rejected { identity: String, reason: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IngestError {
    #[error("no stream is being tracked")]
    NotTracking,

    #[error("tracked stream closed")]
    Closed,
}

/// Identifies one tracked subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamHandle {
    pub id: Uuid,
    pub identity: String,
    pub started_at: DateTime<Utc>,
}

impl StreamHandle {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity: identity.into(),
            started_at: Utc::now(),
        }
    }
}

/// Ordered, non-restartable events of one tracked identity.
pub struct EventStream {
    handle: StreamHandle,
    receiver: mpsc::Receiver<LiveEvent>,
}

impl EventStream {
    pub fn new(handle: StreamHandle, receiver: mpsc::Receiver<LiveEvent>) -> Self {
        Self { handle, receiver }
    }

    pub fn handle(&self) -> &StreamHandle {
        &self.handle
    }

    /// Next event, or `None` once the source closed the subscription.
    pub async fn next(&mut self) -> Option<LiveEvent> {
        self.receiver.recv().await
    }
}

#[async_trait]
pub trait EventSource: Send + Sync {
    fn name(&self) -> &str;

    async fn track(&self, identity: &str) -> Result<EventStream, TrackingError>;

    /// Release the subscription behind `handle`. Unknown handles are ignored.
    async fn close(&self, handle: &StreamHandle);
}

/// Consumer of tracked events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: LiveEvent);
}

/// Event source fed by [`IngestSource::push`].
pub struct IngestSource {
    current: Mutex<Option<(Uuid, mpsc::Sender<LiveEvent>)>>,
    buffer: usize,
}

impl IngestSource {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_BUFFER)
    }

    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            current: Mutex::new(None),
            buffer: buffer.max(1),
        }
    }

    /// Deliver `event` to the tracked stream, waiting if its buffer is full.
    pub async fn push(&self, event: LiveEvent) -> Result<(), IngestError> {
        let sender = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|(_, sender)| sender.clone())
            .ok_or(IngestError::NotTracking)?;

        sender.send(event).await.map_err(|_| IngestError::Closed)
    }

    pub fn is_tracking(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl Default for IngestSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSource for IngestSource {
    fn name(&self) -> &str {
        "ingest"
    }

    async fn track(&self, identity: &str) -> Result<EventStream, TrackingError> {
        let identity = identity.trim().trim_start_matches('@');
        if identity.is_empty() {
            return Err(TrackingError::InvalidIdentity);
        }

        let (sender, receiver) = mpsc::channel(self.buffer);
        let handle = StreamHandle::new(identity);

        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if current.is_some() {
            warn!("Tracking over an open subscription, previous sender dropped");
        }
        *current = Some((handle.id, sender));

        Ok(EventStream::new(handle, receiver))
    }

    async fn close(&self, handle: &StreamHandle) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref().is_some_and(|(id, _)| *id == handle.id) {
            *current = None;
            debug!(identity = %handle.identity, "Ingest subscription closed");
        }
    }
}

struct TrackedStream {
    handle: StreamHandle,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Owner of the single tracked stream.
pub struct StreamTracker {
    source: Arc<dyn EventSource>,
    handler: Arc<dyn EventHandler>,
    current: tokio::sync::Mutex<Option<TrackedStream>>,
}

impl StreamTracker {
    pub fn new(source: Arc<dyn EventSource>, handler: Arc<dyn EventHandler>) -> Self {
        Self {
            source,
            handler,
            current: tokio::sync::Mutex::new(None),
        }
    }

    /// Close the current stream, if any, then track `identity`.
    ///
    /// The previous listener finishes the event it is handling and exits.
    /// If tracking fails nothing is tracked afterwards.
    pub async fn start(&self, identity: &str) -> Result<StreamHandle, TrackingError> {
        let mut current = self.current.lock().await;

        if let Some(previous) = current.take() {
            Self::release(&*self.source, previous).await;
        }

        let stream = self.source.track(identity).await?;
        let handle = stream.handle().clone();
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(listen(stream, self.handler.clone(), stopped));

        info!(
            identity = %handle.identity,
            source = %self.source.name(),
            stream_id = %handle.id,
            "Tracking stream"
        );

        *current = Some(TrackedStream {
            handle: handle.clone(),
            stop,
            task,
        });
        Ok(handle)
    }

    /// Close the current stream; returns its handle if one was tracked.
    pub async fn stop(&self) -> Option<StreamHandle> {
        let previous = self.current.lock().await.take()?;
        let handle = previous.handle.clone();
        Self::release(&*self.source, previous).await;
        Some(handle)
    }

    /// Close the current stream and wait up to `grace` for its listener to
    /// finish the event in hand.
    pub async fn stop_within(&self, grace: Duration) -> Option<StreamHandle> {
        let previous = self.current.lock().await.take()?;
        let handle = previous.handle.clone();
        let listener = Self::release(&*self.source, previous).await;

        if tokio::time::timeout(grace, listener).await.is_err() {
            warn!(
                identity = %handle.identity,
                grace_ms = grace.as_millis() as u64,
                "Listener still busy after grace period, leaving it behind"
            );
        }
        Some(handle)
    }

    pub async fn current(&self) -> Option<StreamHandle> {
        self.current.lock().await.as_ref().map(|t| t.handle.clone())
    }

    async fn release(source: &dyn EventSource, tracked: TrackedStream) -> JoinHandle<()> {
        source.close(&tracked.handle).await;
        // The listener may already be gone.
        let _ = tracked.stop.send(());
        info!(
            identity = %tracked.handle.identity,
            stream_id = %tracked.handle.id,
            listener_done = tracked.task.is_finished(),
            "Stream released"
        );
        tracked.task
    }
}

async fn listen(
    mut stream: EventStream,
    handler: Arc<dyn EventHandler>,
    mut stop: oneshot::Receiver<()>,
) {
    let identity = stream.handle().identity.clone();
    let mut handled: u64 = 0;

    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            next = stream.next() => match next {
                Some(event) => {
                    handler.handle(event).await;
                    handled += 1;
                }
                None => break,
            },
        }
    }

    info!(identity = %identity, events = handled, "Stream listener finished");
}
