//! Log Sink - commands and speech written to the log only.
//!
//! Selected by `[sinks] dry_run = true`, so the rest of the pipeline behaves
//! exactly as it would live without touching the game or the speaker.

use super::{CommandSink, SinkError, SpeechSink};
use async_trait::async_trait;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct LogSink;

impl LogSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, command: &str) -> Result<(), SinkError> {
        info!(command = %command, "[dry-run] Command");
        Ok(())
    }
}

#[async_trait]
impl SpeechSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn speak(&self, text: &str, volume: f64) -> Result<(), SinkError> {
        info!(volume = volume, "[dry-run] Speak: {}", text);
        Ok(())
    }
}
