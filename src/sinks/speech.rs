//! Speech Sink - text-to-speech over a local JSON POST.
//!
//! Posts `{"text": ..., "volume": ...}` to the speech service, which plays
//! the audio before answering. The timeout therefore bounds playback too.

use super::{transport_error, SinkError, SpeechSink};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

/// Default bound on one speech request, playback included
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct HttpSpeechSink {
    url: String,
    client: Client,
    timeout: Duration,
}

impl HttpSpeechSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: Client::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl SpeechSink for HttpSpeechSink {
    fn name(&self) -> &str {
        "http-speech"
    }

    async fn speak(&self, text: &str, volume: f64) -> Result<(), SinkError> {
        if text.is_empty() {
            return Ok(());
        }

        debug!(url = %self.url, chars = text.chars().count(), "Sending speech");

        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&json!({ "text": text, "volume": volume }))
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout.as_millis() as u64))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(SinkError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            })
        }
    }
}
