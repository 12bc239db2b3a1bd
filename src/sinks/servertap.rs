//! ServerTap Sink - game commands over an HTTP form POST.
//!
//! The [`ServerTapSink`] sends each command as `command=<text>` to the exec
//! endpoint named by the snapshot's `server_url`, authenticated with the
//! snapshot's shared `key` in the `x-servertap-key` cookie. Target and key
//! are read per call, so a config reload applies to the next command.
//!
//! # Example
//!
//! ```rust,ignore
//! use livetok::sinks::ServerTapSink;
//! use std::time::Duration;
//!
//! let sink = ServerTapSink::new(config_store).with_timeout(Duration::from_secs(3));
//! sink.send("say hello").await?;
//! ```

use super::{transport_error, CommandSink, SinkError};
use crate::snapshot::ConfigStore;
use async_trait::async_trait;
use reqwest::header::COOKIE;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default bound on one command request
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Cookie carrying the shared key
const KEY_COOKIE: &str = "x-servertap-key";

pub struct ServerTapSink {
    config: Arc<ConfigStore>,

    /// HTTP client (reused for connection pooling)
    client: Client,

    timeout: Duration,
}

impl ServerTapSink {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self {
            config,
            client: Client::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl CommandSink for ServerTapSink {
    fn name(&self) -> &str {
        "servertap"
    }

    async fn send(&self, command: &str) -> Result<(), SinkError> {
        let snapshot = self.config.current();
        let url = &snapshot.document.server_url;
        if url.is_empty() {
            return Err(SinkError::Failed("no server_url configured".to_string()));
        }

        debug!(url = %url, command = %command, "Sending command");

        let timeout_ms = self.timeout.as_millis() as u64;
        let response = self
            .client
            .post(url)
            .timeout(self.timeout)
            .header(COOKIE, format!("{}={}", KEY_COOKIE, snapshot.document.key))
            .form(&[("command", command)])
            .send()
            .await
            .map_err(|e| transport_error(e, timeout_ms))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        warn!(
            url = %url,
            status = %status,
            body = %body,
            "Command server returned an error"
        );

        Err(SinkError::Status {
            status: status.as_u16(),
            body,
        })
    }
}
