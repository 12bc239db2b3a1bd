//! Outbound sinks.
//!
//! Sinks are the side effects of the engine. The [`CommandSink`] receives
//! game commands produced by fired actions; the [`SpeechSink`] receives chat
//! text drained from the comment queue. Both are best-effort: a failure is
//! returned to the caller for logging and never retried.
//!
//! ## Built-in Sinks
//!
//! - [`ServerTapSink`]: form POST to a ServerTap exec endpoint
//! - [`HttpSpeechSink`]: JSON POST to a local text-to-speech service
//! - [`LogSink`]: logs instead of sending (`dry_run`); an empty `server_url`
//!   makes [`ServerTapSink`] fail each command instead
//!
//! ## Custom Sinks
//!
//! ```rust,ignore
//! use livetok::sinks::{CommandSink, SinkError};
//! use async_trait::async_trait;
//!
//! struct RconSink;
//!
//! #[async_trait]
//! impl CommandSink for RconSink {
//!     fn name(&self) -> &str {
//!         "rcon"
//!     }
//!
//!     async fn send(&self, command: &str) -> Result<(), SinkError> {
//!         Ok(())
//!     }
//! }
//! ```

pub mod log;
pub mod servertap;
pub mod speech;

use async_trait::async_trait;
use thiserror::Error;

pub use log::LogSink;
pub use servertap::ServerTapSink;
pub use speech::HttpSpeechSink;

/// Errors that can occur while delivering to a sink.
#[derive(Error, Debug)]
pub enum SinkError {
    /// The request did not finish within the sink's bound
    #[error("sink timed out after {0}ms")]
    Timeout(u64),

    /// Transport failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The remote answered with a non-success status
    #[error("remote returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// Generic sink failure
    #[error("sink failed: {0}")]
    Failed(String),
}

/// Receives game commands, one string at a time.
#[async_trait]
pub trait CommandSink: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, command: &str) -> Result<(), SinkError>;
}

/// Receives text to read out loud.
#[async_trait]
pub trait SpeechSink: Send + Sync {
    fn name(&self) -> &str;

    async fn speak(&self, text: &str, volume: f64) -> Result<(), SinkError>;
}

/// Map a reqwest failure, keeping timeouts distinct.
pub(crate) fn transport_error(e: reqwest::Error, timeout_ms: u64) -> SinkError {
    if e.is_timeout() {
        SinkError::Timeout(timeout_ms)
    } else {
        SinkError::Http(e)
    }
}
