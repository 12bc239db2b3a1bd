//! # LiveTok
//!
//! Turns live-stream interactions into game commands, on-screen media and
//! speech.
//!
//! ## Architecture
//!
//! ```text
//! Bridge -> /api/v1/events -> StreamTracker -> EventPipeline
//!                                               |-- chat --------> CommentQueue -> CommentDrain -> SpeechSink
//!                                               '-- gift/coin ---> ActionResolver -> CommandSink
//!                                                                                 '-> MediaQueue <- GET /data/{screen}
//! ```
//!
//! ## Modules
//!
//! - [`event`]: Live event types
//! - [`config`]: Process settings (TOML)
//! - [`snapshot`]: Reloadable rule/action document and its store
//! - [`liveness`]: Destination heartbeats
//! - [`media_queue`]: Per-destination media dispatch
//! - [`comments`]: Comment queue and its drain worker
//! - [`sinks`]: Command and speech sinks
//! - [`resolver`]: Rule matching and action firing
//! - [`source`]: Event sources and the tracked stream
//! - [`app`]: Application context
//! - [`server`]: HTTP routes

pub mod app;
pub mod comments;
pub mod config;
pub mod event;
pub mod liveness;
pub mod media_queue;
pub mod metrics;
pub mod resolver;
pub mod server;
pub mod shutdown;
pub mod sinks;
pub mod snapshot;
pub mod source;

// Re-export commonly used types at crate root
pub use app::AppContext;
pub use event::LiveEvent;
pub use resolver::{ActionResolver, ResolveReport};
pub use sinks::{CommandSink, SinkError, SpeechSink};
pub use snapshot::{ConfigStore, Snapshot};
