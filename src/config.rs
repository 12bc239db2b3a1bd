//! Process settings for LiveTok.
//!
//! Loads settings from a TOML file with environment variable substitution.
//! These are the knobs that stay fixed for the lifetime of the process; the
//! reloadable rule/action document lives in [`crate::snapshot`].
//!
//! # Example
//!
//! ```toml
//! [server]
//! port = 3000
//! public_url = "http://localhost:3000"
//! max_upload_bytes = 4194304
//!
//! [paths]
//! snapshot = "data.json"
//! media_dir = "public/media"
//!
//! [sinks]
//! tts_url = "${TTS_URL}"
//! command_timeout_ms = 3000
//! dry_run = false
//!
//! [comments]
//! interval_ms = 200
//! template = "{user} says {comment}"
//! ```

use regex::Regex;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration errors, for both the TOML settings and the JSON snapshot.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Root settings structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServerSettings {
    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub paths: PathsSection,

    #[serde(default)]
    pub sinks: SinksSection,

    #[serde(default)]
    pub comments: CommentsSection,
}

/// HTTP server settings
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSection {
    /// Falls back to the snapshot's `port`, then 3000.
    #[serde(default)]
    pub port: Option<u16>,

    /// Base used when returning URLs of uploaded media.
    #[serde(default)]
    pub public_url: Option<String>,

    /// Largest request body accepted by `/upload`.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: None,
            public_url: None,
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

fn default_max_upload_bytes() -> usize {
    4 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsSection {
    #[serde(default = "default_snapshot_path")]
    pub snapshot: PathBuf,

    #[serde(default = "default_media_dir")]
    pub media_dir: PathBuf,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            snapshot: default_snapshot_path(),
            media_dir: default_media_dir(),
        }
    }
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("data.json")
}

fn default_media_dir() -> PathBuf {
    PathBuf::from("public/media")
}

/// Outbound sink settings
#[derive(Debug, Deserialize, Clone)]
pub struct SinksSection {
    #[serde(default = "default_tts_url")]
    pub tts_url: String,

    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    #[serde(default = "default_tts_timeout_ms")]
    pub tts_timeout_ms: u64,

    /// Log commands and speech instead of sending them.
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for SinksSection {
    fn default() -> Self {
        Self {
            tts_url: default_tts_url(),
            command_timeout_ms: default_command_timeout_ms(),
            tts_timeout_ms: default_tts_timeout_ms(),
            dry_run: false,
        }
    }
}

fn default_tts_url() -> String {
    "http://127.0.0.1:8000/speak".to_string()
}

fn default_command_timeout_ms() -> u64 {
    3000
}

fn default_tts_timeout_ms() -> u64 {
    30000
}

/// Comment drain settings
#[derive(Debug, Deserialize, Clone)]
pub struct CommentsSection {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// `{user}` and `{comment}` are replaced before truncation.
    #[serde(default = "default_template")]
    pub template: String,
}

impl Default for CommentsSection {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            template: default_template(),
        }
    }
}

fn default_interval_ms() -> u64 {
    200
}

fn default_template() -> String {
    "{user} says {comment}".to_string()
}

impl ServerSettings {
    /// Load settings from the default path or the LIVETOK_CONFIG env var.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var("LIVETOK_CONFIG").unwrap_or_else(|_| "config/livetok.toml".to_string());

        Self::load_from(&config_path)
    }

    /// Load settings from a specific path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(
                path = %path.display(),
                "Settings file not found, using defaults"
            );
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading settings");

        let content = fs::read_to_string(path)?;
        let content = substitute_env_vars(&content);

        debug!("Parsing TOML settings");
        let settings: ServerSettings = toml::from_str(&content)?;

        settings.validate()?;

        info!(
            snapshot = %settings.paths.snapshot.display(),
            media_dir = %settings.paths.media_dir.display(),
            tts_url = %settings.sinks.tts_url,
            "Settings loaded"
        );

        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sinks.tts_url.contains("${") {
            warn!(
                url = %self.sinks.tts_url,
                "TTS URL contains unsubstituted environment variable"
            );
        } else if !self.sinks.tts_url.starts_with("http://")
            && !self.sinks.tts_url.starts_with("https://")
        {
            return Err(ConfigError::ValidationError(
                "sinks.tts_url must start with http:// or https://".to_string(),
            ));
        }

        if self.sinks.command_timeout_ms == 0 || self.sinks.tts_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "sink timeouts must be greater than zero".to_string(),
            ));
        }

        if self.server.max_upload_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "server.max_upload_bytes must be greater than zero".to_string(),
            ));
        }

        if self.comments.interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "comments.interval_ms must be greater than zero".to_string(),
            ));
        }

        if !self.comments.template.contains("{comment}") {
            warn!(
                template = %self.comments.template,
                "Comment template has no {{comment}} placeholder"
            );
        }

        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.sinks.command_timeout_ms)
    }

    pub fn tts_timeout(&self) -> Duration {
        Duration::from_millis(self.sinks.tts_timeout_ms)
    }

    pub fn comment_interval(&self) -> Duration {
        Duration::from_millis(self.comments.interval_ms)
    }

    /// Port to bind, preferring the settings file over the snapshot value.
    pub fn resolve_port(&self, snapshot_port: Option<u16>) -> u16 {
        self.server.port.or(snapshot_port).unwrap_or(3000)
    }

    /// Base URL for links to uploaded media.
    pub fn public_url(&self, port: u16) -> String {
        match &self.server.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://localhost:{}", port),
        }
    }
}

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is valid")
    })
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    env_var_pattern()
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            match env::var(var_name) {
                Ok(value) => value,
                Err(_) => {
                    debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                    caps[0].to_string()
                }
            }
        })
        .to_string()
}
