//! The reloadable rule/action document.
//!
//! A [`Snapshot`] is an immutable, validated view of the JSON config
//! document together with the [`RuleTable`] derived from it. The
//! [`ConfigStore`] owns the current snapshot and replaces it wholesale on
//! reload, so readers always see one complete document.
//!
//! # Document shape
//!
//! ```json
//! {
//!   "server_url": "http://localhost:4567/v1/server/exec",
//!   "key": "change-me",
//!   "max_media_que_length": 5,
//!   "events": {
//!     "specifiedGift": [{ "gift_name": "Rose", "action_id": ["a1"], "enabled": true }],
//!     "coinCount": [{ "min_coin": 10, "max_coin": 40, "action_id": ["a2"], "enabled": true }]
//!   },
//!   "actions": {
//!     "a1": { "screen": "main", "commands": ["say hi"], "play_media": { "type": "video", "media_path": "rose.mp4" } }
//!   }
//! }
//! ```

use crate::config::ConfigError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{info, warn};

fn default_volume() -> f64 {
    1.0
}

fn default_max_chars() -> usize {
    200
}

fn default_comment_capacity() -> usize {
    20
}

fn default_media_capacity() -> usize {
    10
}

// The config UI writes a cleared number field as `null`. These read it as
// the field's default instead of rejecting the document.

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn null_or<'de, D, T>(deserializer: D, default: fn() -> T) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_else(default))
}

fn volume_or_default<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    null_or(deserializer, default_volume)
}

fn max_chars_or_default<'de, D: Deserializer<'de>>(deserializer: D) -> Result<usize, D::Error> {
    null_or(deserializer, default_max_chars)
}

fn comment_capacity_or_default<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<usize, D::Error> {
    null_or(deserializer, default_comment_capacity)
}

fn media_capacity_or_default<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<usize, D::Error> {
    null_or(deserializer, default_media_capacity)
}

/// A trigger entry under `events` in the document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventConfig {
    #[serde(default)]
    pub gift_name: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub gift_id: i64,

    #[serde(default, rename = "action_id")]
    pub action_ids: Vec<String>,

    #[serde(default)]
    pub enabled: bool,

    #[serde(default, deserialize_with = "null_as_default")]
    pub min_coin: u64,

    #[serde(default, deserialize_with = "null_as_default")]
    pub max_coin: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TtsVoice {
    #[serde(default, rename = "type")]
    pub kind: String,
}

/// Which chat messages are read out loud.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TtsConfig {
    #[serde(default)]
    pub enabled: bool,

    /// `"fanClub"` or `"all"`
    #[serde(default, rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub voice: TtsVoice,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default, rename = "specifiedGift")]
    pub specified_gift: Vec<EventConfig>,

    #[serde(default, rename = "coinCount")]
    pub coin_count: Vec<EventConfig>,

    #[serde(default, rename = "textToSpeech")]
    pub text_to_speech: TtsConfig,

    #[serde(default)]
    pub follow: EventConfig,
}

/// Media an action asks a destination to display.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaSpec {
    #[serde(default, rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub media_path: String,

    /// Seconds, as written by the config UI
    #[serde(default)]
    pub max_duration: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub volume: f64,
}

/// A named bundle of commands and optional media.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Filled from the key of the `actions` map.
    #[serde(skip)]
    pub id: String,

    #[serde(default, rename = "screen")]
    pub destination: String,

    #[serde(default)]
    pub commands: Vec<String>,

    #[serde(default, rename = "play_media")]
    pub media: Option<MediaSpec>,

    #[serde(default)]
    pub skip_on_next_action: bool,

    #[serde(default)]
    pub show_user_info: bool,

    #[serde(default)]
    pub display_text: String,
}

impl Action {
    /// Media to enqueue, if the action declares a non-empty path.
    pub fn playable_media(&self) -> Option<&MediaSpec> {
        self.media.as_ref().filter(|m| !m.media_path.is_empty())
    }
}

/// The JSON config document as written to disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(default)]
    pub server_url: String,

    #[serde(default)]
    pub key: String,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub tiktok_username: String,

    #[serde(default = "default_volume", deserialize_with = "volume_or_default")]
    pub volume: f64,

    #[serde(default = "default_max_chars", deserialize_with = "max_chars_or_default")]
    pub max_chars_tts: usize,

    #[serde(
        default = "default_comment_capacity",
        deserialize_with = "comment_capacity_or_default",
        rename = "max_comment_que_length"
    )]
    pub max_comment_queue_length: usize,

    #[serde(
        default = "default_media_capacity",
        deserialize_with = "media_capacity_or_default",
        rename = "max_media_que_length"
    )]
    pub max_media_queue_length: usize,

    #[serde(default)]
    pub events: EventsConfig,

    #[serde(default)]
    pub actions: HashMap<String, Action>,
}

/// What a rule listens for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Gift name, stored lowercased for case-insensitive matching.
    Gift(String),
    /// Inclusive diamond range.
    CoinRange { min: u64, max: u64 },
    Follow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub trigger: Trigger,
    pub action_ids: Vec<String>,
    pub enabled: bool,
}

impl Rule {
    pub fn matches_gift(&self, gift_name: &str) -> bool {
        match &self.trigger {
            Trigger::Gift(name) => self.enabled && *name == gift_name.to_lowercase(),
            _ => false,
        }
    }

    pub fn matches_coins(&self, diamonds: u64) -> bool {
        match self.trigger {
            Trigger::CoinRange { min, max } => self.enabled && min <= diamonds && diamonds <= max,
            _ => false,
        }
    }
}

/// Trigger conditions mapped to ordered action ids.
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    gift_rules: Vec<Rule>,
    coin_rules: Vec<Rule>,
    follow_rule: Option<Rule>,
}

impl RuleTable {
    pub fn from_events(events: &EventsConfig) -> Self {
        let gift_rules = events
            .specified_gift
            .iter()
            .map(|e| Rule {
                trigger: Trigger::Gift(e.gift_name.to_lowercase()),
                action_ids: e.action_ids.clone(),
                enabled: e.enabled,
            })
            .collect();

        let coin_rules = events
            .coin_count
            .iter()
            .map(|e| Rule {
                trigger: Trigger::CoinRange {
                    min: e.min_coin,
                    max: e.max_coin,
                },
                action_ids: e.action_ids.clone(),
                enabled: e.enabled,
            })
            .collect();

        let follow_rule = Some(Rule {
            trigger: Trigger::Follow,
            action_ids: events.follow.action_ids.clone(),
            enabled: events.follow.enabled,
        })
        .filter(|r| !r.action_ids.is_empty());

        Self {
            gift_rules,
            coin_rules,
            follow_rule,
        }
    }

    /// Enabled gift rules whose name equals `gift_name`, ignoring case.
    pub fn gift_matches<'a>(&'a self, gift_name: &'a str) -> impl Iterator<Item = &'a Rule> {
        self.gift_rules.iter().filter(move |r| r.matches_gift(gift_name))
    }

    /// Enabled coin rules whose inclusive range contains `diamonds`.
    pub fn coin_matches(&self, diamonds: u64) -> impl Iterator<Item = &Rule> {
        self.coin_rules.iter().filter(move |r| r.matches_coins(diamonds))
    }

    pub fn follow(&self) -> Option<&Rule> {
        self.follow_rule.as_ref().filter(|r| r.enabled)
    }

    pub fn len(&self) -> usize {
        self.gift_rules.len() + self.coin_rules.len() + usize::from(self.follow_rule.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An immutable, validated config document plus its rule table.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub document: ConfigDocument,
    pub rules: RuleTable,
}

impl Snapshot {
    pub fn from_document(mut document: ConfigDocument) -> Result<Self, ConfigError> {
        for (id, action) in document.actions.iter_mut() {
            action.id = id.clone();
        }

        validate(&document)?;

        let rules = RuleTable::from_events(&document.events);
        Ok(Self { document, rules })
    }

    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        let document: ConfigDocument = serde_json::from_value(value)?;
        Self::from_document(document)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let document: ConfigDocument = serde_json::from_str(content)?;
        Self::from_document(document)
    }

    pub fn action(&self, id: &str) -> Option<&Action> {
        self.document.actions.get(id)
    }
}

fn validate(document: &ConfigDocument) -> Result<(), ConfigError> {
    if !document.server_url.is_empty()
        && !document.server_url.starts_with("http://")
        && !document.server_url.starts_with("https://")
    {
        return Err(ConfigError::ValidationError(
            "server_url must start with http:// or https://".to_string(),
        ));
    }

    for (index, rule) in document.events.coin_count.iter().enumerate() {
        if rule.min_coin > rule.max_coin {
            return Err(ConfigError::ValidationError(format!(
                "coinCount[{}] has min_coin {} above max_coin {}",
                index, rule.min_coin, rule.max_coin
            )));
        }
    }

    let events = &document.events;
    let referenced = events
        .specified_gift
        .iter()
        .chain(events.coin_count.iter())
        .chain(std::iter::once(&events.follow))
        .flat_map(|e| e.action_ids.iter());

    for action_id in referenced {
        if !document.actions.contains_key(action_id) {
            warn!(
                action_id = %action_id,
                "Rule references undefined action (will be skipped)"
            );
        }
    }

    for (id, action) in &document.actions {
        if action.destination.is_empty() {
            warn!(action_id = %id, "Action has no screen and will never be active");
        }
    }

    Ok(())
}

/// Owner of the current snapshot and the document path it came from.
///
/// Every change (reload, replace, swap) holds `write_lock` from reading or
/// writing the file until the new snapshot is published, so the file on
/// disk and the live snapshot never disagree.
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<Arc<Snapshot>>,
    write_lock: Mutex<()>,
}

impl ConfigStore {
    /// Load the document at `path`. Failure here is fatal at startup.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let snapshot = read_snapshot(&path)?;
        Ok(Self::with_snapshot(path, snapshot))
    }

    pub fn with_snapshot(path: impl Into<PathBuf>, snapshot: Snapshot) -> Self {
        Self {
            path: path.into(),
            current: RwLock::new(Arc::new(snapshot)),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> Arc<Snapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the current snapshot in one step.
    pub fn swap(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let _guard = self.lock_writes();
        self.publish(snapshot)
    }

    /// Re-read the document from disk. On error the prior snapshot stays.
    pub fn reload(&self) -> Result<Arc<Snapshot>, ConfigError> {
        self.reload_then(|_| {})
    }

    /// Like [`reload`](Self::reload), running `apply` on the new snapshot
    /// before any other change can start.
    pub fn reload_then(
        &self,
        apply: impl FnOnce(&Snapshot),
    ) -> Result<Arc<Snapshot>, ConfigError> {
        let _guard = self.lock_writes();

        match read_snapshot(&self.path) {
            Ok(snapshot) => {
                let snapshot = self.publish(snapshot);
                apply(&snapshot);
                Ok(snapshot)
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Reload rejected, keeping previous snapshot"
                );
                Err(e)
            }
        }
    }

    /// The document exactly as stored on disk.
    pub fn raw_document(&self) -> Result<Value, ConfigError> {
        let _guard = self.lock_writes();
        let content = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Validate `value`, write it to disk, then swap it in.
    pub fn replace_document(&self, value: Value) -> Result<Arc<Snapshot>, ConfigError> {
        self.replace_document_then(value, |_| {})
    }

    /// Like [`replace_document`](Self::replace_document), running `apply` on
    /// the new snapshot before any other change can start.
    pub fn replace_document_then(
        &self,
        value: Value,
        apply: impl FnOnce(&Snapshot),
    ) -> Result<Arc<Snapshot>, ConfigError> {
        let snapshot = Snapshot::from_value(value.clone())?;
        let pretty = serde_json::to_string_pretty(&value)?;

        let _guard = self.lock_writes();
        fs::write(&self.path, pretty)?;
        info!(path = %self.path.display(), "Config document written");

        let snapshot = self.publish(snapshot);
        apply(&snapshot);
        Ok(snapshot)
    }

    fn publish(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let snapshot = Arc::new(snapshot);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = snapshot.clone();
        snapshot
    }

    fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn read_snapshot(path: &Path) -> Result<Snapshot, ConfigError> {
    let content = fs::read_to_string(path)?;
    let snapshot = Snapshot::from_json(&content)?;

    info!(
        path = %path.display(),
        rules = snapshot.rules.len(),
        actions = snapshot.document.actions.len(),
        "Config snapshot loaded"
    );

    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "server_url": "http://localhost:4567/v1/server/exec",
            "key": "secret",
            "max_media_que_length": 5,
            "events": {
                "specifiedGift": [
                    {"gift_name": "Rose", "action_id": ["a1"], "enabled": true},
                    {"gift_name": "Lion", "action_id": ["a1"], "enabled": false}
                ],
                "coinCount": [
                    {"min_coin": 10, "max_coin": 40, "action_id": ["a1"], "enabled": true},
                    {"min_coin": 41, "max_coin": 100, "action_id": ["a2"], "enabled": true}
                ],
                "textToSpeech": {"enabled": true, "type": "fanClub"},
                "follow": {"action_id": ["a2"], "enabled": true}
            },
            "actions": {
                "a1": {
                    "screen": "main",
                    "commands": ["say hi"],
                    "play_media": {"type": "video", "media_path": "rose.mp4", "max_duration": "5", "volume": 0.5}
                },
                "a2": {"screen": "side", "commands": []}
            }
        })
    }

    #[test]
    fn test_parse_document() {
        let snapshot = Snapshot::from_value(sample()).unwrap();
        let doc = &snapshot.document;

        assert_eq!(doc.key, "secret");
        assert_eq!(doc.max_media_queue_length, 5);
        assert_eq!(doc.max_comment_queue_length, 20);
        assert_eq!(doc.max_chars_tts, 200);
        assert_eq!(doc.events.text_to_speech.kind, "fanClub");
        assert_eq!(snapshot.rules.len(), 5);

        let a1 = snapshot.action("a1").unwrap();
        assert_eq!(a1.id, "a1");
        assert_eq!(a1.destination, "main");
        assert_eq!(a1.playable_media().unwrap().media_path, "rose.mp4");
        assert!(snapshot.action("a2").unwrap().playable_media().is_none());
    }

    #[test]
    fn test_gift_match_is_case_insensitive() {
        let snapshot = Snapshot::from_value(sample()).unwrap();
        assert_eq!(snapshot.rules.gift_matches("rose").count(), 1);
        assert_eq!(snapshot.rules.gift_matches("ROSE").count(), 1);
        assert_eq!(snapshot.rules.gift_matches("Rosette").count(), 0);
    }

    #[test]
    fn test_disabled_rule_never_matches() {
        let snapshot = Snapshot::from_value(sample()).unwrap();
        assert_eq!(snapshot.rules.gift_matches("Lion").count(), 0);
    }

    #[test]
    fn test_coin_range_inclusive() {
        let snapshot = Snapshot::from_value(sample()).unwrap();
        let ids = |d| {
            snapshot
                .rules
                .coin_matches(d)
                .flat_map(|r| r.action_ids.clone())
                .collect::<Vec<_>>()
        };

        assert_eq!(ids(10), vec!["a1"]);
        assert_eq!(ids(40), vec!["a1"]);
        assert_eq!(ids(41), vec!["a2"]);
        assert_eq!(ids(100), vec!["a2"]);
        assert!(ids(9).is_empty());
        assert!(ids(101).is_empty());
    }

    #[test]
    fn test_follow_rule() {
        let snapshot = Snapshot::from_value(sample()).unwrap();
        assert_eq!(snapshot.rules.follow().unwrap().action_ids, vec!["a2"]);

        let empty = Snapshot::from_value(json!({})).unwrap();
        assert!(empty.rules.follow().is_none());
        assert!(empty.rules.is_empty());
    }

    #[test]
    fn test_validation_inverted_coin_range() {
        let result = Snapshot::from_value(json!({
            "events": {"coinCount": [{"min_coin": 50, "max_coin": 10, "enabled": true}]}
        }));
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_validation_bad_server_url() {
        let result = Snapshot::from_value(json!({"server_url": "localhost:4567"}));
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_unknown_action_reference_is_not_fatal() {
        let snapshot = Snapshot::from_value(json!({
            "events": {"specifiedGift": [{"gift_name": "Rose", "action_id": ["ghost"], "enabled": true}]}
        }))
        .unwrap();
        assert!(snapshot.action("ghost").is_none());
    }

    #[test]
    fn test_reload_swaps_and_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        fs::write(&path, sample().to_string()).unwrap();

        let store = ConfigStore::load(&path).unwrap();
        assert_eq!(store.current().document.max_media_queue_length, 5);

        fs::write(&path, r#"{"max_media_que_length": 2}"#).unwrap();
        store.reload().unwrap();
        assert_eq!(store.current().document.max_media_queue_length, 2);

        fs::write(&path, "{ not json").unwrap();
        assert!(store.reload().is_err());
        assert_eq!(store.current().document.max_media_queue_length, 2);
    }

    #[test]
    fn test_held_snapshot_survives_swap() {
        let store = ConfigStore::with_snapshot("unused.json", Snapshot::from_value(sample()).unwrap());
        let held = store.current();

        store.swap(Snapshot::default());

        assert_eq!(held.document.key, "secret");
        assert!(store.current().document.key.is_empty());
    }

    #[test]
    fn test_replace_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        fs::write(&path, "{}").unwrap();
        let store = ConfigStore::load(&path).unwrap();

        store.replace_document(sample()).unwrap();
        assert_eq!(store.current().document.key, "secret");
        assert_eq!(store.raw_document().unwrap()["key"], "secret");

        let bad = json!({"events": {"coinCount": [{"min_coin": 5, "max_coin": 1}]}});
        assert!(store.replace_document(bad).is_err());
        assert_eq!(store.raw_document().unwrap()["key"], "secret");
    }

    #[test]
    fn test_null_numbers_read_as_defaults() {
        let snapshot = Snapshot::from_value(json!({
            "volume": null,
            "max_chars_tts": null,
            "max_comment_que_length": null,
            "max_media_que_length": null,
            "events": {
                "specifiedGift": [{"gift_name": "Rose", "gift_id": null, "action_id": ["a1"], "enabled": true}],
                "coinCount": [{"min_coin": null, "max_coin": 40, "action_id": ["a1"], "enabled": true}]
            },
            "actions": {
                "a1": {"screen": "main", "play_media": {"media_path": "rose.mp4", "volume": null}}
            }
        }))
        .unwrap();
        let doc = &snapshot.document;

        assert_eq!(doc.volume, 1.0);
        assert_eq!(doc.max_chars_tts, 200);
        assert_eq!(doc.max_comment_queue_length, 20);
        assert_eq!(doc.max_media_queue_length, 10);
        assert_eq!(doc.events.specified_gift[0].gift_id, 0);
        assert_eq!(snapshot.rules.coin_matches(0).count(), 1);
        assert_eq!(snapshot.action("a1").unwrap().playable_media().unwrap().volume, 0.0);
    }

    #[test]
    fn test_concurrent_replaces_keep_disk_and_snapshot_in_step() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        fs::write(&path, "{}").unwrap();
        let store = ConfigStore::load(&path).unwrap();

        for _ in 0..200 {
            std::thread::scope(|scope| {
                for capacity in [1, 9] {
                    let store = &store;
                    scope.spawn(move || {
                        store
                            .replace_document(json!({"max_media_que_length": capacity}))
                            .unwrap();
                    });
                }
            });

            let on_disk = store.raw_document().unwrap()["max_media_que_length"].clone();
            assert_eq!(on_disk, json!(store.current().document.max_media_queue_length));
        }
    }

    #[test]
    fn test_apply_runs_with_the_published_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        fs::write(&path, r#"{"max_media_que_length": 3}"#).unwrap();
        let store = ConfigStore::load(&path).unwrap();

        let mut seen = None;
        store
            .reload_then(|snapshot| seen = Some(snapshot.document.max_media_queue_length))
            .unwrap();
        assert_eq!(seen, Some(3));

        fs::write(&path, "broken").unwrap();
        let mut called = false;
        assert!(store.reload_then(|_| called = true).is_err());
        assert!(!called);
    }

    #[test]
    fn test_load_missing_file_is_error() {
        assert!(matches!(
            ConfigStore::load("/nonexistent/data.json"),
            Err(ConfigError::ReadError(_))
        ));
    }
}
