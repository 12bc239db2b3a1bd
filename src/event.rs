//! Live-stream interaction events.
//!
//! A [`LiveEvent`] is one audience interaction delivered by the tracked
//! stream: a chat message, a gift, a raw coin donation or a follow. Events
//! arrive over the ingest endpoint as internally tagged JSON.
//!
//! # Example
//!
//! ```json
//! {
//!   "kind": "gift",
//!   "name": "Rose",
//!   "diamonds": 1,
//!   "user": { "username": "steve", "nickname": "Steve" }
//! }
//! ```

use serde::{Deserialize, Serialize};

/// Badge name fragment carried by fan-club members.
const FAN_BADGE_MARKER: &str = "fans_badge_icon_lv";

/// Badge name fragment of a lapsed (grayed out) fan-club badge.
const LAPSED_BADGE_MARKER: &str = "_gray_";

/// The viewer behind an interaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewer {
    /// Unique handle
    #[serde(default)]
    pub username: String,

    /// Display name
    #[serde(default)]
    pub nickname: String,

    /// Badge names shown next to the viewer
    #[serde(default)]
    pub badges: Vec<String>,
}

impl Viewer {
    pub fn new(username: impl Into<String>) -> Self {
        let username = username.into();
        Self {
            nickname: username.clone(),
            username,
            badges: Vec::new(),
        }
    }

    pub fn with_badge(mut self, badge: impl Into<String>) -> Self {
        self.badges.push(badge.into());
        self
    }

    /// True when the viewer wears an active fan-club badge.
    pub fn is_fan(&self) -> bool {
        self.badges
            .iter()
            .any(|b| b.contains(FAN_BADGE_MARKER) && !b.contains(LAPSED_BADGE_MARKER))
    }

    /// Name used when reading the viewer out loud.
    pub fn display_name(&self) -> &str {
        if self.nickname.is_empty() {
            &self.username
        } else {
            &self.nickname
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEvent {
    pub comment: String,
    #[serde(default)]
    pub user: Viewer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GiftEvent {
    pub name: String,
    #[serde(default)]
    pub diamonds: u64,
    #[serde(default)]
    pub user: Viewer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinEvent {
    pub diamonds: u64,
    #[serde(default)]
    pub user: Viewer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowEvent {
    #[serde(default)]
    pub user: Viewer,
}

/// An interaction flowing out of the tracked stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LiveEvent {
    Chat(ChatEvent),
    Gift(GiftEvent),
    Coin(CoinEvent),
    Follow(FollowEvent),
}

impl LiveEvent {
    pub fn chat(user: Viewer, comment: impl Into<String>) -> Self {
        LiveEvent::Chat(ChatEvent {
            comment: comment.into(),
            user,
        })
    }

    pub fn gift(user: Viewer, name: impl Into<String>, diamonds: u64) -> Self {
        LiveEvent::Gift(GiftEvent {
            name: name.into(),
            diamonds,
            user,
        })
    }

    pub fn coin(user: Viewer, diamonds: u64) -> Self {
        LiveEvent::Coin(CoinEvent { diamonds, user })
    }

    pub fn follow(user: Viewer) -> Self {
        LiveEvent::Follow(FollowEvent { user })
    }

    /// Short kind label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            LiveEvent::Chat(_) => "chat",
            LiveEvent::Gift(_) => "gift",
            LiveEvent::Coin(_) => "coin",
            LiveEvent::Follow(_) => "follow",
        }
    }

    pub fn user(&self) -> &Viewer {
        match self {
            LiveEvent::Chat(e) => &e.user,
            LiveEvent::Gift(e) => &e.user,
            LiveEvent::Coin(e) => &e.user,
            LiveEvent::Follow(e) => &e.user,
        }
    }
}
