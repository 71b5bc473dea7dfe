//! Host integration
//!
//! The relay never talks to the game client directly. Everything it needs
//! from the host comes through [`PlayerLookup`] and [`SupporterDirectory`]
//! snapshots, and everything it shows goes out through [`HostSink`].
//!
//! Sink methods are invoked from the relay's dispatch task, not from the
//! host's main thread. Implementations should queue work for their own UI
//! thread instead of blocking.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Deserialize;

use crate::config::DisplayConfig;
use crate::error::RelayError;
use crate::protocol::{canonical_name, valid_account_icon, MessageKind};
use crate::topic::TopicId;

/// Severity of a user-visible notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Where the host should display a routed message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisplayCategory {
    PrivateWhisper,
    WorldBroadcast,
    GroupChat,
    ClanChat,
}

impl DisplayCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisplayCategory::PrivateWhisper => "private",
            DisplayCategory::WorldBroadcast => "world",
            DisplayCategory::GroupChat => "group",
            DisplayCategory::ClanChat => "clan",
        }
    }
}

/// A message that passed every filter, ready to display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedMessage {
    pub category: DisplayCategory,
    /// Badges followed by the sender name
    pub display_name: String,
    /// Sender name without badges
    pub sender: String,
    pub body: String,
    /// Channel the line belongs to, for group and clan chat
    pub channel_name: Option<String>,
}

/// Display side of the host
pub trait HostSink: Send + Sync {
    fn on_routed_message(&self, message: RoutedMessage);

    fn on_notification(&self, message: &str, severity: Severity);

    /// Show `text` above `sender`'s head for `ticks` game ticks
    fn on_overhead_text(&self, _sender: &str, _text: &str, _ticks: u32) {}
}

/// Non-blocking snapshots of what the host currently sees
pub trait PlayerLookup: Send + Sync {
    /// Combat level of a player currently rendered near the local player
    fn visible_combat_level(&self, name: &str) -> Option<u16>;

    /// World a friend is logged in to, if online
    fn friend_world(&self, name: &str) -> Option<u16>;
}

/// Lookup that sees nobody
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPlayers;

impl PlayerLookup for NoPlayers {
    fn visible_combat_level(&self, _name: &str) -> Option<u16> {
        None
    }

    fn friend_world(&self, _name: &str) -> Option<u16> {
        None
    }
}

/// Source of supporter badges
pub trait SupporterDirectory: Send + Sync {
    /// Badge markup for `name`, or an empty string
    fn badge_for(&self, name: &str) -> String;
}

/// Supporter tier by total amount
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SupporterTier {
    Bronze,
    Silver,
    Gold,
}

impl SupporterTier {
    pub fn from_amount(amount: u32) -> Option<Self> {
        match amount {
            a if a >= 50 => Some(SupporterTier::Gold),
            a if a >= 20 => Some(SupporterTier::Silver),
            a if a >= 5 => Some(SupporterTier::Bronze),
            _ => None,
        }
    }

    pub fn badge(&self) -> &'static str {
        match self {
            SupporterTier::Gold => "<img=314> ",
            SupporterTier::Silver => "<img=312> ",
            SupporterTier::Bronze => "<img=313> ",
        }
    }
}

/// One entry of the supporters feed
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Supporter {
    pub name: String,
    #[serde(default)]
    pub amount: u32,
}

#[derive(Deserialize)]
struct SupportersFeed {
    #[serde(default)]
    supporters: Vec<Supporter>,
}

/// In-memory supporter list, replaced wholesale on refresh
#[derive(Debug, Default)]
pub struct SupporterRoster {
    tiers: RwLock<HashMap<String, SupporterTier>>,
}

impl SupporterRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the roster. The first entry for a name wins.
    pub fn replace<I>(&self, supporters: I)
    where
        I: IntoIterator<Item = Supporter>,
    {
        let mut tiers = HashMap::new();
        for supporter in supporters {
            let key = supporter.name.trim().to_lowercase();
            if key.is_empty() {
                continue;
            }
            if let Some(tier) = SupporterTier::from_amount(supporter.amount) {
                tiers.entry(key).or_insert(tier);
            }
        }
        *self.tiers.write() = tiers;
    }

    /// Replace the roster from the feed's JSON body
    pub fn replace_from_json(&self, body: &[u8]) -> Result<usize, RelayError> {
        let feed: SupportersFeed = serde_json::from_slice(body)?;
        self.replace(feed.supporters);
        Ok(self.len())
    }

    pub fn tier_of(&self, name: &str) -> Option<SupporterTier> {
        self.tiers.read().get(&name.trim().to_lowercase()).copied()
    }

    pub fn len(&self) -> usize {
        self.tiers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.read().is_empty()
    }
}

impl SupporterDirectory for SupporterRoster {
    fn badge_for(&self, name: &str) -> String {
        self.tier_of(name)
            .map(|tier| tier.badge().to_string())
            .unwrap_or_default()
    }
}

/// Who the local player is right now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Canonical local player name, also the broker client id
    pub identity: String,
    pub world: u16,
    /// Validated account icon stamped on outbound messages
    pub account_icon: String,
    /// Owner of the friends chat the player is in
    pub group_owner: Option<String>,
    pub clan: Option<String>,
}

impl Session {
    pub fn new(identity: &str, world: u16, account_icon: &str) -> Self {
        Self {
            identity: canonical_name(identity),
            world,
            account_icon: valid_account_icon(account_icon).to_string(),
            group_owner: None,
            clan: None,
        }
    }

    pub fn is_local(&self, name: &str) -> bool {
        canonical_name(name) == self.identity
    }

    /// Direct message inbox: `p:<identity>`
    pub fn inbox(&self) -> Option<TopicId> {
        TopicId::new(MessageKind::Private, &self.identity).ok()
    }

    /// Relay presence on the current world: `pr:<world>`
    pub fn presence_topic(&self) -> TopicId {
        TopicId::presence(self.world)
    }

    pub fn group_topic(&self) -> Option<TopicId> {
        self.group_owner
            .as_ref()
            .and_then(|owner| TopicId::new(MessageKind::FriendsGroup, owner).ok())
    }

    pub fn clan_topic(&self) -> Option<TopicId> {
        self.clan
            .as_ref()
            .and_then(|clan| TopicId::new(MessageKind::Clan, clan).ok())
    }

    /// Every topic this session listens on
    pub fn topics(&self) -> Vec<TopicId> {
        let mut topics = vec![TopicId::world(self.world)];
        topics.extend(self.inbox());
        topics.push(self.presence_topic());
        topics.extend(self.group_topic());
        topics.extend(self.clan_topic());
        topics
    }
}

/// Display preferences, read as one snapshot per operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayPrefs {
    pub read_only: bool,
    pub hide_spam: bool,
    pub min_combat_level: u16,
}

impl From<&DisplayConfig> for DisplayPrefs {
    fn from(config: &DisplayConfig) -> Self {
        Self {
            read_only: config.read_only,
            hide_spam: config.hide_spam,
            min_combat_level: config.min_combat_level,
        }
    }
}

impl Default for DisplayPrefs {
    fn default() -> Self {
        Self::from(&DisplayConfig::default())
    }
}
