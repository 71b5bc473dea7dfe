//! Relay topics
//!
//! A topic is `<kind-prefix>:<scope>`:
//! - `w:<worldId>` world broadcast
//! - `p:<playerName>` direct messages addressed to one player
//! - `f:<groupOwnerName>` friends chat
//! - `c:<clanName>` clan chat
//! - `pr:<worldId>` relay presence on a world
//!
//! Topic ids are used verbatim as broker channel names, so they must also be
//! valid MQTT topic names (no wildcards, no NUL, at most 65535 bytes).

mod key;

pub use key::{ChannelCipher, ChannelKey, CipherError, KeyMaterial, KEY_LENGTH};

use std::fmt;

use crate::protocol::MessageKind;

/// Maximum encoded length of a topic (MQTT string limit)
pub const MAX_TOPIC_LEN: usize = 65535;

/// Prefix of presence topics
pub const PRESENCE_PREFIX: &str = "pr";

/// A validated `<kind>:<scope>` topic
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicId(String);

impl TopicId {
    /// Build the topic for a kind and scope
    pub fn new(kind: MessageKind, scope: impl AsRef<str>) -> Result<Self, &'static str> {
        Self::parse(&format!("{}:{}", kind.code(), scope.as_ref()))
    }

    /// World broadcast topic
    pub fn world(world: u16) -> Self {
        Self(format!("w:{}", world))
    }

    /// Presence topic of a world
    pub fn presence(world: u16) -> Self {
        Self(format!("{}:{}", PRESENCE_PREFIX, world))
    }

    /// Parse and validate a topic string
    pub fn parse(raw: &str) -> Result<Self, &'static str> {
        validate_topic(raw)?;
        Ok(Self(raw.to_string()))
    }

    /// Chat kind carried on this topic; `None` for presence topics
    pub fn kind(&self) -> Option<MessageKind> {
        self.0
            .split_once(':')
            .and_then(|(code, _)| MessageKind::from_code(code))
    }

    pub fn is_presence(&self) -> bool {
        self.0
            .split_once(':')
            .is_some_and(|(code, _)| code == PRESENCE_PREFIX)
    }

    pub fn scope(&self) -> &str {
        self.0.split_once(':').map(|(_, s)| s).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TopicId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Validate a topic string
///
/// Rules:
/// - Must be `<prefix>:<scope>` with a known kind prefix
/// - Scope must be non-empty
/// - Must not contain `+`, `#` or NUL (it doubles as an MQTT topic name)
/// - Must not exceed [`MAX_TOPIC_LEN`] bytes
pub fn validate_topic(topic: &str) -> Result<(), &'static str> {
    if topic.len() > MAX_TOPIC_LEN {
        return Err("topic exceeds maximum length");
    }

    let (prefix, scope) = topic.split_once(':').ok_or("topic is missing a kind prefix")?;

    if MessageKind::from_code(prefix).is_none() && prefix != PRESENCE_PREFIX {
        return Err("unknown topic kind prefix");
    }

    if scope.trim().is_empty() {
        return Err("topic scope cannot be empty");
    }

    if topic.contains('\0') {
        return Err("topic contains null character");
    }

    if topic.contains('+') || topic.contains('#') {
        return Err("topic contains wildcard");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("w:301", MessageKind::World, "301")]
    #[test_case("p:Zezima", MessageKind::Private, "Zezima")]
    #[test_case("f:Big Bob", MessageKind::FriendsGroup, "Big Bob")]
    #[test_case("c:The Clan", MessageKind::Clan, "The Clan")]
    fn test_parse_valid(raw: &str, kind: MessageKind, scope: &str) {
        let topic = TopicId::parse(raw).unwrap();
        assert_eq!(topic.kind(), Some(kind));
        assert!(!topic.is_presence());
        assert_eq!(topic.scope(), scope);
        assert_eq!(topic.as_str(), raw);
    }

    #[test_case("w301" ; "no separator")]
    #[test_case("x:1" ; "unknown prefix")]
    #[test_case("w:" ; "empty scope")]
    #[test_case("w:  " ; "blank scope")]
    #[test_case("w:30#" ; "multi wildcard")]
    #[test_case("c:a+b" ; "single wildcard")]
    #[test_case("p:a\0b" ; "nul")]
    fn test_parse_invalid(raw: &str) {
        assert!(TopicId::parse(raw).is_err());
    }

    #[test]
    fn test_constructors() {
        assert_eq!(TopicId::world(301).as_str(), "w:301");
        assert_eq!(
            TopicId::new(MessageKind::Private, "Alice").unwrap().as_str(),
            "p:Alice"
        );
        assert!(TopicId::new(MessageKind::Clan, "").is_err());
    }

    #[test]
    fn test_presence_topic() {
        let topic = TopicId::presence(301);
        assert_eq!(topic.as_str(), "pr:301");
        assert!(topic.is_presence());
        assert_eq!(topic.kind(), None);
        assert_eq!(TopicId::parse("pr:301").unwrap(), topic);
        assert!(TopicId::parse("pr:").is_err());
    }

    #[test]
    fn test_too_long() {
        let raw = format!("c:{}", "a".repeat(MAX_TOPIC_LEN));
        assert!(TopicId::parse(&raw).is_err());
    }
}
