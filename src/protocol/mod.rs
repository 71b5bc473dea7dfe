//! Relay wire protocol
//!
//! Every chat line crosses the broker as one JSON object:
//!
//! ```json
//! {"symbol": "<img=2>", "username": "Zezima", "message": "gz", "type": "w", "to": ""}
//! ```
//!
//! The same shape is used for all four message kinds; the topic the object
//! travels on decides who receives it.

mod text;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use text::{
    canonical_name, is_reserved_name, remove_tags, valid_account_icon, BROADCAST_BADGE,
    RESERVED_NAME_PREFIX,
};

use crate::error::RelayError;
use crate::topic::TopicId;

/// Kind of chat message, also the topic prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Public chat relayed to everyone on the same world
    #[serde(rename = "w")]
    World,
    /// Direct message to one player
    #[serde(rename = "p")]
    Private,
    /// Friends chat channel
    #[serde(rename = "f")]
    FriendsGroup,
    /// Clan channel
    #[serde(rename = "c")]
    Clan,
}

impl MessageKind {
    /// Wire code and topic prefix
    pub fn code(&self) -> &'static str {
        match self {
            MessageKind::World => "w",
            MessageKind::Private => "p",
            MessageKind::FriendsGroup => "f",
            MessageKind::Clan => "c",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "w" => Some(MessageKind::World),
            "p" => Some(MessageKind::Private),
            "f" => Some(MessageKind::FriendsGroup),
            "c" => Some(MessageKind::Clan),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// JSON object carried on the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePayload {
    #[serde(default)]
    pub symbol: String,
    pub username: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub to: String,
}

impl WirePayload {
    pub fn to_bytes(&self) -> Result<Bytes, RelayError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self, RelayError> {
        Ok(serde_json::from_slice(raw)?)
    }
}

/// A message the local player wants relayed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub kind: MessageKind,
    pub sender_id: String,
    pub recipient_id: Option<String>,
    pub body: String,
    pub topic: TopicId,
}

impl OutboundMessage {
    /// Build the wire object, stamping the sender's account icon
    pub fn to_payload(&self, symbol: &str) -> WirePayload {
        WirePayload {
            symbol: symbol.to_string(),
            username: self.sender_id.clone(),
            message: self.body.clone(),
            kind: self.kind,
            to: self.recipient_id.clone().unwrap_or_default(),
        }
    }
}

/// A decoded, tag-stripped inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEnvelope {
    /// Sender name as displayed (tags removed)
    pub sender_id: String,
    /// Account icon the sender claimed
    pub symbol_prefix: String,
    pub body: String,
    pub kind: MessageKind,
    pub recipient_id: String,
}

impl InboundEnvelope {
    /// Decode a plaintext wire payload
    pub fn parse(raw: &[u8]) -> Result<Self, RelayError> {
        let payload = WirePayload::from_slice(raw)?;
        Ok(Self::from(payload))
    }

    /// Key used by per-sender tables
    pub fn sender_key(&self) -> String {
        canonical_name(&self.sender_id)
    }
}

impl From<WirePayload> for InboundEnvelope {
    fn from(p: WirePayload) -> Self {
        Self {
            sender_id: remove_tags(&p.username),
            symbol_prefix: p.symbol,
            body: remove_tags(&p.message),
            kind: p.kind,
            recipient_id: p.to,
        }
    }
}

/// What a presence update announces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceAction {
    /// Joined the world's presence channel
    Enter,
    /// Already there; sent in reply to someone else's `Enter`
    Present,
    /// Left the channel
    Leave,
}

/// Presence object carried on `pr:<world>` topics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub action: PresenceAction,
    #[serde(rename = "clientId")]
    pub client_id: String,
}

impl PresenceUpdate {
    pub fn new(action: PresenceAction, client_id: &str) -> Self {
        Self {
            action,
            client_id: client_id.to_string(),
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes, RelayError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self, RelayError> {
        Ok(serde_json::from_slice(raw)?)
    }
}
