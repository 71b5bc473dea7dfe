//! Receive Pipeline
//!
//! Runs on the dispatch task for every message delivered on a subscribed
//! channel. Filters only read cached state; nothing here blocks.

use tracing::debug;

use super::host::{DisplayCategory, RoutedMessage};
use super::Inner;
use crate::error::RelayError;
use crate::protocol::{
    canonical_name, is_reserved_name, valid_account_icon, InboundEnvelope, MessageKind,
    BROADCAST_BADGE,
};
use crate::topic::TopicId;

/// Why an inbound message was not shown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    LoggedOut,
    UnknownChannel,
    Malformed,
    Duplicate,
    ReservedName,
    Spam,
    LowCombatLevel,
    NameTooLong,
    OwnMessage,
    NotAddressed,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::LoggedOut => "logged_out",
            DropReason::UnknownChannel => "unknown_channel",
            DropReason::Malformed => "malformed",
            DropReason::Duplicate => "duplicate",
            DropReason::ReservedName => "reserved_name",
            DropReason::Spam => "spam",
            DropReason::LowCombatLevel => "low_combat_level",
            DropReason::NameTooLong => "name_too_long",
            DropReason::OwnMessage => "own_message",
            DropReason::NotAddressed => "not_addressed",
        }
    }
}

impl Inner {
    pub(super) fn on_message(&self, channel: &str, payload: &[u8]) {
        if TopicId::parse(channel).is_ok_and(|topic| topic.is_presence()) {
            if let Err(reason) = self.on_presence(channel, payload) {
                debug!("Dropped presence on '{}': {}", channel, reason.as_str());
                self.metrics.dropped(reason.as_str());
            }
            return;
        }
        self.metrics.received_total.inc();

        match self.route_inbound(channel, payload) {
            Ok(category) => self.metrics.routed(category.as_str()),
            Err(reason) => {
                debug!("Dropped message on '{}': {}", channel, reason.as_str());
                self.metrics.dropped(reason.as_str());
            }
        }
    }

    fn route_inbound(&self, channel: &str, payload: &[u8]) -> Result<DisplayCategory, DropReason> {
        let session = self.session().ok_or(DropReason::LoggedOut)?;
        let prefs = self.prefs();

        let cipher = self
            .registry
            .cipher_for(channel)
            .ok_or(DropReason::UnknownChannel)?;
        self.registry.mark_active(channel, self.clock.now_millis());

        let envelope = cipher
            .decrypt(payload)
            .map_err(|e| RelayError::Parse(e.to_string()))
            .and_then(|plain| InboundEnvelope::parse(&plain))
            .map_err(|e| {
                debug!("Unreadable payload on '{}': {}", channel, e);
                DropReason::Malformed
            })?;
        let sender = envelope.sender_key();

        if !self.filter.should_display(&sender, &envelope.body, false) {
            return Err(DropReason::Duplicate);
        }
        if is_reserved_name(&sender) {
            return Err(DropReason::ReservedName);
        }
        if prefs.hide_spam && self.filter.is_spam(&envelope.body) {
            return Err(DropReason::Spam);
        }
        if self
            .filter
            .combat()
            .is_below(&sender, prefs.min_combat_level)
        {
            return Err(DropReason::LowCombatLevel);
        }

        let display_name = format!("{}{}", self.display_prefix(&envelope), envelope.sender_id);

        if envelope.sender_id.chars().count() > self.config.limits.max_display_name_len {
            return Err(DropReason::NameTooLong);
        }

        let own = session.is_local(&envelope.sender_id);
        let (category, channel_name) = match envelope.kind {
            MessageKind::Private => {
                if own {
                    return Err(DropReason::OwnMessage);
                }
                if canonical_name(&envelope.recipient_id) != session.identity {
                    return Err(DropReason::NotAddressed);
                }
                (DisplayCategory::PrivateWhisper, None)
            }
            MessageKind::World => (DisplayCategory::WorldBroadcast, None),
            MessageKind::FriendsGroup => {
                if own {
                    return Err(DropReason::OwnMessage);
                }
                (DisplayCategory::GroupChat, Some(envelope.recipient_id.clone()))
            }
            MessageKind::Clan => {
                if own {
                    return Err(DropReason::OwnMessage);
                }
                (DisplayCategory::ClanChat, Some(envelope.recipient_id.clone()))
            }
        };

        self.sink.on_routed_message(RoutedMessage {
            category,
            display_name,
            sender: envelope.sender_id.clone(),
            body: envelope.body.clone(),
            channel_name,
        });

        if envelope.kind == MessageKind::World {
            if let Some(level) = self.players.visible_combat_level(&envelope.sender_id) {
                self.filter.record_combat_level(&sender, level);
                self.sink.on_overhead_text(
                    &envelope.sender_id,
                    &envelope.body,
                    self.config.limits.overhead_text_ticks,
                );
            }
        }

        self.filter.should_display(&sender, &envelope.body, true);
        Ok(category)
    }

    /// Broadcast badge (world only), account icon, then supporter badge
    fn display_prefix(&self, envelope: &InboundEnvelope) -> String {
        let mut prefix = String::new();
        if envelope.kind == MessageKind::World {
            prefix.push_str(BROADCAST_BADGE);
        }
        prefix.push_str(valid_account_icon(&envelope.symbol_prefix));
        prefix.push_str(&self.supporters.badge_for(&envelope.sender_id));
        prefix
    }
}
