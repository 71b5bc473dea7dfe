//! World presence
//!
//! Every relay client enters `pr:<world>` for the world it is on. Other
//! clients answer an `enter` with `present`, so a newcomer learns who is
//! already there. The host uses the member set to badge players who run
//! the relay.

use std::collections::HashSet;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::oneshot;
use tracing::debug;

use super::dispatch::Command;
use super::host::Session;
use super::receive::DropReason;
use super::Inner;
use crate::error::RelayError;
use crate::protocol::{canonical_name, PresenceAction, PresenceUpdate};
use crate::topic::TopicId;

/// Relay users seen on the current world's presence channel
#[derive(Debug, Default)]
pub struct PresenceRoster {
    members: RwLock<HashSet<String>>,
}

impl PresenceRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `name` was not a member yet
    pub fn enter(&self, name: &str) -> bool {
        self.members.write().insert(canonical_name(name))
    }

    pub fn leave(&self, name: &str) -> bool {
        self.members.write().remove(&canonical_name(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.members.read().contains(&canonical_name(name))
    }

    /// Sorted member names
    pub fn members(&self) -> Vec<String> {
        let mut members: Vec<String> = self.members.read().iter().cloned().collect();
        members.sort();
        members
    }

    pub fn clear(&self) {
        self.members.write().clear();
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }
}

impl Inner {
    /// Sealed presence update from `session` on its world's presence topic
    pub(super) fn seal_presence(
        &self,
        session: &Session,
        action: PresenceAction,
    ) -> Option<(TopicId, Bytes)> {
        let topic = session.presence_topic();
        let cipher = self.registry.cipher_for(topic.as_str())?;
        let sealed = PresenceUpdate::new(action, &session.identity)
            .to_bytes()
            .and_then(|plain| {
                cipher
                    .encrypt(&plain)
                    .map_err(|e| RelayError::Parse(e.to_string()))
            });
        match sealed {
            Ok(payload) => Some((topic, payload)),
            Err(e) => {
                debug!("Cannot seal presence update: {}", e);
                None
            }
        }
    }

    /// Queue a presence update behind whatever is already queued
    pub(super) fn queue_presence(&self, session: &Session, action: PresenceAction) {
        if self.connection.handle().is_none() {
            return;
        }
        if let Some((topic, payload)) = self.seal_presence(session, action) {
            let (reply, _) = oneshot::channel();
            self.enqueue(Command::Publish {
                topic,
                payload,
                reply,
            });
        }
    }

    /// Announce ourselves once the presence channel is attached
    pub(super) async fn announce_presence(&self, topic: &TopicId) {
        let Some(session) = self.session() else {
            return;
        };
        if session.presence_topic() != *topic {
            return;
        }
        if let Some((topic, payload)) = self.seal_presence(&session, PresenceAction::Enter) {
            debug!("Entering '{}'", topic);
            let ok = self.send(&topic, payload).await;
            self.metrics.publish_finished(ok);
        }
    }

    /// Apply a presence update received on `channel`
    pub(super) fn on_presence(&self, channel: &str, payload: &[u8]) -> Result<(), DropReason> {
        let session = self.session().ok_or(DropReason::LoggedOut)?;
        let cipher = self
            .registry
            .cipher_for(channel)
            .ok_or(DropReason::UnknownChannel)?;
        self.registry.mark_active(channel, self.clock.now_millis());

        let update = cipher
            .decrypt(payload)
            .map_err(|e| RelayError::Parse(e.to_string()))
            .and_then(|plain| PresenceUpdate::from_slice(&plain))
            .map_err(|e| {
                debug!("Unreadable presence on '{}': {}", channel, e);
                DropReason::Malformed
            })?;

        if session.presence_topic().as_str() != channel || session.is_local(&update.client_id) {
            return Ok(());
        }

        match update.action {
            PresenceAction::Enter => {
                self.presence.enter(&update.client_id);
                self.queue_presence(&session, PresenceAction::Present);
            }
            PresenceAction::Present => {
                self.presence.enter(&update.client_id);
            }
            PresenceAction::Leave => {
                self.presence.leave(&update.client_id);
            }
        }
        Ok(())
    }
}
