//! Publish Pipeline
//!
//! Validation, key resolution and payload sealing run on the caller's
//! thread; the network publish runs on the dispatch task.

use tokio::sync::oneshot;
use tracing::{debug, error};

use super::dispatch::Command;
use super::Inner;
use crate::error::Rejection;
use crate::protocol::{MessageKind, OutboundMessage};
use crate::topic::{ChannelCipher, KeyMaterial, TopicId};

/// Pending outcome of an accepted publish
#[derive(Debug)]
pub struct PublishReceipt {
    rx: oneshot::Receiver<bool>,
}

impl PublishReceipt {
    fn resolved(ok: bool) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(ok);
        Self { rx }
    }

    /// Whether the broker took the message
    ///
    /// Resolves to `false` if the relay shut down before dispatching it.
    pub async fn outcome(self) -> bool {
        self.rx.await.unwrap_or(false)
    }
}

impl Inner {
    pub(super) fn publish(
        &self,
        kind: MessageKind,
        body: &str,
        topic: TopicId,
        recipient: Option<&str>,
    ) -> Result<PublishReceipt, Rejection> {
        let result = self.prepare_publish(kind, body, topic, recipient);
        if let Err(rejection) = &result {
            debug!("Publish of {} message rejected: {}", kind, rejection);
            self.metrics.publish_rejected(rejection.as_str());
        }
        result
    }

    fn prepare_publish(
        &self,
        kind: MessageKind,
        body: &str,
        topic: TopicId,
        recipient: Option<&str>,
    ) -> Result<PublishReceipt, Rejection> {
        if self.is_shutting_down() {
            return Err(Rejection::ShuttingDown);
        }
        if body.trim().is_empty() {
            return Err(Rejection::EmptyBody);
        }
        let session = self.session().ok_or(Rejection::NotLoggedIn)?;
        if self.prefs().read_only {
            return Err(Rejection::ReadOnly);
        }

        // Resolved before the rate limit slot is consumed
        let material = match kind {
            MessageKind::Private => {
                let recipient = recipient.ok_or(Rejection::UnknownRecipient)?;
                let world = self
                    .players
                    .friend_world(recipient)
                    .ok_or(Rejection::UnknownRecipient)?;
                KeyMaterial::partition(world)
            }
            _ => KeyMaterial::shared(self.config.keys.shared_secret.as_str()),
        };

        self.filter.check_publish(body, &session.identity)?;

        let message = OutboundMessage {
            kind,
            sender_id: session.identity.clone(),
            recipient_id: recipient.map(str::to_string),
            body: body.to_string(),
            topic,
        };

        let sealed = match message
            .to_payload(&session.account_icon)
            .to_bytes()
            .map_err(|e| e.to_string())
            .and_then(|plain| {
                ChannelCipher::from_material(&material)
                    .encrypt(&plain)
                    .map_err(|e| e.to_string())
            }) {
            Ok(sealed) => sealed,
            Err(e) => {
                error!("Could not seal message for '{}': {}", message.topic, e);
                self.metrics.publish_finished(false);
                return Ok(PublishReceipt::resolved(false));
            }
        };

        let (reply, rx) = oneshot::channel();
        if !self.enqueue(Command::Publish {
            topic: message.topic,
            payload: sealed,
            reply,
        }) {
            return Err(Rejection::ShuttingDown);
        }
        Ok(PublishReceipt { rx })
    }
}
