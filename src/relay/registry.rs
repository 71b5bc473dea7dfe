//! Channel Subscription Registry
//!
//! Bookkeeping of desired vs. actual subscription state per topic. The
//! registry performs no I/O: it decides which network operations the
//! dispatch task should run and records their outcome.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use crate::topic::{ChannelCipher, KeyMaterial, TopicId};

/// What the relay wants for a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesiredState {
    Subscribed,
    Unsubscribed,
}

/// What the broker has confirmed for a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActualState {
    Pending,
    Active,
    Failed,
}

/// One tracked topic
#[derive(Debug, Clone)]
pub struct ChannelSubscription {
    pub topic: TopicId,
    pub desired: DesiredState,
    pub actual: ActualState,
    pub last_activity_ms: u64,
    cipher: ChannelCipher,
}

/// Topic table behind a single lock
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: Mutex<HashMap<TopicId, ChannelSubscription>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the wish to subscribe to `topic`
    ///
    /// Returns `true` when the caller must enqueue a network subscribe:
    /// always, unless the topic is already wanted and Active.
    pub fn request(&self, topic: &TopicId, material: &KeyMaterial, now_ms: u64) -> bool {
        let mut channels = self.channels.lock();

        if let Some(entry) = channels.get_mut(topic) {
            if entry.desired == DesiredState::Subscribed && entry.actual == ActualState::Active {
                return false;
            }
            entry.desired = DesiredState::Subscribed;
            entry.actual = ActualState::Pending;
            entry.cipher = ChannelCipher::from_material(material);
            entry.last_activity_ms = now_ms;
            return true;
        }

        channels.insert(
            topic.clone(),
            ChannelSubscription {
                topic: topic.clone(),
                desired: DesiredState::Subscribed,
                actual: ActualState::Pending,
                last_activity_ms: now_ms,
                cipher: ChannelCipher::from_material(material),
            },
        );
        true
    }

    /// Whether a queued subscribe for `topic` should still hit the network
    pub fn needs_attach(&self, topic: &TopicId) -> bool {
        self.channels
            .lock()
            .get(topic)
            .map(|e| e.desired == DesiredState::Subscribed && e.actual != ActualState::Active)
            .unwrap_or(false)
    }

    /// The broker acknowledged a subscribe
    pub fn confirm(&self, topic: &TopicId, now_ms: u64) -> bool {
        let mut channels = self.channels.lock();
        match channels.get_mut(topic) {
            Some(entry) if entry.desired == DesiredState::Subscribed => {
                entry.actual = ActualState::Active;
                entry.last_activity_ms = now_ms;
                true
            }
            _ => false,
        }
    }

    /// The broker refused a subscribe
    pub fn fail(&self, topic: &TopicId) {
        if let Some(entry) = self.channels.lock().get_mut(topic) {
            if entry.desired == DesiredState::Subscribed {
                entry.actual = ActualState::Failed;
            }
        }
    }

    /// Record the wish to leave `topic`. Returns whether it was tracked.
    pub fn release(&self, topic: &TopicId) -> bool {
        match self.channels.lock().get_mut(topic) {
            Some(entry) => {
                entry.desired = DesiredState::Unsubscribed;
                true
            }
            None => false,
        }
    }

    /// Drop `topic` once its detach finished, unless it was wanted again
    pub fn remove_released(&self, topic: &TopicId) -> bool {
        let mut channels = self.channels.lock();
        let released = channels
            .get(topic)
            .map(|e| e.desired == DesiredState::Unsubscribed)
            .unwrap_or(false);
        if released {
            channels.remove(topic);
        }
        released
    }

    /// Refresh the idle timer of `topic`
    pub fn mark_active(&self, topic: &str, now_ms: u64) {
        let mut channels = self.channels.lock();
        if let Some(entry) = channels.values_mut().find(|e| e.topic.as_str() == topic) {
            entry.last_activity_ms = now_ms;
        }
    }

    /// Release every wanted topic idle for at least `threshold_ms`, except
    /// those in `keep`. Returns the released topics.
    pub fn release_idle(&self, threshold_ms: u64, now_ms: u64, keep: &[TopicId]) -> Vec<TopicId> {
        let mut channels = self.channels.lock();
        let mut released = Vec::new();

        for entry in channels.values_mut() {
            if entry.desired != DesiredState::Subscribed || keep.contains(&entry.topic) {
                continue;
            }
            if now_ms.saturating_sub(entry.last_activity_ms) >= threshold_ms {
                entry.desired = DesiredState::Unsubscribed;
                released.push(entry.topic.clone());
            }
        }

        if !released.is_empty() {
            debug!("Releasing {} idle channel(s): {:?}", released.len(), released);
        }
        released
    }

    /// Copy of the Active flag of every wanted topic
    pub fn snapshot_status(&self) -> HashMap<String, bool> {
        self.channels
            .lock()
            .values()
            .filter(|e| e.desired == DesiredState::Subscribed)
            .map(|e| (e.topic.to_string(), e.actual == ActualState::Active))
            .collect()
    }

    /// Connection dropped: nothing is attached any more
    pub fn mark_all_pending(&self) {
        for entry in self.channels.lock().values_mut() {
            entry.actual = ActualState::Pending;
        }
    }

    /// Wanted topics in a stable order
    pub fn desired_topics(&self) -> Vec<TopicId> {
        let mut topics: Vec<TopicId> = self
            .channels
            .lock()
            .values()
            .filter(|e| e.desired == DesiredState::Subscribed)
            .map(|e| e.topic.clone())
            .collect();
        topics.sort();
        topics
    }

    /// Wanted topics whose last subscribe failed
    pub fn failed_topics(&self) -> Vec<TopicId> {
        let mut topics: Vec<TopicId> = self
            .channels
            .lock()
            .values()
            .filter(|e| e.desired == DesiredState::Subscribed && e.actual == ActualState::Failed)
            .map(|e| e.topic.clone())
            .collect();
        topics.sort();
        topics
    }

    /// Retry bookkeeping for a failed topic, keeping its key
    pub fn retry(&self, topic: &TopicId) -> bool {
        match self.channels.lock().get_mut(topic) {
            Some(entry)
                if entry.desired == DesiredState::Subscribed
                    && entry.actual == ActualState::Failed =>
            {
                entry.actual = ActualState::Pending;
                true
            }
            _ => false,
        }
    }

    /// Cipher of a tracked topic, looked up by channel name
    pub fn cipher_for(&self, channel: &str) -> Option<ChannelCipher> {
        self.channels
            .lock()
            .values()
            .find(|e| e.topic.as_str() == channel && e.desired == DesiredState::Subscribed)
            .map(|e| e.cipher.clone())
    }

    /// Swap the key of a tracked topic without touching its state
    pub fn rekey(&self, topic: &TopicId, material: &KeyMaterial) -> bool {
        match self.channels.lock().get_mut(topic) {
            Some(entry) => {
                entry.cipher = ChannelCipher::from_material(material);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, topic: &TopicId) -> Option<ChannelSubscription> {
        self.channels.lock().get(topic).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.channels
            .lock()
            .values()
            .filter(|e| e.desired == DesiredState::Subscribed && e.actual == ActualState::Active)
            .count()
    }

    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.lock().is_empty()
    }

    pub fn clear(&self) {
        self.channels.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic::ChannelKey;

    fn world(id: u16) -> TopicId {
        TopicId::world(id)
    }

    fn shared() -> KeyMaterial {
        KeyMaterial::shared("pub")
    }

    #[test]
    fn test_request_is_noop_while_active() {
        let registry = ChannelRegistry::new();
        assert!(registry.request(&world(301), &shared(), 0));
        assert!(registry.needs_attach(&world(301)));
        assert!(registry.confirm(&world(301), 10));

        assert!(!registry.request(&world(301), &shared(), 20));
        assert!(!registry.needs_attach(&world(301)));
        assert_eq!(registry.get(&world(301)).unwrap().last_activity_ms, 10);
    }

    #[test]
    fn test_request_while_pending_requeues() {
        let registry = ChannelRegistry::new();
        assert!(registry.request(&world(1), &shared(), 0));
        assert!(registry.request(&world(1), &shared(), 5));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_failed_subscribe_and_retry() {
        let registry = ChannelRegistry::new();
        registry.request(&world(1), &shared(), 0);
        registry.fail(&world(1));

        assert_eq!(registry.get(&world(1)).unwrap().actual, ActualState::Failed);
        assert_eq!(registry.failed_topics(), vec![world(1)]);
        assert_eq!(registry.snapshot_status().get("w:1"), Some(&false));

        assert!(registry.retry(&world(1)));
        assert!(!registry.retry(&world(1)));
        assert!(registry.failed_topics().is_empty());
    }

    #[test]
    fn test_release_then_remove() {
        let registry = ChannelRegistry::new();
        registry.request(&world(1), &shared(), 0);
        registry.confirm(&world(1), 0);

        assert!(registry.release(&world(1)));
        assert!(registry.snapshot_status().is_empty());
        assert!(registry.cipher_for("w:1").is_none());
        assert!(registry.remove_released(&world(1)));
        assert!(registry.is_empty());
        assert!(!registry.release(&world(1)));
    }

    #[test]
    fn test_resubscribe_between_release_and_remove_survives() {
        let registry = ChannelRegistry::new();
        registry.request(&world(1), &shared(), 0);
        registry.confirm(&world(1), 0);
        registry.release(&world(1));

        assert!(registry.request(&world(1), &shared(), 1));
        assert!(!registry.remove_released(&world(1)));
        assert_eq!(registry.get(&world(1)).unwrap().actual, ActualState::Pending);
    }

    #[test]
    fn test_release_idle_respects_threshold_and_keep() {
        let registry = ChannelRegistry::new();
        registry.request(&world(1), &shared(), 0);
        registry.request(&world(2), &shared(), 0);
        registry.request(&world(3), &shared(), 0);
        registry.mark_active("w:2", 250_000);

        let released = registry.release_idle(300_000, 300_000, &[world(3)]);
        assert_eq!(released, vec![world(1)]);
        assert_eq!(registry.desired_topics(), vec![world(2), world(3)]);
    }

    #[test]
    fn test_mark_all_pending() {
        let registry = ChannelRegistry::new();
        for id in [1, 2] {
            registry.request(&world(id), &shared(), 0);
            registry.confirm(&world(id), 0);
        }
        assert_eq!(registry.active_count(), 2);

        registry.mark_all_pending();
        assert_eq!(registry.active_count(), 0);
        assert!(registry.snapshot_status().values().all(|active| !active));
    }

    #[test]
    fn test_rekey_changes_cipher() {
        let registry = ChannelRegistry::new();
        let topic = TopicId::parse("p:Bob").unwrap();
        registry.request(&topic, &KeyMaterial::partition(301), 0);

        let sealed = registry
            .cipher_for("p:Bob")
            .unwrap()
            .encrypt(b"x")
            .unwrap();
        assert!(registry.rekey(&topic, &KeyMaterial::partition(302)));
        assert!(registry.cipher_for("p:Bob").unwrap().decrypt(&sealed).is_err());

        let fresh = ChannelCipher::new(ChannelKey::derive("302"));
        let sealed = fresh.encrypt(b"y").unwrap();
        assert_eq!(
            registry.cipher_for("p:Bob").unwrap().decrypt(&sealed).unwrap(),
            b"y"
        );
    }
}
