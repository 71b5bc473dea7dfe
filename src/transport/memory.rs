//! In-process broker
//!
//! Fans every publish out to every link subscribed to the channel,
//! including the publisher's own link, the way a hosted pub/sub broker
//! echoes messages. Faults can be injected per broker or per channel.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use super::{Connection, Connector, EventSender, LinkState, TransportError, TransportEvent};

struct Link {
    client_id: String,
    epoch: u64,
    events: EventSender,
    open: AtomicBool,
}

#[derive(Default)]
struct BrokerState {
    links: DashMap<u64, Arc<Link>>,
    /// channel -> subscribed link ids
    channels: DashMap<String, HashSet<u64>>,
    subscribe_counts: DashMap<String, usize>,
    unsubscribe_counts: DashMap<String, usize>,
    failing_channels: DashMap<String, TransportError>,
    refuse_connects: Mutex<Option<TransportError>>,
    fail_publishes: Mutex<Option<TransportError>>,
    latency: Mutex<Duration>,
    published: Mutex<Vec<(String, Bytes)>>,
    connects: AtomicUsize,
    next_link: AtomicU64,
}

impl BrokerState {
    async fn delay(&self) {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn deliver(&self, channel: &str, payload: &Bytes) -> usize {
        let Some(subscribers) = self.channels.get(channel).map(|s| s.clone()) else {
            return 0;
        };

        let mut delivered = 0;
        for id in subscribers {
            if let Some(link) = self.links.get(&id) {
                if link.open.load(Ordering::SeqCst) {
                    let _ = link.events.send(TransportEvent::Message {
                        epoch: link.epoch,
                        channel: channel.to_string(),
                        payload: payload.clone(),
                    });
                    delivered += 1;
                }
            }
        }
        delivered
    }

    fn detach_link(&self, id: u64) {
        self.links.remove(&id);
        for mut entry in self.channels.iter_mut() {
            entry.value_mut().remove(&id);
        }
        self.channels.retain(|_, subs| !subs.is_empty());
    }
}

/// In-memory broker implementing [`Connector`]
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every connect with `error` until cleared with `None`
    pub fn refuse_connects(&self, error: Option<TransportError>) {
        *self.state.refuse_connects.lock() = error;
    }

    /// Fail every subscribe to `channel` with `error`
    pub fn fail_subscribe(&self, channel: &str, error: TransportError) {
        self.state
            .failing_channels
            .insert(channel.to_string(), error);
    }

    /// Fail every publish with `error` until cleared with `None`
    pub fn fail_publishes(&self, error: Option<TransportError>) {
        *self.state.fail_publishes.lock() = error;
    }

    /// Remove all injected faults
    pub fn clear_faults(&self) {
        *self.state.refuse_connects.lock() = None;
        *self.state.fail_publishes.lock() = None;
        self.state.failing_channels.clear();
    }

    /// Delay every link operation by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.state.latency.lock() = latency;
    }

    /// Drop every open link, reporting `state` to its owner
    pub fn drop_all_links(&self, state: LinkState, error: Option<TransportError>) {
        let ids: Vec<u64> = self.state.links.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some(link) = self.state.links.get(&id).map(|l| l.clone()) {
                link.open.store(false, Ordering::SeqCst);
                let _ = link.events.send(TransportEvent::StateChanged {
                    epoch: link.epoch,
                    state,
                    error: error.clone(),
                });
                debug!("MemoryBroker: dropped link for '{}'", link.client_id);
            }
            self.state.detach_link(id);
        }
    }

    /// Publish from outside any link, as another client would
    pub fn inject(&self, channel: &str, payload: impl Into<Bytes>) -> usize {
        self.state.deliver(channel, &payload.into())
    }

    /// Number of SUBSCRIBE operations that reached the broker for `channel`
    pub fn subscribe_count(&self, channel: &str) -> usize {
        self.state
            .subscribe_counts
            .get(channel)
            .map(|c| *c)
            .unwrap_or(0)
    }

    pub fn unsubscribe_count(&self, channel: &str) -> usize {
        self.state
            .unsubscribe_counts
            .get(channel)
            .map(|c| *c)
            .unwrap_or(0)
    }

    /// Links currently subscribed to `channel`
    pub fn subscribers(&self, channel: &str) -> usize {
        self.state
            .channels
            .get(channel)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Successful connects so far
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn open_links(&self) -> usize {
        self.state.links.len()
    }

    /// Everything published through a link, in order
    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.state.published.lock().clone()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(
        &self,
        client_id: &str,
        epoch: u64,
        events: EventSender,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        self.state.delay().await;

        if let Some(error) = self.state.refuse_connects.lock().clone() {
            return Err(error);
        }

        let id = self.state.next_link.fetch_add(1, Ordering::SeqCst);
        let link = Arc::new(Link {
            client_id: client_id.to_string(),
            epoch,
            events,
            open: AtomicBool::new(true),
        });
        self.state.links.insert(id, link.clone());
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        debug!("MemoryBroker: '{}' connected (epoch {})", client_id, epoch);

        Ok(Arc::new(MemoryConnection {
            id,
            link,
            state: self.state.clone(),
        }))
    }
}

/// One link to a [`MemoryBroker`]
pub struct MemoryConnection {
    id: u64,
    link: Arc<Link>,
    state: Arc<BrokerState>,
}

impl MemoryConnection {
    fn check_open(&self) -> Result<(), TransportError> {
        if self.link.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn subscribe(&self, channel: &str) -> Result<(), TransportError> {
        self.state.delay().await;
        self.check_open()?;

        *self
            .state
            .subscribe_counts
            .entry(channel.to_string())
            .or_insert(0) += 1;

        if let Some(error) = self.state.failing_channels.get(channel) {
            return Err(error.clone());
        }

        self.state
            .channels
            .entry(channel.to_string())
            .or_default()
            .insert(self.id);
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), TransportError> {
        self.state.delay().await;
        self.check_open()?;

        *self
            .state
            .unsubscribe_counts
            .entry(channel.to_string())
            .or_insert(0) += 1;

        if let Some(mut subs) = self.state.channels.get_mut(channel) {
            subs.remove(&self.id);
        }
        self.state.channels.retain(|_, subs| !subs.is_empty());
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), TransportError> {
        self.state.delay().await;
        self.check_open()?;

        if let Some(error) = self.state.fail_publishes.lock().clone() {
            return Err(error);
        }

        self.state
            .published
            .lock()
            .push((channel.to_string(), payload.clone()));
        self.state.deliver(channel, &payload);
        Ok(())
    }

    async fn close(&self) {
        self.state.delay().await;
        if self.link.open.swap(false, Ordering::SeqCst) {
            self.state.detach_link(self.id);
        }
    }

    fn is_open(&self) -> bool {
        self.link.open.load(Ordering::SeqCst)
    }
}
