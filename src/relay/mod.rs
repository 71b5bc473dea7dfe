//! Relay Core
//!
//! [`RelayCore`] ties the pieces together:
//! - [`ConnectionManager`]: the single broker connection and its state
//! - [`ChannelRegistry`]: desired vs. actual channel subscriptions
//! - [`ChatFilter`]: rate limit, spam, dedup and combat level tables
//! - [`PresenceRoster`]: relay users on the current world
//! - the publish and receive pipelines
//!
//! Public methods never wait on the broker. Network work is queued to one
//! dispatch task and processed in submission order; a supervisor task
//! drives reconnects and periodic sweeps.

mod connection;
mod dispatch;
mod host;
mod presence;
mod publish;
mod receive;
mod registry;
mod supervisor;

#[cfg(test)]
mod tests;

pub use connection::{backoff_delay, ConnectionManager, ConnectionState};
pub use host::{
    DisplayCategory, DisplayPrefs, HostSink, NoPlayers, PlayerLookup, RoutedMessage, Session,
    Severity, Supporter, SupporterDirectory, SupporterRoster, SupporterTier,
};
pub use presence::PresenceRoster;
pub use publish::PublishReceipt;
pub use receive::DropReason;
pub use registry::{ActualState, ChannelRegistry, ChannelSubscription, DesiredState};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::{millis, Clock, SystemClock};
use crate::config::{RelayConfig, COMBAT_LEVEL_RANGE};
use crate::error::{ErrorClass, Rejection, RelayError};
use crate::filter::{ChatFilter, FilterStats};
use crate::metrics::RelayMetrics;
use crate::protocol::{
    canonical_name, remove_tags, MessageKind, PresenceAction, BROADCAST_BADGE,
};
use crate::topic::{KeyMaterial, TopicId};
use crate::transport::{Connector, EventSender};

use dispatch::Command;

/// Point-in-time view of the relay's state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayStats {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    /// Active flag per wanted channel
    pub channels: HashMap<String, bool>,
    pub filter: FilterStats,
    /// Relay users seen on the current world
    pub presence_members: usize,
}

/// State shared by the public handle, the dispatch task and the supervisor
pub(crate) struct Inner {
    config: RelayConfig,
    clock: Arc<dyn Clock>,
    connector: Arc<dyn Connector>,
    sink: Arc<dyn HostSink>,
    players: Arc<dyn PlayerLookup>,
    supporters: Arc<dyn SupporterDirectory>,

    filter: ChatFilter,
    registry: ChannelRegistry,
    connection: ConnectionManager,
    metrics: RelayMetrics,
    presence: PresenceRoster,

    session: RwLock<Option<Session>>,
    prefs: RwLock<DisplayPrefs>,
    shutting_down: AtomicBool,
    next_sweep_ms: AtomicU64,

    commands: mpsc::UnboundedSender<Command>,
    events: EventSender,
}

impl Inner {
    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn session(&self) -> Option<Session> {
        self.session.read().clone()
    }

    fn prefs(&self) -> DisplayPrefs {
        *self.prefs.read()
    }

    /// Queue work for the dispatch task
    fn enqueue(&self, command: Command) -> bool {
        if self.is_shutting_down() && !command.allowed_after_shutdown() {
            debug!("Shutting down, dropping queued work");
            return false;
        }
        self.commands.send(command).is_ok()
    }

    fn refresh_gauges(&self) {
        self.metrics
            .connection_state
            .set(self.connection.state().as_gauge());
        self.metrics
            .channels_active
            .set(self.registry.active_count() as i64);
    }

    fn key_material(&self, topic: &TopicId) -> KeyMaterial {
        match (topic.kind(), self.session()) {
            (Some(MessageKind::Private), Some(session)) => KeyMaterial::partition(session.world),
            _ => KeyMaterial::shared(self.config.keys.shared_secret.as_str()),
        }
    }

    fn start(&self, identity: &str) {
        if self.is_shutting_down() {
            return;
        }
        let identity = canonical_name(identity);
        if identity.is_empty() {
            warn!("Refusing to connect without an identity");
            return;
        }

        self.connection.release_hold();
        if let Some(epoch) = self.connection.begin_connect() {
            info!("Connecting as '{}'", identity);
            self.enqueue(Command::Connect { identity, epoch });
            self.refresh_gauges();
        }
    }

    /// Close on the caller's request, leaving the current world first
    fn close(&self) {
        let farewell = self
            .session()
            .and_then(|session| self.seal_presence(&session, PresenceAction::Leave));
        self.close_with(farewell);
    }

    /// Close and stay closed until the next [`Inner::start`]
    fn close_with(&self, farewell: Option<(TopicId, Bytes)>) {
        self.connection.hold();
        let handle = self.connection.take(ConnectionState::Disconnected);
        self.registry.mark_all_pending();
        self.presence.clear();
        self.refresh_gauges();

        if let Some(connection) = handle {
            info!("Closing connection");
            self.enqueue(Command::Close {
                connection,
                farewell,
            });
        }
    }

    fn subscribe(&self, topic: &TopicId, material: &KeyMaterial) {
        if self
            .registry
            .request(topic, material, self.clock.now_millis())
        {
            debug!("Subscribe to '{}' queued", topic);
            self.enqueue(Command::Subscribe {
                topic: topic.clone(),
            });
        }
    }

    fn unsubscribe(&self, topic: &TopicId) {
        if !self.registry.release(topic) {
            return;
        }
        if self.connection.handle().is_none() {
            self.registry.remove_released(topic);
            self.refresh_gauges();
        } else {
            self.enqueue(Command::Unsubscribe {
                topic: topic.clone(),
            });
        }
    }

    fn reclaim(&self, threshold: Duration, keep: &[TopicId]) -> usize {
        let released =
            self.registry
                .release_idle(millis(threshold), self.clock.now_millis(), keep);
        let count = released.len();
        for topic in released {
            if self.connection.handle().is_none() {
                self.registry.remove_released(&topic);
            } else {
                self.enqueue(Command::Unsubscribe { topic });
            }
        }
        if count > 0 {
            self.metrics.channels_reclaimed_total.inc_by(count as u64);
            info!("Reclaimed {} idle channel(s)", count);
        }
        count
    }

    fn is_connected(&self) -> bool {
        if self.connection.state() != ConnectionState::Connected {
            return false;
        }
        let status = self.registry.snapshot_status();
        !status.is_empty() && status.values().all(|active| *active)
    }

    /// Route a failure to the single, cooldown-gated notification path
    fn report(&self, error: RelayError) {
        let Some(transport) = error.transport_error() else {
            debug!("{}", error);
            return;
        };

        let partition = self
            .session
            .read()
            .as_ref()
            .map(|s| s.world.to_string())
            .unwrap_or_else(|| "global".to_string());
        if !self.filter.claim_error_slot(&partition) {
            debug!("Notification for partition {} suppressed: {}", partition, error);
            return;
        }

        let class = ErrorClass::classify(transport);
        let severity = match class {
            ErrorClass::Capacity => Severity::Warning,
            ErrorClass::Generic => Severity::Error,
        };
        self.metrics.notifications_total.inc();
        self.sink.on_notification(class.user_message(), severity);
    }
}

/// Builder for [`RelayCore`]
pub struct RelayBuilder {
    config: RelayConfig,
    connector: Arc<dyn Connector>,
    sink: Arc<dyn HostSink>,
    players: Arc<dyn PlayerLookup>,
    supporters: Arc<dyn SupporterDirectory>,
    clock: Arc<dyn Clock>,
    supervisor: bool,
}

impl RelayBuilder {
    pub fn players(mut self, players: Arc<dyn PlayerLookup>) -> Self {
        self.players = players;
        self
    }

    pub fn supporters(mut self, supporters: Arc<dyn SupporterDirectory>) -> Self {
        self.supporters = supporters;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Do not spawn the supervisor; the host drives [`RelayCore::tick`]
    pub fn without_supervisor(mut self) -> Self {
        self.supervisor = false;
        self
    }

    /// Spawn the relay tasks. Must be called inside a Tokio runtime.
    ///
    /// The configuration is expected to be validated already; an invalid one
    /// is logged and used as is, with the supervisor interval raised to its
    /// floor.
    pub fn build(self) -> RelayCore {
        if let Err(e) = self.config.validate() {
            warn!("Building relay with invalid configuration: {}", e);
        }

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();

        let prefs = DisplayPrefs::from(&self.config.display);
        let inner = Arc::new(Inner {
            filter: ChatFilter::new(&self.config.limits, self.clock.clone()),
            registry: ChannelRegistry::new(),
            connection: ConnectionManager::new(self.config.reconnect.clone()),
            metrics: RelayMetrics::new(),
            presence: PresenceRoster::new(),
            session: RwLock::new(None),
            prefs: RwLock::new(prefs),
            shutting_down: AtomicBool::new(false),
            next_sweep_ms: AtomicU64::new(
                self.clock
                    .now_millis()
                    .saturating_add(millis(self.config.limits.sweep_interval)),
            ),
            commands,
            events,
            config: self.config,
            clock: self.clock,
            connector: self.connector,
            sink: self.sink,
            players: self.players,
            supporters: self.supporters,
        });

        let dispatcher = tokio::spawn(dispatch::run(inner.clone(), command_rx, event_rx));
        let supervisor = self.supervisor.then(|| {
            tokio::spawn(supervisor::run(
                inner.clone(),
                supervisor::period(inner.config.reconnect.supervisor_interval),
            ))
        });

        RelayCore {
            inner,
            dispatcher: Mutex::new(Some(dispatcher)),
            supervisor: Mutex::new(supervisor),
        }
    }
}

/// The relay engine
pub struct RelayCore {
    inner: Arc<Inner>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl RelayCore {
    pub fn builder(
        config: RelayConfig,
        connector: Arc<dyn Connector>,
        sink: Arc<dyn HostSink>,
    ) -> RelayBuilder {
        RelayBuilder {
            config,
            connector,
            sink,
            players: Arc::new(NoPlayers),
            supporters: Arc::new(SupporterRoster::new()),
            clock: Arc::new(SystemClock::new()),
            supervisor: true,
        }
    }

    // Connection lifecycle

    /// Begin connecting as `identity`. No-op while connecting or connected.
    pub fn start(&self, identity: &str) {
        self.inner.start(identity);
    }

    /// Drop the connection. Returns at once; the link closes in the background.
    ///
    /// The supervisor leaves a closed connection alone until the next
    /// [`RelayCore::start`] or login.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Connected, with every wanted channel attached
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Stop accepting work, close the connection and wait for queued work
    /// to drain.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Relay shutting down");

        let supervisor = self.supervisor.lock().take();
        if let Some(handle) = supervisor {
            handle.abort();
        }

        // Queued work drains on the live connection before it is closed
        let (reply, drained) = oneshot::channel();
        if self.inner.commands.send(Command::Flush { reply }).is_ok() {
            let _ = drained.await;
        }

        self.inner.close();
        let _ = self.inner.commands.send(Command::Shutdown);

        let dispatcher = self.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            let _ = handle.await;
        }
    }

    /// Run one supervisor pass now
    pub fn tick(&self) {
        self.inner.supervise_once();
    }

    /// Wait until everything queued so far has been processed
    pub async fn flush(&self) {
        let (reply, rx) = oneshot::channel();
        if self.inner.enqueue(Command::Flush { reply }) {
            let _ = rx.await;
        }
    }

    // Channels

    /// Attach `topic` with the key its kind calls for
    pub fn subscribe(&self, topic: &TopicId) {
        let material = self.inner.key_material(topic);
        self.inner.subscribe(topic, &material);
    }

    /// Attach `topic` with explicit key material
    pub fn subscribe_with(&self, topic: &TopicId, material: &KeyMaterial) {
        self.inner.subscribe(topic, material);
    }

    pub fn unsubscribe(&self, topic: &TopicId) {
        self.inner.unsubscribe(topic);
    }

    /// Refresh the idle timer of a channel
    pub fn mark_active(&self, topic: &TopicId) {
        self.inner
            .registry
            .mark_active(topic.as_str(), self.inner.clock.now_millis());
    }

    /// Detach every channel idle for at least `threshold`
    pub fn reclaim_idle(&self, threshold: Duration) -> usize {
        self.inner.reclaim(threshold, &[])
    }

    pub fn snapshot_status(&self) -> HashMap<String, bool> {
        self.inner.registry.snapshot_status()
    }

    // Pipelines

    /// Validate and queue an outbound message
    pub fn publish(
        &self,
        kind: MessageKind,
        body: &str,
        topic: TopicId,
        recipient: Option<&str>,
    ) -> Result<PublishReceipt, Rejection> {
        self.inner.publish(kind, body, topic, recipient)
    }

    /// Feed a raw payload through the receive pipeline, as if it arrived
    /// on `channel`
    pub fn receive(&self, channel: &str, payload: &[u8]) {
        self.inner.on_message(channel, payload);
    }

    // Host events

    /// The local player logged in (or switched account)
    pub fn on_login_state_changed(&self, identity: &str, world: u16, account_icon: &str) {
        let session = Session::new(identity, world, account_icon);
        if session.identity.is_empty() {
            warn!("Ignoring login without a player name");
            return;
        }

        let previous = self.inner.session.write().replace(session.clone());
        if let Some(previous) = previous {
            if previous.identity != session.identity {
                info!(
                    "Identity changed from '{}' to '{}'",
                    previous.identity, session.identity
                );
                self.inner.close_with(
                    self.inner
                        .seal_presence(&previous, PresenceAction::Leave),
                );
                self.inner.registry.clear();
            } else if previous.world != session.world {
                self.switch_world(&previous, session.world);
            }
        }

        info!("Logged in as '{}' on world {}", session.identity, world);
        if let Some(inbox) = session.inbox() {
            self.inner
                .subscribe(&inbox, &KeyMaterial::partition(session.world));
        }
        self.subscribe(&TopicId::world(session.world));
        self.subscribe(&session.presence_topic());
        self.inner.start(&session.identity);
    }

    pub fn on_logout(&self) {
        let Some(previous) = self.inner.session.write().take() else {
            return;
        };
        info!("Logged out");
        self.inner
            .close_with(self.inner.seal_presence(&previous, PresenceAction::Leave));
        self.inner.registry.clear();
        self.inner.connection.reset_backoff();
        self.inner.refresh_gauges();
    }

    pub fn on_world_changed(&self, world: u16) {
        let previous = {
            let mut guard = self.inner.session.write();
            let Some(session) = guard.as_mut() else {
                return;
            };
            if session.world == world {
                return;
            }
            let previous = session.clone();
            session.world = world;
            previous
        };

        self.switch_world(&previous, world);
        self.subscribe(&TopicId::world(world));
        self.subscribe(&TopicId::presence(world));
    }

    fn switch_world(&self, previous: &Session, world: u16) {
        info!("World changed from {} to {}", previous.world, world);
        // Leave goes out before the old presence channel is released
        self.inner.queue_presence(previous, PresenceAction::Leave);
        self.inner.unsubscribe(&TopicId::world(previous.world));
        self.inner.unsubscribe(&previous.presence_topic());
        self.inner.presence.clear();
        if let Some(inbox) = previous.inbox() {
            self.inner
                .registry
                .rekey(&inbox, &KeyMaterial::partition(world));
        }
    }

    /// Joined (`Some(owner)`) or left (`None`) a friends chat
    pub fn on_group_membership_changed(&self, owner: Option<&str>) {
        let owner = owner.map(canonical_name).filter(|o| !o.is_empty());
        let (old, new) = {
            let mut guard = self.inner.session.write();
            let Some(session) = guard.as_mut() else {
                return;
            };
            if session.group_owner == owner {
                return;
            }
            let old = session.group_topic();
            session.group_owner = owner;
            (old, session.group_topic())
        };
        self.swap_topic(old, new);
    }

    /// Joined (`Some(name)`) or left (`None`) a clan channel
    pub fn on_clan_changed(&self, clan: Option<&str>) {
        let clan = clan
            .map(|c| remove_tags(c).trim().to_string())
            .filter(|c| !c.is_empty());
        let (old, new) = {
            let mut guard = self.inner.session.write();
            let Some(session) = guard.as_mut() else {
                return;
            };
            if session.clan == clan {
                return;
            }
            let old = session.clan_topic();
            session.clan = clan;
            (old, session.clan_topic())
        };
        self.swap_topic(old, new);
    }

    fn swap_topic(&self, old: Option<TopicId>, new: Option<TopicId>) {
        if let Some(old) = old {
            debug!("Leaving '{}'", old);
            self.inner.unsubscribe(&old);
        }
        if let Some(new) = new {
            debug!("Joining '{}'", new);
            self.subscribe(&new);
        }
    }

    /// The local player sent a chat line
    ///
    /// Records the local echo so the broker's copy is suppressed, then
    /// publishes to the topic the kind implies. `topic_hint` overrides the
    /// group or clan channel name (e.g. a guest clan) and is normalised the
    /// same way as a joined group owner or clan name.
    pub fn on_local_message_composed(
        &self,
        kind: MessageKind,
        body: &str,
        sender: &str,
        recipient: Option<&str>,
        topic_hint: Option<&str>,
    ) -> Result<PublishReceipt, Rejection> {
        let body = remove_tags(body);
        let session = self.inner.session().ok_or(Rejection::NotLoggedIn)?;
        self.inner
            .filter
            .should_display(&canonical_name(sender), &body, true);

        let recipient = recipient.map(canonical_name).filter(|r| !r.is_empty());
        let (scope, to) = match kind {
            MessageKind::World => (session.world.to_string(), None),
            MessageKind::Private => {
                let recipient = recipient.ok_or(Rejection::UnknownRecipient)?;
                (recipient.clone(), Some(recipient))
            }
            MessageKind::FriendsGroup => {
                let scope = topic_hint
                    .map(canonical_name)
                    .filter(|h| !h.is_empty())
                    .or(session.group_owner.clone())
                    .ok_or(Rejection::UnknownRecipient)?;
                let to = recipient.unwrap_or_else(|| scope.clone());
                (scope, Some(to))
            }
            MessageKind::Clan => {
                let scope = topic_hint
                    .map(|h| remove_tags(h).trim().to_string())
                    .filter(|h| !h.is_empty())
                    .or(session.clan.clone())
                    .ok_or(Rejection::UnknownRecipient)?;
                (scope.clone(), Some(scope))
            }
        };

        let topic = TopicId::new(kind, &scope).map_err(|e| {
            debug!("No topic for {} message to '{}': {}", kind, scope, e);
            Rejection::UnknownRecipient
        })?;
        self.inner.publish(kind, &body, topic, to.as_deref())
    }

    /// The host showed a chat line that did not come through the relay
    ///
    /// Returns `false` when the line repeats the sender's previous one and
    /// should be hidden.
    pub fn on_native_message(&self, sender: &str, body: &str) -> bool {
        self.inner
            .filter
            .should_display(&canonical_name(sender), &remove_tags(body), true)
    }

    /// Whether `name` is known to be below the configured combat level
    ///
    /// Consults the cache first, then the host's visible players, caching
    /// what it finds.
    pub fn is_under_combat_level(&self, name: &str) -> bool {
        let key = canonical_name(name);
        let threshold = self.inner.prefs().min_combat_level;
        if let Some(level) = self.inner.filter.combat().get(&key) {
            return level < threshold;
        }
        match self.inner.players.visible_combat_level(&key) {
            Some(level) => {
                self.inner.filter.record_combat_level(&key, level);
                level < threshold
            }
            None => false,
        }
    }

    // Preferences and introspection

    pub fn prefs(&self) -> DisplayPrefs {
        self.inner.prefs()
    }

    /// Swap display preferences; the combat level is clamped to its range
    pub fn update_prefs(&self, mut prefs: DisplayPrefs) {
        prefs.min_combat_level = prefs
            .min_combat_level
            .clamp(*COMBAT_LEVEL_RANGE.start(), *COMBAT_LEVEL_RANGE.end());
        *self.inner.prefs.write() = prefs;
        debug!("Display preferences updated: {:?}", prefs);
    }

    pub fn session(&self) -> Option<Session> {
        self.inner.session()
    }

    /// Whether `name` announced itself on the current world's presence
    /// channel; the host badges such players
    pub fn is_relay_member(&self, name: &str) -> bool {
        self.inner.presence.contains(name)
    }

    /// Relay users on the current world, sorted
    pub fn relay_members(&self) -> Vec<String> {
        self.inner.presence.members()
    }

    /// Prefix a menu target naming `player` with the relay badge when the
    /// player is a relay member
    pub fn decorate_target(&self, target: &str, player: &str) -> String {
        if self.is_relay_member(player) {
            format!("{}{}", BROADCAST_BADGE, target)
        } else {
            target.to_string()
        }
    }

    pub fn metrics(&self) -> &RelayMetrics {
        &self.inner.metrics
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            state: self.inner.connection.state(),
            reconnect_attempts: self.inner.connection.attempts(),
            channels: self.inner.registry.snapshot_status(),
            filter: self.inner.filter.stats(),
            presence_members: self.inner.presence.len(),
        }
    }
}

impl Drop for RelayCore {
    fn drop(&mut self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
        let _ = self.inner.commands.send(Command::Shutdown);
    }
}
