//! Dispatch task
//!
//! All broker I/O runs here, one command at a time, in submission order.
//! Transport events are drained before the next command so that a
//! [`Command::Flush`] observes every event delivered before it was sent.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::connection::ConnectionState;
use super::Inner;
use crate::error::RelayError;
use crate::topic::TopicId;
use crate::transport::{Connection, LinkState, TransportError, TransportEvent};

/// Work for the dispatch task
pub(crate) enum Command {
    /// Open the broker link for a connect attempt
    Connect { identity: String, epoch: u64 },
    /// Close a link that was already detached from the relay, after sending
    /// `farewell` on it
    Close {
        connection: Arc<dyn Connection>,
        farewell: Option<(TopicId, Bytes)>,
    },
    /// Attach a channel if it is still wanted and not yet Active
    Subscribe { topic: TopicId },
    /// Detach a released channel
    Unsubscribe { topic: TopicId },
    /// Send a sealed payload, reporting the outcome on `reply`
    Publish {
        topic: TopicId,
        payload: Bytes,
        reply: oneshot::Sender<bool>,
    },
    /// Barrier: resolves once everything queued before it ran
    Flush { reply: oneshot::Sender<()> },
    /// Stop after draining what is queued
    Shutdown,
}

impl Command {
    /// Commands still accepted once shutdown started
    pub(crate) fn allowed_after_shutdown(&self) -> bool {
        matches!(self, Command::Close { .. } | Command::Shutdown)
    }
}

/// Run the dispatch loop until [`Command::Shutdown`]
pub(crate) async fn run(
    inner: Arc<Inner>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    debug!("Dispatch task started");

    loop {
        tokio::select! {
            biased;

            Some(event) = events.recv() => {
                inner.handle_event(event).await;
            }

            command = commands.recv() => {
                match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => inner.execute(command).await,
                }
            }
        }
    }

    debug!("Dispatch task stopped");
}

impl Inner {
    async fn execute(&self, command: Command) {
        match command {
            Command::Connect { identity, epoch } => self.connect(&identity, epoch).await,
            Command::Close {
                connection,
                farewell,
            } => {
                if let Some((topic, payload)) = farewell {
                    if let Err(e) = connection.publish(topic.as_str(), payload).await {
                        debug!("Leave on '{}' not sent: {}", topic, e);
                    }
                }
                connection.close().await;
                debug!("Closed detached connection");
            }
            Command::Subscribe { topic } => self.attach(&topic).await,
            Command::Unsubscribe { topic } => self.detach(&topic).await,
            Command::Publish {
                topic,
                payload,
                reply,
            } => {
                let ok = self.send(&topic, payload).await;
                self.metrics.publish_finished(ok);
                let _ = reply.send(ok);
            }
            Command::Flush { reply } => {
                let _ = reply.send(());
            }
            Command::Shutdown => {}
        }
    }

    async fn connect(&self, identity: &str, epoch: u64) {
        if !self.connection.is_current(epoch) {
            debug!("Connect attempt {} superseded before it started", epoch);
            return;
        }

        let attempt = self.connection.record_attempt();
        self.metrics.reconnect_attempts_total.inc();
        debug!("Connecting as '{}' (attempt {})", identity, attempt);

        match self
            .connector
            .connect(identity, epoch, self.events.clone())
            .await
        {
            Ok(connection) => match self.connection.install(epoch, connection) {
                Ok(()) => {
                    for topic in self.registry.desired_topics() {
                        self.attach(&topic).await;
                    }
                }
                Err(stale) => {
                    debug!("Connect attempt {} superseded, closing link", epoch);
                    stale.close().await;
                }
            },
            Err(e) => {
                if self.connection.fail_attempt(epoch) {
                    let delay = self.connection.schedule_retry(self.clock.now_millis());
                    warn!(
                        "Connect attempt {} failed: {}; next retry in {:?}",
                        attempt, e, delay
                    );
                    self.report(RelayError::TransportConnect(e));
                }
            }
        }

        self.refresh_gauges();
    }

    async fn attach(&self, topic: &TopicId) {
        if !self.registry.needs_attach(topic) {
            return;
        }
        let Some(connection) = self.connection.handle() else {
            debug!("No connection, '{}' stays pending", topic);
            return;
        };

        match connection.subscribe(topic.as_str()).await {
            Ok(()) => {
                if self.registry.confirm(topic, self.clock.now_millis()) {
                    debug!("Channel '{}' active", topic);
                    if topic.is_presence() {
                        self.announce_presence(topic).await;
                    }
                }
            }
            Err(TransportError::Closed) => {
                debug!("Connection closed while attaching '{}'", topic);
            }
            Err(e) => {
                warn!("Subscribe to '{}' failed: {}", topic, e);
                self.registry.fail(topic);
                self.report(RelayError::ChannelSubscribe {
                    topic: topic.to_string(),
                    source: e,
                });
            }
        }

        self.refresh_gauges();
    }

    async fn detach(&self, topic: &TopicId) {
        if let Some(connection) = self.connection.handle() {
            if let Err(e) = connection.unsubscribe(topic.as_str()).await {
                debug!("Unsubscribe from '{}' failed: {}", topic, e);
            }
        }
        if self.registry.remove_released(topic) {
            debug!("Channel '{}' detached", topic);
        }
        self.refresh_gauges();
    }

    pub(super) async fn send(&self, topic: &TopicId, payload: Bytes) -> bool {
        let Some(connection) = self.connection.handle() else {
            debug!("No connection, dropping publish to '{}'", topic);
            return false;
        };

        match connection.publish(topic.as_str(), payload).await {
            Ok(()) => {
                self.registry
                    .mark_active(topic.as_str(), self.clock.now_millis());
                true
            }
            Err(TransportError::Closed) => {
                debug!("Connection closed while publishing to '{}'", topic);
                false
            }
            Err(e) => {
                warn!("Publish to '{}' failed: {}", topic, e);
                self.report(RelayError::Publish {
                    topic: topic.to_string(),
                    source: e,
                });
                false
            }
        }
    }

    async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Message {
                epoch,
                channel,
                payload,
            } => {
                if !self.connection.is_current(epoch) {
                    debug!("Ignoring message on '{}' from closed connection", channel);
                    return;
                }
                self.on_message(&channel, &payload);
            }
            TransportEvent::StateChanged {
                epoch,
                state,
                error,
            } => self.on_link_state(epoch, state, error).await,
        }
    }

    async fn on_link_state(&self, epoch: u64, state: LinkState, error: Option<TransportError>) {
        if state == LinkState::Connected {
            return;
        }
        let Some(dropped) = self
            .connection
            .drop_link(epoch, ConnectionState::from(state))
        else {
            debug!("Ignoring {:?} from closed connection", state);
            return;
        };

        self.registry.mark_all_pending();
        let delay = self.connection.schedule_retry(self.clock.now_millis());
        match &error {
            Some(e) => warn!("Connection {:?}: {}; retry in {:?}", state, e, delay),
            None => info!("Connection {:?}; retry in {:?}", state, delay),
        }

        if let Some(connection) = dropped {
            connection.close().await;
        }
        if let Some(e) = error {
            self.report(RelayError::TransportConnect(e));
        }
        self.refresh_gauges();
    }
}
