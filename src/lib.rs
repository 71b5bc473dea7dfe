//! ChatRelay - resilient pub/sub chat relay engine
//!
//! Relays game chat (world, private, friends chat, clan) between clients on
//! different worlds through an external publish/subscribe broker. The host
//! application feeds login, world and chat events into a [`RelayCore`] and
//! receives routed messages and notifications through a [`HostSink`].

pub mod clock;
pub mod config;
pub mod error;
pub mod filter;
pub mod logging;
pub mod metrics;
pub mod protocol;
pub mod relay;
pub mod topic;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::RelayConfig;
pub use error::{ErrorClass, Rejection, RelayError};
pub use filter::ChatFilter;
pub use metrics::RelayMetrics;
pub use protocol::{
    InboundEnvelope, MessageKind, OutboundMessage, PresenceAction, PresenceUpdate, WirePayload,
};
pub use relay::{
    DisplayCategory, DisplayPrefs, HostSink, PlayerLookup, PublishReceipt, RelayBuilder,
    RelayCore, RelayStats, RoutedMessage, Severity, SupporterDirectory, SupporterRoster,
};
pub use topic::{ChannelCipher, KeyMaterial, TopicId};
pub use transport::{Connection, Connector, MemoryBroker, MqttConnector, TransportError};
