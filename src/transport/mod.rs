//! Broker Transport
//!
//! The relay talks to the external pub/sub broker through two traits:
//! a [`Connector`] that opens links and a [`Connection`] that carries
//! subscribe/unsubscribe/publish for one link. Inbound traffic and link
//! state changes come back as [`TransportEvent`]s over an mpsc channel, so
//! nothing in the broker's I/O path ever touches relay state directly.
//!
//! Implementations:
//! - [`MqttConnector`]: MQTT v3.1.1 over TCP
//! - [`MemoryBroker`]: in-process fan-out with fault injection

pub mod codec;
mod memory;
mod mqtt;

pub use memory::MemoryBroker;
pub use mqtt::{MqttConnection, MqttConnector, MqttOptions};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Error type for transport operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Link to the broker failed or was lost
    ConnectionLost(String),
    /// Broker refused the operation, with its error code when it gave one
    Rejected { code: Option<u32>, message: String },
    /// Operation timed out
    Timeout,
    /// The connection was closed locally
    Closed,
    /// Other error
    Other(String),
}

impl TransportError {
    /// Broker error code, if the broker supplied one
    pub fn code(&self) -> Option<u32> {
        match self {
            TransportError::Rejected { code, .. } => *code,
            _ => None,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            TransportError::Rejected {
                code: Some(code),
                message,
            } => write!(f, "Rejected ({}): {}", code, message),
            TransportError::Rejected { code: None, message } => {
                write!(f, "Rejected: {}", message)
            }
            TransportError::Timeout => write!(f, "Operation timed out"),
            TransportError::Closed => write!(f, "Connection closed"),
            TransportError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::ConnectionLost(e.to_string())
    }
}

/// Link state reported by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Link is up
    Connected,
    /// Link dropped; the broker may still hold our session
    Disconnected,
    /// Link has been down long enough that the broker dropped our session
    Suspended,
    /// Link failed and will not recover on its own
    Failed,
}

/// Event delivered from a transport to the relay
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A message arrived on a subscribed channel
    Message {
        epoch: u64,
        channel: String,
        payload: Bytes,
    },
    /// The link changed state
    StateChanged {
        epoch: u64,
        state: LinkState,
        error: Option<TransportError>,
    },
}

impl TransportEvent {
    /// Connection epoch the event belongs to
    pub fn epoch(&self) -> u64 {
        match self {
            TransportEvent::Message { epoch, .. } => *epoch,
            TransportEvent::StateChanged { epoch, .. } => *epoch,
        }
    }
}

/// Sender half handed to a transport for its events
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Opens broker links
///
/// A successful `connect` means the link is up. Later state changes
/// (drops, failures) are reported through `events`, tagged with `epoch`.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        client_id: &str,
        epoch: u64,
        events: EventSender,
    ) -> Result<Arc<dyn Connection>, TransportError>;
}

/// One live broker link
#[async_trait]
pub trait Connection: Send + Sync {
    /// Attach a channel; resolves once the broker acknowledged it
    async fn subscribe(&self, channel: &str) -> Result<(), TransportError>;

    /// Detach a channel
    async fn unsubscribe(&self, channel: &str) -> Result<(), TransportError>;

    /// Publish a payload to a channel
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Close the link. Idempotent.
    async fn close(&self);

    /// Whether the link is still usable
    fn is_open(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            TransportError::Rejected {
                code: Some(42910),
                message: "rate limit".into()
            }
            .to_string(),
            "Rejected (42910): rate limit"
        );
        assert_eq!(
            TransportError::Rejected {
                code: None,
                message: "nope".into()
            }
            .to_string(),
            "Rejected: nope"
        );
        assert_eq!(TransportError::Closed.to_string(), "Connection closed");
    }

    #[test]
    fn test_error_code() {
        assert_eq!(
            TransportError::Rejected {
                code: Some(5),
                message: String::new()
            }
            .code(),
            Some(5)
        );
        assert_eq!(TransportError::Timeout.code(), None);
    }

    #[test]
    fn test_event_epoch() {
        let msg = TransportEvent::Message {
            epoch: 3,
            channel: "w:301".into(),
            payload: Bytes::new(),
        };
        let state = TransportEvent::StateChanged {
            epoch: 7,
            state: LinkState::Disconnected,
            error: None,
        };
        assert_eq!(msg.epoch(), 3);
        assert_eq!(state.epoch(), 7);
    }
}
