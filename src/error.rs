//! Relay error taxonomy
//!
//! Validation rejections and parse errors are expected outcomes handled
//! silently by the pipelines. Transport-level failures are classified and
//! funnelled into a single, cooldown-gated user notification.

use std::fmt;

use crate::transport::TransportError;

/// Why a publish or an inbound message was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rejection {
    /// Body was empty or whitespace
    EmptyBody,
    /// No local identity (not logged in)
    NotLoggedIn,
    /// Display preferences forbid broadcasting
    ReadOnly,
    /// Body is a known low-value phrase
    Spam,
    /// Sender name carries the staff marker
    ReservedName,
    /// Sender published again inside the minimum interval
    RateLimited,
    /// Whisper target is not on the friends list or is offline
    UnknownRecipient,
    /// The relay is shutting down
    ShuttingDown,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::EmptyBody => "empty_body",
            Rejection::NotLoggedIn => "not_logged_in",
            Rejection::ReadOnly => "read_only",
            Rejection::Spam => "spam",
            Rejection::ReservedName => "reserved_name",
            Rejection::RateLimited => "rate_limited",
            Rejection::UnknownRecipient => "unknown_recipient",
            Rejection::ShuttingDown => "shutting_down",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the relay core
#[derive(Debug)]
pub enum RelayError {
    /// Could not establish the broker connection
    TransportConnect(TransportError),
    /// Attaching a channel failed
    ChannelSubscribe {
        topic: String,
        source: TransportError,
    },
    /// Publishing to a channel failed
    Publish {
        topic: String,
        source: TransportError,
    },
    /// Inbound payload could not be decoded
    Parse(String),
    /// Message refused by a local rule
    Validation(Rejection),
}

impl RelayError {
    /// The transport error behind this failure, if any
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            RelayError::TransportConnect(e) => Some(e),
            RelayError::ChannelSubscribe { source, .. } => Some(source),
            RelayError::Publish { source, .. } => Some(source),
            RelayError::Parse(_) | RelayError::Validation(_) => None,
        }
    }

    /// Whether this error should reach the user at all
    pub fn is_user_visible(&self) -> bool {
        self.transport_error().is_some()
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::TransportConnect(e) => write!(f, "Connect failed: {}", e),
            RelayError::ChannelSubscribe { topic, source } => {
                write!(f, "Subscribe to '{}' failed: {}", topic, source)
            }
            RelayError::Publish { topic, source } => {
                write!(f, "Publish to '{}' failed: {}", topic, source)
            }
            RelayError::Parse(msg) => write!(f, "Parse error: {}", msg),
            RelayError::Validation(r) => write!(f, "Rejected: {}", r),
        }
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self.transport_error() {
            Some(e) => Some(e),
            None => None,
        }
    }
}

impl From<Rejection> for RelayError {
    fn from(r: Rejection) -> Self {
        RelayError::Validation(r)
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Parse(e.to_string())
    }
}

/// Broad class of a transport failure, used to pick the user message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The broker is refusing work because of a quota, rate or capacity limit
    Capacity,
    /// Anything else
    Generic,
}

const CAPACITY_KEYWORDS: [&str; 5] = ["capacity", "limit", "quota", "rate", "too many"];

impl ErrorClass {
    /// Classify a transport failure by its code and text
    pub fn classify(error: &TransportError) -> Self {
        if let Some(code) = error.code() {
            // 429xx: broker-side rate/quota codes
            if code / 100 == 429 || code == 429 {
                return ErrorClass::Capacity;
            }
        }

        let text = error.to_string().to_lowercase();
        if CAPACITY_KEYWORDS.iter().any(|k| text.contains(k)) {
            ErrorClass::Capacity
        } else {
            ErrorClass::Generic
        }
    }

    /// Human-readable notification for this class
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorClass::Capacity => {
                "Global chat is at capacity right now. Your messages will resume shortly."
            }
            ErrorClass::Generic => {
                "Global chat is temporarily unavailable. It will retry in the background."
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_keywords() {
        let err = TransportError::Rejected {
            code: None,
            message: "Connection limit exceeded for account".to_string(),
        };
        assert_eq!(ErrorClass::classify(&err), ErrorClass::Capacity);

        let err = TransportError::Other("Channel quota reached".to_string());
        assert_eq!(ErrorClass::classify(&err), ErrorClass::Capacity);
    }

    #[test]
    fn test_capacity_codes() {
        let err = TransportError::Rejected {
            code: Some(42910),
            message: "denied".to_string(),
        };
        assert_eq!(ErrorClass::classify(&err), ErrorClass::Capacity);
    }

    #[test]
    fn test_generic_fallback() {
        let err = TransportError::ConnectionLost("socket reset".to_string());
        assert_eq!(ErrorClass::classify(&err), ErrorClass::Generic);
        assert_eq!(ErrorClass::classify(&TransportError::Timeout), ErrorClass::Generic);
    }

    #[test]
    fn test_user_messages_never_leak_details() {
        for class in [ErrorClass::Capacity, ErrorClass::Generic] {
            let msg = class.user_message();
            assert!(!msg.contains("429"));
            assert!(!msg.is_empty());
        }
    }

    #[test]
    fn test_only_transport_errors_are_user_visible() {
        assert!(!RelayError::Validation(Rejection::Spam).is_user_visible());
        assert!(!RelayError::Parse("bad".into()).is_user_visible());
        assert!(RelayError::TransportConnect(TransportError::Timeout).is_user_visible());
    }
}
