//! Error types for the crossrealm messaging layer.
//!
//! Local failures (closed channels, refused handshakes, malformed frames) and
//! failures reported by a remote handler both surface as [`MessengerError`], so
//! callers of a stub only ever match on one type.

use crate::channel::ChannelId;
use crate::codec::{ErrorCategory, RemoteError};
use crate::realm::EndpointKey;
use thiserror::Error;

/// Main error type for crossrealm operations.
#[derive(Debug, Error)]
pub enum MessengerError {
    // Errors thrown by a handler in another realm
    #[error(transparent)]
    Remote(#[from] RemoteError),

    // Channel lifecycle errors
    #[error("Channel {channel} disconnected before a reply was received")]
    Disconnected { channel: ChannelId },

    #[error("Channel {channel} is closed")]
    ChannelClosed { channel: ChannelId },

    #[error("No channel registered for {endpoint}")]
    NoChannel { endpoint: EndpointKey },

    #[error("Connection for {endpoint} was cleaned up")]
    ConnectionCleanedUp { endpoint: EndpointKey },

    // Handshake errors
    #[error("Connection refused: {reason}")]
    ConnectionRefused { reason: String },

    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(std::time::Duration),

    // Protocol errors
    #[error("Malformed envelope: {message}")]
    MalformedEnvelope { message: String },

    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Too many pending calls ({pending}), refusing new call")]
    TooManyPending { pending: usize },

    #[error("Too many inbound calls in flight ({in_flight}), refusing {call_type}")]
    TooManyInbound { call_type: String, in_flight: usize },

    #[error("Invalid arguments for {call_type}: {message}")]
    InvalidArguments { call_type: String, message: String },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Transport IO errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },
}

/// Result type alias for crossrealm operations.
pub type Result<T> = std::result::Result<T, MessengerError>;

impl From<std::io::Error> for MessengerError {
    fn from(err: std::io::Error) -> Self {
        MessengerError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for MessengerError {
    fn from(err: serde_json::Error) -> Self {
        MessengerError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl MessengerError {
    /// Classify this error for transport across a realm boundary.
    ///
    /// Remote errors keep the category they were encoded with. Local
    /// failures map onto the same closed set so that a handler which awaits
    /// another realm and lets the error propagate forwards a meaningful
    /// category to its own caller.
    pub fn category(&self) -> ErrorCategory {
        match self {
            MessengerError::Remote(remote) => remote.category(),

            MessengerError::Disconnected { .. }
            | MessengerError::ChannelClosed { .. }
            | MessengerError::NoChannel { .. }
            | MessengerError::ConnectionCleanedUp { .. } => ErrorCategory::Disconnected,

            MessengerError::ConnectionRefused { .. } => ErrorCategory::Authentication,

            MessengerError::HandshakeTimeout(_)
            | MessengerError::TooManyPending { .. }
            | MessengerError::TooManyInbound { .. }
            | MessengerError::InvalidArguments { .. }
            | MessengerError::Json { .. }
            | MessengerError::Io { .. } => ErrorCategory::RequestFailed,

            MessengerError::MalformedEnvelope { .. } | MessengerError::FrameTooLarge { .. } => {
                ErrorCategory::Unknown
            }
        }
    }

    /// True if the call failed because its channel went away.
    pub fn is_disconnect(&self) -> bool {
        self.category() == ErrorCategory::Disconnected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MessengerError::FrameTooLarge { size: 10, max: 5 };
        assert_eq!(err.to_string(), "Frame size 10 exceeds maximum 5");
    }

    #[test]
    fn test_disconnect_errors_share_category() {
        let channel = ChannelId::from_raw(7);
        assert!(MessengerError::Disconnected { channel }.is_disconnect());
        assert!(MessengerError::ChannelClosed { channel }.is_disconnect());
        assert!(!MessengerError::TooManyPending { pending: 1 }.is_disconnect());
        let busy = MessengerError::TooManyInbound {
            call_type: "PING".to_string(),
            in_flight: 2,
        };
        assert!(!busy.is_disconnect());
        assert_eq!(busy.category(), ErrorCategory::RequestFailed);
    }

    #[test]
    fn test_remote_error_keeps_its_category() {
        let err = MessengerError::from(RemoteError::not_found("no such recipe"));
        assert_eq!(err.category(), ErrorCategory::NotFound);
        assert_eq!(err.to_string(), "no such recipe");
    }

    #[test]
    fn test_refused_connection_is_authentication() {
        let err = MessengerError::ConnectionRefused {
            reason: "untrusted".into(),
        };
        assert_eq!(err.category(), ErrorCategory::Authentication);
    }
}
