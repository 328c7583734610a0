//! Error transport across the realm boundary.
//!
//! A handler may fail with any error. Before the failure can travel back to
//! the caller it is flattened into a [`SerializedError`] (name, message,
//! category and an optional cause chain). The receiving realm rebuilds a
//! [`RemoteError`] from whatever JSON arrives, including payloads that were
//! not produced by [`encode`], so decoding never fails.
//!
//! ```text
//! handler error ──encode──▶ {"name","message","category","cause"?} ──decode──▶ RemoteError
//! ```

use crate::config::MessagingConfig;
use crate::error::MessengerError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::error::Error as StdError;
use thiserror::Error;

/// Message used when nothing better can be recovered from a failure.
pub const UNKNOWN_ERROR_MESSAGE: &str = "Unknown error";

/// Closed set of error classifications callers can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    NotFound,
    Authentication,
    RequestFailed,
    Disconnected,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::NotFound => "not-found",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::RequestFailed => "request-failed",
            ErrorCategory::Disconnected => "disconnected",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Lenient parse: unrecognised categories become `Unknown`.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "not-found" => ErrorCategory::NotFound,
            "authentication" => ErrorCategory::Authentication,
            "request-failed" => ErrorCategory::RequestFailed,
            "disconnected" => ErrorCategory::Disconnected,
            _ => ErrorCategory::Unknown,
        }
    }

    /// Default error name for errors that carry no name of their own.
    pub fn error_name(&self) -> &'static str {
        match self {
            ErrorCategory::NotFound => "NotFoundError",
            ErrorCategory::Authentication => "AuthenticationError",
            ErrorCategory::RequestFailed => "RequestError",
            ErrorCategory::Disconnected => "DisconnectedError",
            ErrorCategory::Unknown => "Error",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Wire form of an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedError {
    pub name: String,
    pub message: String,
    pub category: ErrorCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<SerializedError>>,
}

impl SerializedError {
    /// Fallback payload for failures that are not errors at all.
    pub fn unknown() -> Self {
        Self {
            name: ErrorCategory::Unknown.error_name().to_string(),
            message: UNKNOWN_ERROR_MESSAGE.to_string(),
            category: ErrorCategory::Unknown,
            cause: None,
        }
    }

    /// Convert to the JSON value carried in a `_REJECTED` reply.
    pub fn into_value(self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({
                "name": ErrorCategory::Unknown.error_name(),
                "message": UNKNOWN_ERROR_MESSAGE,
                "category": ErrorCategory::Unknown.as_str(),
            })
        })
    }
}

impl From<&RemoteError> for SerializedError {
    fn from(err: &RemoteError) -> Self {
        Self {
            name: err.name.clone(),
            message: err.message.clone(),
            category: err.category,
            cause: err.cause.as_deref().map(|c| Box::new(SerializedError::from(c))),
        }
    }
}

/// An error reconstructed from a `_REJECTED` reply.
///
/// Handlers can also return these directly (through `anyhow`) to pick the
/// category the caller will see.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct RemoteError {
    category: ErrorCategory,
    name: String,
    message: String,
    #[source]
    cause: Option<Box<RemoteError>>,
}

impl RemoteError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            name: category.error_name().to_string(),
            message: message.into(),
            cause: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::NotFound, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Authentication, message)
    }

    pub fn request_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::RequestFailed, message)
    }

    pub fn unknown() -> Self {
        Self::new(ErrorCategory::Unknown, UNKNOWN_ERROR_MESSAGE)
    }

    /// Attach the error that caused this one.
    pub fn with_cause(mut self, cause: RemoteError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&RemoteError> {
        self.cause.as_deref()
    }

    pub fn is_not_found(&self) -> bool {
        self.category == ErrorCategory::NotFound
    }

    pub fn is_authentication(&self) -> bool {
        self.category == ErrorCategory::Authentication
    }

    pub fn is_request_failed(&self) -> bool {
        self.category == ErrorCategory::RequestFailed
    }
}

/// Encode any error into its wire form. Never fails.
pub fn encode(error: &(dyn StdError + 'static)) -> SerializedError {
    encode_at_depth(error, 0)
}

/// Encode the error returned by a handler.
pub fn encode_anyhow(error: &anyhow::Error) -> SerializedError {
    encode(error.as_ref())
}

/// Encode the payload of a panicking handler.
pub fn encode_panic(payload: &(dyn Any + Send)) -> SerializedError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .filter(|s| !s.is_empty());

    match message {
        Some(message) => SerializedError {
            message,
            ..SerializedError::unknown()
        },
        None => SerializedError::unknown(),
    }
}

fn encode_at_depth(error: &(dyn StdError + 'static), depth: usize) -> SerializedError {
    if let Some(remote) = error.downcast_ref::<RemoteError>() {
        return SerializedError::from(remote);
    }
    if let Some(MessengerError::Remote(remote)) = error.downcast_ref::<MessengerError>() {
        return SerializedError::from(remote);
    }

    let category = classify(error);
    let message = error.to_string();
    let cause = if depth + 1 < MessagingConfig::MAX_ERROR_CAUSE_DEPTH {
        error
            .source()
            .map(|source| Box::new(encode_at_depth(source, depth + 1)))
    } else {
        None
    };

    SerializedError {
        name: category.error_name().to_string(),
        message: if message.is_empty() {
            UNKNOWN_ERROR_MESSAGE.to_string()
        } else {
            message
        },
        category,
        cause,
    }
}

/// First classified error in the source chain wins; anything else is a
/// generic request failure.
fn classify(error: &(dyn StdError + 'static)) -> ErrorCategory {
    let mut current = Some(error);
    while let Some(err) = current {
        if let Some(remote) = err.downcast_ref::<RemoteError>() {
            return remote.category();
        }
        if let Some(messenger) = err.downcast_ref::<MessengerError>() {
            return messenger.category();
        }
        current = err.source();
    }
    ErrorCategory::RequestFailed
}

/// Rebuild an error from a `_REJECTED` payload. Never fails.
pub fn decode(payload: &Value) -> RemoteError {
    decode_at_depth(payload, 0)
}

fn decode_at_depth(payload: &Value, depth: usize) -> RemoteError {
    match payload {
        Value::Object(map) => {
            let category = map
                .get("category")
                .and_then(Value::as_str)
                .map(ErrorCategory::from_wire)
                .unwrap_or(ErrorCategory::Unknown);
            let message = map
                .get("message")
                .and_then(Value::as_str)
                .filter(|m| !m.is_empty())
                .unwrap_or(UNKNOWN_ERROR_MESSAGE);
            let name = map
                .get("name")
                .and_then(Value::as_str)
                .filter(|n| !n.is_empty())
                .unwrap_or(category.error_name());
            let cause = if depth + 1 < MessagingConfig::MAX_ERROR_CAUSE_DEPTH {
                map.get("cause")
                    .filter(|c| !c.is_null())
                    .map(|c| Box::new(decode_at_depth(c, depth + 1)))
            } else {
                None
            };

            RemoteError {
                category,
                name: name.to_string(),
                message: message.to_string(),
                cause,
            }
        }
        Value::String(message) if !message.is_empty() => {
            RemoteError::new(ErrorCategory::Unknown, message.clone())
        }
        _ => RemoteError::unknown(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_roundtrip_preserves_message_and_category() {
        for original in [
            RemoteError::not_found("Recipe not found"),
            RemoteError::authentication("Token expired"),
            RemoteError::request_failed("Upstream returned 502"),
        ] {
            let decoded = decode(&encode(&original).into_value());
            assert_eq!(decoded.message(), original.message());
            assert_eq!(decoded.category(), original.category());
            assert_eq!(decoded.name(), original.name());
        }
    }

    #[test]
    fn test_unclassified_error_is_request_failed() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let encoded = encode(&io);
        assert_eq!(encoded.category, ErrorCategory::RequestFailed);
        assert_eq!(encoded.message, "disk on fire");
    }

    #[test]
    fn test_anyhow_context_keeps_inner_category() {
        let err = anyhow::Error::new(RemoteError::authentication("bad token"))
            .context("refreshing credentials");
        let encoded = encode_anyhow(&err);
        assert_eq!(encoded.category, ErrorCategory::Authentication);
        assert_eq!(encoded.message, "refreshing credentials");
        let cause = encoded.cause.expect("context should keep its source");
        assert_eq!(cause.message, "bad token");
    }

    #[test]
    fn test_messenger_error_category_is_encoded() {
        let err = MessengerError::Disconnected {
            channel: crate::channel::ChannelId::from_raw(3),
        };
        assert_eq!(encode(&err).category, ErrorCategory::Disconnected);
    }

    #[test]
    fn test_cause_chain_survives_roundtrip() {
        let err = RemoteError::request_failed("outer").with_cause(RemoteError::not_found("inner"));
        let decoded = decode(&encode(&err).into_value());
        let cause = decoded.cause().expect("cause should be decoded");
        assert_eq!(cause.message(), "inner");
        assert!(cause.is_not_found());
    }

    #[test]
    fn test_decode_malformed_payloads_falls_back_to_unknown() {
        for payload in [json!(null), json!(42), json!([1, 2]), json!({}), json!("")] {
            let decoded = decode(&payload);
            assert_eq!(decoded.category(), ErrorCategory::Unknown);
            assert_eq!(decoded.message(), UNKNOWN_ERROR_MESSAGE);
        }
    }

    #[test]
    fn test_decode_string_payload_keeps_message() {
        let decoded = decode(&json!("plain string thrown"));
        assert_eq!(decoded.message(), "plain string thrown");
        assert_eq!(decoded.category(), ErrorCategory::Unknown);
    }

    #[test]
    fn test_decode_unrecognised_category() {
        let decoded = decode(&json!({"message": "slow", "category": "timeout"}));
        assert_eq!(decoded.category(), ErrorCategory::Unknown);
        assert_eq!(decoded.message(), "slow");
        assert_eq!(decoded.name(), "Error");
    }

    #[test]
    fn test_encode_panic_payloads() {
        let from_str: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(encode_panic(from_str.as_ref()).message, "boom");

        let from_string: Box<dyn Any + Send> = Box::new(String::from("kaboom"));
        assert_eq!(encode_panic(from_string.as_ref()).message, "kaboom");

        let opaque: Box<dyn Any + Send> = Box::new(17_u8);
        let encoded = encode_panic(opaque.as_ref());
        assert_eq!(encoded, SerializedError::unknown());
    }

    #[test]
    fn test_cause_depth_is_bounded() {
        let mut nested = json!({"message": "leaf", "category": "unknown"});
        for i in 0..32 {
            nested = json!({"message": format!("level {i}"), "category": "unknown", "cause": nested});
        }
        let decoded = decode(&nested);
        let mut depth = 1;
        let mut current = decoded.cause();
        while let Some(next) = current {
            depth += 1;
            current = next.cause();
        }
        assert_eq!(depth, MessagingConfig::MAX_ERROR_CAUSE_DEPTH);
    }
}
