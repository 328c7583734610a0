//! Wire format exchanged over a channel.
//!
//! Calls and replies are JSON objects:
//!
//! ```text
//! call:  { "type": "PING",           "payload": [args...], "meta": { "correlationId", "targetTab", "targetFrame", "sourceRealm" } }
//! reply: { "type": "PING_FULFILLED", "payload": result,    "meta": { "correlationId" } }
//!        { "type": "PING_REJECTED",  "payload": error,     "meta": { "correlationId" } }
//! ack:   { "type": "__CROSSREALM_ACK__" }
//! ```

use crate::config::MessagingConfig;
use crate::realm::{FrameId, RealmKind, SenderDescriptor, TabId};
use crate::{MessengerError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::borrow::Cow;

pub const FULFILLED_SUFFIX: &str = "_FULFILLED";
pub const REJECTED_SUFFIX: &str = "_REJECTED";

/// Name of a remote operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallType(Cow<'static, str>);

impl CallType {
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn fulfilled(&self) -> String {
        format!("{}{}", self.0, FULFILLED_SUFFIX)
    }

    pub fn rejected(&self) -> String {
        format!("{}{}", self.0, REJECTED_SUFFIX)
    }
}

impl std::fmt::Display for CallType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&'static str> for CallType {
    fn from(name: &'static str) -> Self {
        Self::from_static(name)
    }
}

/// Opaque token binding a reply to its call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Metadata attached to every call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    pub correlation_id: CorrelationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_tab: Option<TabId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_frame: Option<FrameId>,
    pub source_realm: RealmKind,
}

impl Meta {
    /// Meta for a call addressed to the far side of a channel.
    pub fn new(correlation_id: CorrelationId, target: &SenderDescriptor, source: RealmKind) -> Self {
        Self {
            correlation_id,
            target_tab: target.tab_id,
            target_frame: target.frame_id,
            source_realm: source,
        }
    }
}

/// A call from one realm to a handler in another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    #[serde(rename = "type")]
    pub call_type: CallType,
    #[serde(default)]
    pub payload: Vec<Value>,
    pub meta: Meta,
}

/// How a call settled.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    Fulfilled(Value),
    /// Encoded error, see [`codec`](crate::codec).
    Rejected(Value),
}

/// The answer to a [`CallEnvelope`].
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyEnvelope {
    pub call_type: CallType,
    pub correlation_id: CorrelationId,
    pub outcome: ReplyOutcome,
}

/// Anything that can arrive on a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Call(CallEnvelope),
    Reply(ReplyEnvelope),
    Ack,
}

impl Message {
    pub fn to_value(&self) -> Result<Value> {
        match self {
            Message::Call(call) => Ok(serde_json::to_value(call)?),
            Message::Reply(reply) => {
                let (type_name, payload) = match &reply.outcome {
                    ReplyOutcome::Fulfilled(value) => (reply.call_type.fulfilled(), value),
                    ReplyOutcome::Rejected(error) => (reply.call_type.rejected(), error),
                };
                Ok(json!({
                    "type": type_name,
                    "payload": payload,
                    "meta": { "correlationId": reply.correlation_id },
                }))
            }
            Message::Ack => Ok(json!({ "type": MessagingConfig::ACK_TYPE })),
        }
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut map) = value else {
            return Err(malformed("envelope is not an object"));
        };

        let type_name = match map.remove("type") {
            Some(Value::String(s)) if !s.is_empty() => s,
            _ => return Err(malformed("missing 'type'")),
        };

        if type_name == MessagingConfig::ACK_TYPE {
            return Ok(Message::Ack);
        }

        if let Some(base) = type_name.strip_suffix(FULFILLED_SUFFIX) {
            let (correlation_id, payload) = reply_parts(&mut map)?;
            return Ok(Message::Reply(ReplyEnvelope {
                call_type: CallType::new(base),
                correlation_id,
                outcome: ReplyOutcome::Fulfilled(payload),
            }));
        }

        if let Some(base) = type_name.strip_suffix(REJECTED_SUFFIX) {
            let (correlation_id, payload) = reply_parts(&mut map)?;
            return Ok(Message::Reply(ReplyEnvelope {
                call_type: CallType::new(base),
                correlation_id,
                outcome: ReplyOutcome::Rejected(payload),
            }));
        }

        let payload = match map.remove("payload") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(args)) => args,
            Some(_) => return Err(malformed("call payload must be an argument array")),
        };
        let meta: Meta = map
            .remove("meta")
            .ok_or_else(|| malformed("missing 'meta'"))
            .and_then(|meta| {
                serde_json::from_value(meta).map_err(|e| malformed(&format!("bad meta: {}", e)))
            })?;

        Ok(Message::Call(CallEnvelope {
            call_type: CallType::new(type_name),
            payload,
            meta,
        }))
    }
}

fn reply_parts(map: &mut Map<String, Value>) -> Result<(CorrelationId, Value)> {
    let correlation_id = map
        .get("meta")
        .and_then(|meta| meta.get("correlationId"))
        .and_then(Value::as_str)
        .map(|id| CorrelationId::from(id.to_string()))
        .ok_or_else(|| malformed("reply without 'meta.correlationId'"))?;
    let payload = map.remove("payload").unwrap_or(Value::Null);
    Ok((correlation_id, payload))
}

fn malformed(message: &str) -> MessengerError {
    MessengerError::MalformedEnvelope {
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> SenderDescriptor {
        SenderDescriptor::page("ext", 4, 0)
    }

    #[test]
    fn test_call_wire_shape() {
        let call = Message::Call(CallEnvelope {
            call_type: CallType::from_static("PING"),
            payload: vec![json!(1), json!("two")],
            meta: Meta::new(
                CorrelationId::from("abc".to_string()),
                &page(),
                RealmKind::Controller,
            ),
        });
        let value = call.to_value().unwrap();

        assert_eq!(value["type"], "PING");
        assert_eq!(value["payload"], json!([1, "two"]));
        assert_eq!(value["meta"]["correlationId"], "abc");
        assert_eq!(value["meta"]["targetTab"], 4);
        assert_eq!(value["meta"]["targetFrame"], 0);
        assert_eq!(value["meta"]["sourceRealm"], "controller");

        assert_eq!(Message::from_value(value).unwrap(), call);
    }

    #[test]
    fn test_reply_type_suffixes() {
        let reply = Message::Reply(ReplyEnvelope {
            call_type: CallType::from_static("PING"),
            correlation_id: CorrelationId::from("abc".to_string()),
            outcome: ReplyOutcome::Rejected(json!({"message": "nope"})),
        });
        let value = reply.to_value().unwrap();
        assert_eq!(value["type"], "PING_REJECTED");
        assert_eq!(value["meta"], json!({"correlationId": "abc"}));

        let fulfilled = json!({
            "type": "PING_FULFILLED",
            "payload": {"ok": true},
            "meta": {"correlationId": "abc"}
        });
        match Message::from_value(fulfilled).unwrap() {
            Message::Reply(reply) => {
                assert_eq!(reply.call_type.as_str(), "PING");
                assert_eq!(reply.outcome, ReplyOutcome::Fulfilled(json!({"ok": true})));
            }
            other => panic!("Expected reply, got: {:?}", other),
        }
    }

    #[test]
    fn test_ack_roundtrip() {
        let value = Message::Ack.to_value().unwrap();
        assert_eq!(Message::from_value(value).unwrap(), Message::Ack);
    }

    #[test]
    fn test_malformed_envelopes_are_rejected() {
        for value in [
            json!("PING"),
            json!({"payload": []}),
            json!({"type": "PING", "payload": []}),
            json!({"type": "PING", "payload": 3, "meta": {"correlationId": "a", "sourceRealm": "page"}}),
            json!({"type": "PING_FULFILLED", "payload": 1}),
        ] {
            let result = Message::from_value(value);
            assert!(matches!(result, Err(MessengerError::MalformedEnvelope { .. })));
        }
    }

    #[test]
    fn test_missing_payload_means_no_arguments() {
        let value = json!({
            "type": "PING",
            "meta": {"correlationId": "a", "sourceRealm": "panel"}
        });
        match Message::from_value(value).unwrap() {
            Message::Call(call) => assert!(call.payload.is_empty()),
            other => panic!("Expected call, got: {:?}", other),
        }
    }

    #[test]
    fn test_correlation_ids_are_unique() {
        let a = CorrelationId::generate();
        let b = CorrelationId::generate();
        assert_ne!(a, b);
    }
}
