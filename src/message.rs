//! Wire format: the `Envelope` (spec.md §3) and its two serializations
//! (spec.md §6 — object form and the canonical Phoenix v2 array form).

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved inbound events (spec.md §6).
pub const PHX_REPLY: &str = "phx_reply";
pub const PHX_CLOSE: &str = "phx_close";
pub const PHX_ERROR: &str = "phx_error";

/// Reserved outbound events (spec.md §6).
pub const PHX_JOIN: &str = "phx_join";
pub const PHX_LEAVE: &str = "phx_leave";

/// The heartbeat topic/event (spec.md §6).
pub const HEARTBEAT_TOPIC: &str = "phoenix";
pub const HEARTBEAT_EVENT: &str = "heartbeat";

/// A strictly-monotonic per-socket identifier, rendered as a string on the wire.
///
/// Used both as a push's correlation `ref` and, when that push performed a
/// join, as the channel's `joinRef`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutboundRequestId(u64);

impl OutboundRequestId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    /// Only for unit tests that need to construct a specific id.
    pub fn for_test(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for OutboundRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for OutboundRequestId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for OutboundRequestId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // Accept both a quoted string and a bare number: real Phoenix servers
        // always send strings, but being lenient here costs nothing.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Str(String),
            Num(u64),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Str(s) => s.parse().map(OutboundRequestId).map_err(serde::de::Error::custom),
            Repr::Num(n) => Ok(OutboundRequestId(n)),
        }
    }
}

/// The wire unit exchanged over the transport (spec.md §3 "Envelope").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub join_ref: Option<OutboundRequestId>,
    #[serde(rename = "ref")]
    pub reference: Option<OutboundRequestId>,
    pub topic: String,
    pub event: String,
    pub payload: Value,
}

impl Envelope {
    pub(crate) fn new(
        join_ref: Option<OutboundRequestId>,
        reference: Option<OutboundRequestId>,
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            join_ref,
            reference,
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }

    /// `true` if a channel currently at `join_ref` would accept this envelope:
    /// matching topic AND matching-or-null join_ref (spec.md §4.1 "isMember").
    pub(crate) fn is_member(&self, topic: &str, channel_join_ref: Option<OutboundRequestId>) -> bool {
        if self.topic != topic {
            return false;
        }

        match self.join_ref {
            None => true,
            Some(r) => Some(r) == channel_join_ref,
        }
    }
}

/// Which wire encoding to use. spec.md §6: "either may be chosen by configuration."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Serializer {
    /// `{joinRef,ref,topic,event,payload}`.
    #[default]
    V1,
    /// `[joinRef,ref,topic,event,payload]` — the canonical Phoenix v2 serializer.
    V2,
}

impl Serializer {
    pub(crate) fn encode(self, envelope: &Envelope) -> serde_json::Result<String> {
        match self {
            Serializer::V1 => serde_json::to_string(envelope),
            Serializer::V2 => {
                let array = (
                    envelope.join_ref,
                    envelope.reference,
                    &envelope.topic,
                    &envelope.event,
                    &envelope.payload,
                );
                serde_json::to_string(&array)
            }
        }
    }

    pub(crate) fn decode(self, text: &str) -> serde_json::Result<Envelope> {
        match self {
            Serializer::V1 => serde_json::from_str(text),
            Serializer::V2 => {
                let (join_ref, reference, topic, event, payload): (
                    Option<OutboundRequestId>,
                    Option<OutboundRequestId>,
                    String,
                    String,
                    Value,
                ) = serde_json::from_str(text)?;
                Ok(Envelope::new(join_ref, reference, topic, event, payload))
            }
        }
    }
}

/// The parsed shape of a `phx_reply` payload (spec.md §6).
#[derive(Debug, Clone, Deserialize)]
pub struct ReplyPayload {
    pub status: String,
    #[serde(default)]
    pub response: Value,
}

/// Known error reasons a server can send in a `phx_reply` with `status: "error"`.
///
/// Anything not recognized falls back to `Other`, carrying the raw value so
/// callers can still inspect it.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorReply {
    UnmatchedTopic,
    InvalidVersion,
    Disabled,
    Other(Value),
}

impl fmt::Display for ErrorReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorReply::UnmatchedTopic => write!(f, "unmatched topic"),
            ErrorReply::InvalidVersion => write!(f, "invalid version"),
            ErrorReply::Disabled => write!(f, "disabled"),
            ErrorReply::Other(v) => write!(f, "{v}"),
        }
    }
}

impl ErrorReply {
    pub(crate) fn from_response(response: &Value) -> Self {
        let reason = response.get("reason").and_then(Value::as_str);

        match reason {
            Some("unmatched topic") => ErrorReply::UnmatchedTopic,
            Some("invalid_version") => ErrorReply::InvalidVersion,
            Some("disabled") => ErrorReply::Disabled,
            _ => ErrorReply::Other(response.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_v1_inbound_message() {
        let msg = r#"{
            "join_ref": null,
            "ref": null,
            "topic": "room:lobby",
            "event": "shout",
            "payload": {"hello": "world"}
        }"#;

        let envelope = Serializer::V1.decode(msg).unwrap();

        assert_eq!(envelope.topic, "room:lobby");
        assert_eq!(envelope.reference, None);
        assert_eq!(envelope.payload, json!({"hello": "world"}));
    }

    #[test]
    fn round_trips_v2_array_form() {
        let envelope = Envelope::new(
            Some(OutboundRequestId::for_test(2)),
            Some(OutboundRequestId::for_test(3)),
            "rooms:lobby",
            "msg",
            json!({"body": "hi"}),
        );

        let encoded = Serializer::V2.encode(&envelope).unwrap();
        assert_eq!(encoded, r#"["2","3","rooms:lobby","msg",{"body":"hi"}]"#);

        let decoded = Serializer::V2.decode(&encoded).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn is_member_drops_stale_join_ref() {
        let envelope = Envelope::new(
            Some(OutboundRequestId::for_test(5)),
            None,
            "rooms:lobby",
            "shout",
            Value::Null,
        );

        assert!(!envelope.is_member("rooms:lobby", Some(OutboundRequestId::for_test(7))));
        assert!(envelope.is_member("rooms:lobby", Some(OutboundRequestId::for_test(5))));
        assert!(!envelope.is_member("rooms:other", Some(OutboundRequestId::for_test(5))));
    }

    #[test]
    fn is_member_accepts_null_join_ref() {
        let envelope = Envelope::new(None, None, "rooms:lobby", "shout", Value::Null);

        assert!(envelope.is_member("rooms:lobby", Some(OutboundRequestId::for_test(1))));
    }

    #[test]
    fn error_reply_recognizes_known_reasons() {
        assert_eq!(
            ErrorReply::from_response(&json!({"reason": "unmatched topic"})),
            ErrorReply::UnmatchedTopic
        );
        assert_eq!(
            ErrorReply::from_response(&json!({"reason": "invalid_version"})),
            ErrorReply::InvalidVersion
        );
        assert!(matches!(
            ErrorReply::from_response(&json!({"reason": "bad reply"})),
            ErrorReply::Other(_)
        ));
    }
}
