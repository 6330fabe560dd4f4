use std::time::Duration;

use crate::message::OutboundRequestId;

/// Programmer-error conditions, raised synchronously to the caller that triggered them.
///
/// These never self-heal; they indicate the host application used the API incorrectly.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("channel for topic `{topic}` was pushed to before `join()` was called")]
    NotJoined { topic: String },
    #[error("channel for topic `{topic}` was joined more than once")]
    AlreadyJoinedOnce { topic: String },
    #[error("onMessage hook returned a null payload for a non-null inbound payload on topic `{topic}`")]
    OnMessageReturnedNull { topic: String },
}

/// Top-level error returned by [`crate::Socket`]/[`crate::Channel`]/
/// [`crate::push::Push`] handle methods.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The socket actor task has already stopped (panicked, or its
    /// `JoinHandle` was dropped and it was cancelled), so the command this
    /// handle tried to send could not be delivered.
    #[error("socket actor is gone")]
    ActorStopped,
    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),
}

/// A fault originating in the transport layer.
///
/// Surfaced internally as a transition to `Errored` plus a scheduled
/// reconnect/rejoin; never raised to the caller directly (spec.md §7).
#[derive(Debug)]
pub(crate) enum TransportError {
    WebSocket(tokio_tungstenite::tungstenite::Error),
    Serde(serde_json::Error),
    CloseMessage,
    StreamClosed,
    Connect(std::io::Error),
    Timeout { duration: Duration },
    HeartbeatTimeout,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::WebSocket(e) => write!(f, "websocket error: {e}"),
            TransportError::Serde(e) => write!(f, "failed to deserialize message: {e}"),
            TransportError::CloseMessage => write!(f, "server closed the websocket connection"),
            TransportError::StreamClosed => write!(f, "websocket stream was closed"),
            TransportError::Connect(e) => write!(f, "failed to connect: {e}"),
            TransportError::Timeout { duration } => {
                write!(f, "operation timed out after {duration:?}")
            }
            TransportError::HeartbeatTimeout => write!(f, "heartbeat timeout"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::WebSocket(e) => Some(e),
            TransportError::Serde(e) => Some(e),
            TransportError::Connect(e) => Some(e),
            TransportError::CloseMessage
            | TransportError::StreamClosed
            | TransportError::Timeout { .. }
            | TransportError::HeartbeatTimeout => None,
        }
    }
}

/// Status of a reply delivered to a [`crate::push::Push`]'s receivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyStatus {
    Ok,
    Error,
    Timeout,
}

impl ReplyStatus {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            ReplyStatus::Ok => "ok",
            ReplyStatus::Error => "error",
            ReplyStatus::Timeout => "timeout",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "ok" => Some(Self::Ok),
            "error" => Some(Self::Error),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }
}

pub(crate) fn ref_event(request_id: &OutboundRequestId) -> String {
    format!("chan_reply_{request_id}")
}
