//! A client-side implementation of a Phoenix-style realtime messaging
//! channel protocol: one multiplexed [`Socket`] carrying many topic-scoped
//! [`Channel`]s, each with its own join/rejoin/leave lifecycle and buffered,
//! correlated [`Push`]es.
//!
//! ```no_run
//! use phoenix_channel::{Socket, SocketOpts};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let url = "wss://example.com/socket/websocket?token=secret".parse()?;
//! let user_agent = phoenix_channel::get_user_agent(None, env!("CARGO_PKG_VERSION"));
//! let (socket, _handle) = phoenix_channel::connect_websocket(url, user_agent, SocketOpts::default())?;
//!
//! socket.connect()?;
//! let lobby = socket.channel("rooms:lobby", serde_json::json!({}))?;
//! lobby.join(None)?.receive(phoenix_channel::ReplyStatus::Ok, |_| {
//!     println!("joined");
//! })?;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod channel;
mod error;
mod get_user_agent;
mod heartbeat;
mod message;
mod push;
mod scheduler;
mod socket;
mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod test_support;

pub use channel::{Channel, ChannelState, SubscriptionId};
pub use error::{Error, ProtocolViolation, ReplyStatus};
pub use get_user_agent::get_user_agent;
pub use message::{ErrorReply, Serializer};
pub use push::Push;
pub use socket::{connect_websocket, spawn, Connector, Socket, SocketOpts};

/// Addresses one registered [`Channel`] within a [`Socket`]'s actor.
///
/// Scoped to a single running socket; never sent over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ChannelId(pub(crate) u64);

/// Addresses one in-flight [`Push`] within its owning channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PushId(pub(crate) u64);
