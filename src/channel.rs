//! Per-topic state machine: join, rejoin, leave, push buffering, event
//! subscription dispatch (spec.md §4.2).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{Error, ProtocolViolation};
use crate::message::OutboundRequestId;
use crate::push::{PayloadSource, Push, PushState};
use crate::scheduler::{BackoffFn, Scheduler};
use crate::socket::Command;
use crate::{ChannelId, PushId};

/// Identity handle for a subscription registered via [`Channel::on`].
///
/// Removal is by this handle, not by event name, so multiple subscribers per
/// event can be managed independently (spec.md §3 "Subscription").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

/// The channel's lifecycle state (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Joining,
    Joined,
    Leaving,
    Errored,
}

/// A callback registered via [`Channel::on`]. Runs on every matching event,
/// in registration order, until removed.
pub(crate) type Binding = Box<dyn FnMut(&Value) + Send + 'static>;

/// The `onMessage` hook (spec.md §4.2): runs once per inbound event, before
/// fan-out to `on()` subscribers, and may rewrite the payload they see.
pub(crate) type MessageHook = Box<dyn FnMut(&str, &Value) -> Value + Send + 'static>;

/// A cheap, `Clone`-able handle to a per-topic channel.
///
/// The real state (bindings, push buffer, join ref) lives in the socket
/// actor; this handle only carries enough to address commands to it.
#[derive(Clone)]
pub struct Channel {
    pub(crate) id: ChannelId,
    pub(crate) topic: String,
    pub(crate) tx: mpsc::UnboundedSender<Command>,
    pub(crate) next_push_id: Arc<AtomicU64>,
    pub(crate) joined_once: Arc<AtomicBool>,
}

impl Channel {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Joins the channel (spec.md §4.2). Requires this is the first `join()`
    /// on this `Channel`; a second call is a [`ProtocolViolation`].
    pub fn join(&self, timeout: Option<Duration>) -> Result<Push, Error> {
        if self.joined_once.swap(true, Ordering::SeqCst) {
            return Err(ProtocolViolation::AlreadyJoinedOnce {
                topic: self.topic.clone(),
            }
            .into());
        }

        let id = self.next_push_id();
        self.send(Command::Join {
            channel: self.id,
            push: id,
            timeout,
        })?;

        Ok(Push {
            channel: self.id,
            id,
            tx: self.tx.clone(),
        })
    }

    /// Sends a message to the topic (spec.md §4.2 `push`). Requires
    /// `joinedOnce`; otherwise fails with [`ProtocolViolation::NotJoined`].
    pub fn push(
        &self,
        event: impl Into<String>,
        payload: impl Into<PayloadSource>,
        timeout: Option<Duration>,
    ) -> Result<Push, Error> {
        if !self.joined_once.load(Ordering::SeqCst) {
            return Err(ProtocolViolation::NotJoined {
                topic: self.topic.clone(),
            }
            .into());
        }

        let id = self.next_push_id();
        self.send(Command::Push {
            channel: self.id,
            push: id,
            event: event.into(),
            payload: payload.into(),
            timeout,
        })?;

        Ok(Push {
            channel: self.id,
            id,
            tx: self.tx.clone(),
        })
    }

    /// Registers `callback` for `event`; fires in insertion order alongside
    /// any other subscribers of the same event (spec.md §4.2 `on`).
    pub fn on(
        &self,
        event: impl Into<String>,
        callback: impl FnMut(&Value) + Send + 'static,
    ) -> Result<SubscriptionId, Error> {
        let id = SubscriptionId(Uuid::new_v4());
        self.send(Command::On {
            channel: self.id,
            subscription: id,
            event: event.into(),
            callback: Box::new(callback),
        })?;
        Ok(id)
    }

    /// Removes a single subscription by handle.
    pub fn off(&self, subscription: SubscriptionId) -> Result<(), Error> {
        self.send(Command::Off {
            channel: self.id,
            subscription: Some(subscription),
            event: None,
        })
    }

    /// Removes every subscription registered for `event`.
    pub fn off_event(&self, event: impl Into<String>) -> Result<(), Error> {
        self.send(Command::Off {
            channel: self.id,
            subscription: None,
            event: Some(event.into()),
        })
    }

    /// Installs the `onMessage` hook (spec.md §4.2): runs once per inbound
    /// event before it's fanned out to `on()` subscribers, and may rewrite
    /// the payload they see. Replaces any hook previously installed.
    pub fn set_message_hook(
        &self,
        hook: impl FnMut(&str, &Value) -> Value + Send + 'static,
    ) -> Result<(), Error> {
        self.send(Command::SetMessageHook {
            channel: self.id,
            hook: Box::new(hook),
        })
    }

    /// Leaves the channel (spec.md §4.2 `leave`).
    pub fn leave(&self, timeout: Option<Duration>) -> Result<Push, Error> {
        let id = self.next_push_id();
        self.send(Command::Leave {
            channel: self.id,
            push: id,
            timeout,
        })?;

        Ok(Push {
            channel: self.id,
            id,
            tx: self.tx.clone(),
        })
    }

    /// Forwards `cmd` to the socket actor; fails if the actor task has
    /// already stopped and can no longer receive commands.
    fn send(&self, cmd: Command) -> Result<(), Error> {
        self.tx.send(cmd).map_err(|_| Error::ActorStopped)
    }

    fn next_push_id(&self) -> PushId {
        PushId(
            self.next_push_id
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed),
        )
    }
}

/// The actor-owned state for one channel (spec.md §3 "Channel").
pub(crate) struct ChannelActorState {
    pub(crate) topic: String,
    pub(crate) params: Value,
    pub(crate) state: ChannelState,
    pub(crate) joined_once: bool,
    pub(crate) join_push: Option<PushId>,
    pub(crate) leave_push: Option<PushId>,
    pub(crate) join_ref: Option<OutboundRequestId>,
    pub(crate) push_buffer: VecDeque<PushId>,
    pub(crate) bindings: Vec<(SubscriptionId, String, Binding)>,
    pub(crate) message_hook: Option<MessageHook>,
    pub(crate) pushes: std::collections::HashMap<PushId, PushState>,
    pub(crate) rejoin_timer: Scheduler,
    pub(crate) default_timeout: Duration,
}

const MAX_PUSH_BUFFER: usize = 256;

impl ChannelActorState {
    pub(crate) fn new(
        topic: String,
        params: Value,
        default_timeout: Duration,
        rejoin_backoff: BackoffFn,
    ) -> Self {
        Self {
            topic,
            params,
            state: ChannelState::Closed,
            joined_once: false,
            join_push: None,
            leave_push: None,
            join_ref: None,
            push_buffer: VecDeque::new(),
            bindings: Vec::new(),
            message_hook: None,
            pushes: std::collections::HashMap::new(),
            rejoin_timer: Scheduler::new(rejoin_backoff),
            default_timeout,
        }
    }

    pub(crate) fn can_push(&self, transport_connected: bool) -> bool {
        transport_connected && matches!(self.state, ChannelState::Joined)
    }

    pub(crate) fn is_member(&self, topic: &str, envelope_join_ref: Option<OutboundRequestId>) -> bool {
        if self.topic != topic {
            return false;
        }
        match envelope_join_ref {
            None => true,
            Some(r) => Some(r) == self.join_ref,
        }
    }

    /// Buffers a non-join push, capped per spec.md §9 open question (b):
    /// drop the oldest buffered push and log, rather than growing unbounded.
    pub(crate) fn buffer_push(&mut self, id: PushId) {
        if self.push_buffer.len() >= MAX_PUSH_BUFFER {
            if let Some(dropped) = self.push_buffer.pop_front() {
                self.pushes.remove(&dropped);
                tracing::warn!(
                    topic = %self.topic,
                    "Dropping oldest buffered push; exceeded max buffer of {MAX_PUSH_BUFFER}"
                );
            }
        }
        self.push_buffer.push_back(id);
    }

    /// Runs the `onMessage` hook (if any), then fans the resulting payload
    /// out to every subscriber of `event` in registration order (spec.md
    /// §4.2 "Reply fan-out" / "onMessage"). A hook that turns a non-null
    /// payload into null is a [`ProtocolViolation`] — logged loudly and the
    /// event is swallowed rather than delivered to subscribers, since there
    /// is no synchronous caller here to propagate the error to.
    pub(crate) fn dispatch(&mut self, event: &str, payload: &Value) {
        let transformed;
        let payload = if let Some(hook) = &mut self.message_hook {
            let result = hook(event, payload);
            if !payload.is_null() && result.is_null() {
                tracing::error!(
                    error = %ProtocolViolation::OnMessageReturnedNull { topic: self.topic.clone() },
                    topic = %self.topic,
                    event,
                    "dropping inbound event"
                );
                return;
            }
            transformed = result;
            &transformed
        } else {
            payload
        };

        for (_, bound_event, callback) in &mut self.bindings {
            if bound_event == event {
                callback(payload);
            }
        }
    }
}
