//! One outbound request and its reply correlation (spec.md §4.3).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{Error, ReplyStatus};
use crate::message::OutboundRequestId;
use crate::scheduler::Scheduler;
use crate::socket::Command;
use crate::{ChannelId, PushId};

/// A payload, or a producer re-evaluated on every `resend` (spec.md §3
/// "payload (or a deferred producer, so params may be re-evaluated on
/// resend)") — used for the join push, whose params may legitimately change
/// between attempts (e.g. a refreshed auth token).
#[derive(Clone)]
pub enum PayloadSource {
    Fixed(Value),
    Deferred(Arc<dyn Fn() -> Value + Send + Sync>),
}

impl PayloadSource {
    pub(crate) fn resolve(&self) -> Value {
        match self {
            PayloadSource::Fixed(v) => v.clone(),
            PayloadSource::Deferred(f) => f(),
        }
    }
}

impl From<Value> for PayloadSource {
    fn from(value: Value) -> Self {
        PayloadSource::Fixed(value)
    }
}

/// A callback registered via [`Push::receive`]. Runs at most once.
pub(crate) type Receiver = Box<dyn FnOnce(&Value) + Send + 'static>;

/// A handle to an in-flight (or not-yet-sent) push.
///
/// Returned by [`crate::Channel::push`] and [`crate::Channel::join`]; chains
/// via `.receive(status, callback)?` returning `self`.
pub struct Push {
    pub(crate) channel: ChannelId,
    pub(crate) id: PushId,
    pub(crate) tx: mpsc::UnboundedSender<Command>,
}

impl Push {
    /// Registers `callback` to run when a reply with the given `status`
    /// arrives, or immediately if it already has (spec.md §4.3).
    pub fn receive(
        self,
        status: ReplyStatus,
        callback: impl FnOnce(&Value) + Send + 'static,
    ) -> Result<Self, Error> {
        self.send(Command::PushReceive {
            channel: self.channel,
            push: self.id,
            status,
            callback: Box::new(callback),
        })?;
        Ok(self)
    }

    /// Cancels the push's timeout without affecting anything already sent.
    pub fn cancel_timeout(&self) -> Result<(), Error> {
        self.send(Command::PushCancelTimeout {
            channel: self.channel,
            push: self.id,
        })
    }

    /// Cancels the pending timer, regenerates `ref`/`refEvent`, clears any
    /// previously-received reply, and resends (spec.md §4.3 `resend`).
    pub fn resend(&self, timeout: Option<Duration>) -> Result<(), Error> {
        self.send(Command::PushResend {
            channel: self.channel,
            push: self.id,
            timeout,
        })
    }

    fn send(&self, cmd: Command) -> Result<(), Error> {
        self.tx.send(cmd).map_err(|_| Error::ActorStopped)
    }
}

/// The actor-owned bookkeeping for one push (spec.md §3 "Push").
pub(crate) struct PushState {
    pub(crate) event: String,
    pub(crate) payload: PayloadSource,
    pub(crate) timeout: Duration,
    pub(crate) reference: Option<OutboundRequestId>,
    pub(crate) received_resp: Option<(ReplyStatus, Value)>,
    pub(crate) receivers: VecDeque<(ReplyStatus, Receiver)>,
    pub(crate) timeout_timer: Scheduler,
    pub(crate) sent: bool,
}

impl PushState {
    pub(crate) fn new(event: String, payload: PayloadSource, timeout: Duration) -> Self {
        Self {
            event,
            payload,
            timeout,
            reference: None,
            received_resp: None,
            receivers: VecDeque::new(),
            timeout_timer: Scheduler::new(Arc::new(|_| Duration::ZERO)),
            sent: false,
        }
    }

    /// Records a reply and fires every receiver registered for its status,
    /// in registration order, exactly once.
    pub(crate) fn resolve(&mut self, status: ReplyStatus, payload: Value) {
        self.timeout_timer.cancel();
        self.received_resp = Some((status, payload));

        let (_, payload) = self
            .received_resp
            .as_ref()
            .expect("just assigned above");

        let mut still_pending = VecDeque::new();
        while let Some((want, cb)) = self.receivers.pop_front() {
            if want == status {
                cb(payload);
            } else {
                still_pending.push_back((want, cb));
            }
        }
        self.receivers = still_pending;
    }

    /// Registers (or immediately fires) a receiver for `status`.
    pub(crate) fn add_receiver(&mut self, status: ReplyStatus, callback: Receiver) {
        if let Some((resolved_status, payload)) = &self.received_resp {
            if *resolved_status == status {
                callback(payload);
                return;
            }
        }

        self.receivers.push_back((status, callback));
    }

    /// Cancels the pending timer and clears `ref`/`received_resp` so the next
    /// `send()` assigns a fresh reference (spec.md §4.3 `resend`).
    pub(crate) fn reset_for_resend(&mut self) {
        self.timeout_timer.cancel();
        self.reference = None;
        self.received_resp = None;
        self.sent = false;
    }
}
