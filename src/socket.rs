//! The single multiplexed transport endpoint (spec.md §4.1).
//!
//! Runs as a poll-driven actor task, in the same hand-written `Future`/`poll`
//! style as the teacher's `PhoenixChannel::poll` — one big `loop { ... continue
//! ... }` that re-enters itself whenever state changes, and returns
//! `Poll::Pending` only once nothing is left to do this tick. Application
//! code talks to it through the cheap, `Clone`-able [`Socket`]/[`Channel`]/
//! [`Push`] handles over an unbounded `mpsc` channel, so callers never touch
//! `poll` themselves.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs as _};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, Sink, Stream};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use url::Url;

use crate::channel::{Binding, Channel, ChannelActorState, ChannelState, SubscriptionId};
use crate::error::{self, Error, ReplyStatus, TransportError};
use crate::heartbeat::Heartbeat;
use crate::message::{
    Envelope, ErrorReply, OutboundRequestId, ReplyPayload, Serializer, HEARTBEAT_EVENT,
    HEARTBEAT_TOPIC, PHX_CLOSE, PHX_ERROR, PHX_JOIN, PHX_LEAVE, PHX_REPLY,
};
use crate::push::{PayloadSource, Push, PushState, Receiver};
use crate::scheduler::{BackoffFn, Scheduler};
use crate::transport::Transport;
use crate::{ChannelId, PushId};

/// Bound on the socket's outbound send buffer (spec.md §9 open question (b)
/// resolution for the socket-level buffer; the per-channel push buffer is
/// bounded separately in `channel.rs`). Drops the oldest queued message and
/// logs a warning when exceeded, same policy as the teacher's
/// `MAX_BUFFERED_MESSAGES`.
const MAX_BUFFERED_MESSAGES: usize = 256;

/// Builds a fresh transport connection attempt. Invoked once per connect /
/// reconnect; production code wraps [`crate::transport::connect`], tests
/// wrap [`crate::test_support::mock_pair`].
pub type Connector =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Box<dyn Transport>, TransportError>> + Send + Sync>;

/// Recognized configuration (spec.md §6 "Configuration").
#[derive(Clone)]
pub struct SocketOpts {
    /// Default per-push deadline (spec.md default: 10s).
    pub timeout: Duration,
    /// Heartbeat send cadence (spec.md default: 30s).
    pub heartbeat_interval: Duration,
    /// How long to wait for a heartbeat reply before declaring the transport
    /// unhealthy. Not named by spec.md, which only requires detecting a
    /// missed reply; grounded in the teacher's `heartbeat::TIMEOUT` (5s).
    pub heartbeat_timeout: Duration,
    /// `reconnectAfter(tries)`.
    pub reconnect_after: BackoffFn,
    /// `rejoinAfter(tries)`, used per-channel.
    pub rejoin_after: BackoffFn,
    /// Which wire encoding to use (spec.md §6 "serializer: v1|v2").
    pub serializer: Serializer,
}

impl Default for SocketOpts {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            heartbeat_interval: crate::heartbeat::INTERVAL,
            heartbeat_timeout: crate::heartbeat::TIMEOUT,
            reconnect_after: Arc::new(default_backoff),
            rejoin_after: Arc::new(default_backoff),
            serializer: Serializer::default(),
        }
    }
}

/// `10,50,100,150,200,250,500,1000,2000` ms, capped — the literal table
/// spec.md §4.1 gives for `reconnectAfter`.
fn default_backoff(tries: usize) -> Duration {
    const STEPS_MS: [u64; 9] = [10, 50, 100, 150, 200, 250, 500, 1000, 2000];
    let idx = tries.min(STEPS_MS.len() - 1);
    Duration::from_millis(STEPS_MS[idx])
}

/// Commands sent from [`Socket`]/[`Channel`]/[`Push`] handles to the actor.
pub(crate) enum Command {
    Connect,
    Disconnect {
        code: u16,
        reason: String,
    },
    RegisterChannel {
        id: ChannelId,
        topic: String,
        params: Value,
    },
    Join {
        channel: ChannelId,
        push: PushId,
        timeout: Option<Duration>,
    },
    Push {
        channel: ChannelId,
        push: PushId,
        event: String,
        payload: PayloadSource,
        timeout: Option<Duration>,
    },
    Leave {
        channel: ChannelId,
        push: PushId,
        timeout: Option<Duration>,
    },
    On {
        channel: ChannelId,
        subscription: SubscriptionId,
        event: String,
        callback: Binding,
    },
    Off {
        channel: ChannelId,
        subscription: Option<SubscriptionId>,
        event: Option<String>,
    },
    PushReceive {
        channel: ChannelId,
        push: PushId,
        status: ReplyStatus,
        callback: Receiver,
    },
    PushCancelTimeout {
        channel: ChannelId,
        push: PushId,
    },
    PushResend {
        channel: ChannelId,
        push: PushId,
        timeout: Option<Duration>,
    },
    SetMessageHook {
        channel: ChannelId,
        hook: crate::channel::MessageHook,
    },
}

/// A cheap, `Clone`-able handle to the multiplexed socket (spec.md §4.1).
#[derive(Clone)]
pub struct Socket {
    tx: mpsc::UnboundedSender<Command>,
    next_channel_id: Arc<AtomicU64>,
}

impl Socket {
    /// Opens the transport if it isn't already open or opening.
    pub fn connect(&self) -> Result<(), Error> {
        self.send(Command::Connect)
    }

    /// Closes the transport and suppresses auto-reconnect.
    pub fn disconnect(&self, code: u16, reason: impl Into<String>) -> Result<(), Error> {
        self.send(Command::Disconnect {
            code,
            reason: reason.into(),
        })
    }

    /// Constructs and registers a channel for `topic` (spec.md §4.1 `channel`).
    pub fn channel(&self, topic: impl Into<String>, params: Value) -> Result<Channel, Error> {
        let topic = topic.into();
        let id = ChannelId(self.next_channel_id.fetch_add(1, Ordering::Relaxed));

        self.send(Command::RegisterChannel {
            id,
            topic: topic.clone(),
            params,
        })?;

        Ok(Channel {
            id,
            topic,
            tx: self.tx.clone(),
            next_push_id: Arc::new(AtomicU64::new(0)),
            joined_once: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        })
    }

    fn send(&self, cmd: Command) -> Result<(), Error> {
        self.tx.send(cmd).map_err(|_| Error::ActorStopped)
    }
}

/// Spawns the socket actor against an arbitrary [`Connector`] (used directly
/// by tests against [`crate::test_support`]; production code usually goes
/// through [`connect_websocket`]).
pub fn spawn(connector: Connector, opts: SocketOpts) -> (Socket, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let actor = SocketActor::new(connector, opts, rx);
    let handle = tokio::spawn(actor.run());

    (
        Socket {
            tx,
            next_channel_id: Arc::new(AtomicU64::new(0)),
        },
        handle,
    )
}

/// Spawns the socket actor against a real WebSocket at `url`, resolving the
/// host once up front the same way the teacher's `PhoenixChannel::disconnected`
/// does, so reconnects don't re-depend on DNS.
pub fn connect_websocket(
    url: Url,
    user_agent: String,
    opts: SocketOpts,
) -> io::Result<(Socket, tokio::task::JoinHandle<()>)> {
    let host = url
        .host_str()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "url has no host"))?
        .to_owned();
    let port = url.port_or_known_default().unwrap_or(443);
    let addresses: Vec<SocketAddr> = (host.as_str(), port).to_socket_addrs()?.collect();

    let connector: Connector = Arc::new(move || {
        let url = url.clone();
        let addresses = addresses.clone();
        let host = host.clone();
        let user_agent = user_agent.clone();

        crate::transport::boxed_connect(url, addresses, host, user_agent)
            .map(|r| r.map(|t| Box::new(t) as Box<dyn Transport>))
            .boxed()
    });

    Ok(spawn(connector, opts))
}

enum TransportState {
    Closed,
    Connecting(BoxFuture<'static, Result<Box<dyn Transport>, TransportError>>),
    Open(Box<dyn Transport>),
    Closing(Box<dyn Transport>),
}

struct SocketActor {
    opts: SocketOpts,
    connector: Connector,
    transport: TransportState,
    send_buffer: VecDeque<String>,
    next_request_id: Arc<AtomicU64>,
    reconnect_timer: Scheduler,
    heartbeat: Heartbeat,
    channels: HashMap<ChannelId, ChannelActorState>,
    explicit_disconnect: bool,
    rx: mpsc::UnboundedReceiver<Command>,
}

impl SocketActor {
    fn new(connector: Connector, opts: SocketOpts, rx: mpsc::UnboundedReceiver<Command>) -> Self {
        // Starts at 1, not 0, matching the ref numbering a Phoenix server expects to see.
        let next_request_id = Arc::new(AtomicU64::new(1));
        let heartbeat = Heartbeat::new(
            opts.heartbeat_interval,
            opts.heartbeat_timeout,
            next_request_id.clone(),
        );

        Self {
            reconnect_timer: Scheduler::new(opts.reconnect_after.clone()),
            heartbeat,
            transport: TransportState::Closed,
            send_buffer: VecDeque::new(),
            next_request_id,
            channels: HashMap::new(),
            explicit_disconnect: false,
            connector,
            opts,
            rx,
        }
    }

    async fn run(mut self) {
        std::future::poll_fn(|cx| self.poll(cx)).await
    }

    fn next_ref(&self) -> OutboundRequestId {
        OutboundRequestId::new(self.next_request_id.fetch_add(1, Ordering::Relaxed))
    }

    fn transport_open(&self) -> bool {
        matches!(self.transport, TransportState::Open(_))
    }

    fn poll(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        loop {
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(cmd)) => {
                    self.handle_command(cmd);
                    continue;
                }
                Poll::Ready(None) => return Poll::Ready(()),
                Poll::Pending => {}
            }

            match &mut self.transport {
                TransportState::Closed => {}
                TransportState::Connecting(fut) => match fut.as_mut().poll(cx) {
                    Poll::Ready(Ok(transport)) => {
                        self.on_open(transport);
                        continue;
                    }
                    Poll::Ready(Err(e)) => {
                        self.schedule_reconnect(e);
                        continue;
                    }
                    Poll::Pending => {}
                },
                TransportState::Closing(t) => match Pin::new(&mut **t).poll_close(cx) {
                    Poll::Ready(_) => {
                        tracing::info!("transport closed");
                        self.transport = TransportState::Closed;
                        continue;
                    }
                    Poll::Pending => {}
                },
                TransportState::Open(_) => {
                    if self.poll_flush_send_buffer(cx) {
                        continue;
                    }
                    if self.poll_inbound(cx) {
                        continue;
                    }
                    if self.poll_heartbeat(cx) {
                        continue;
                    }
                }
            }

            if self.reconnect_timer.poll(cx).is_ready() {
                if matches!(self.transport, TransportState::Closed) && !self.explicit_disconnect {
                    self.transport = TransportState::Connecting((self.connector)());
                }
                continue;
            }

            if self.poll_channel_timers(cx) {
                continue;
            }

            return Poll::Pending;
        }
    }

    fn poll_flush_send_buffer(&mut self, cx: &mut Context<'_>) -> bool {
        let TransportState::Open(t) = &mut self.transport else {
            return false;
        };

        if self.send_buffer.is_empty() {
            return false;
        }

        match Pin::new(&mut **t).poll_ready(cx) {
            Poll::Ready(Ok(())) => {
                let Some(message) = self.send_buffer.pop_front() else {
                    return false;
                };

                tracing::trace!(target: "wire::send", %message);

                if let Err(e) = Pin::new(&mut **t).start_send(message.clone()) {
                    self.send_buffer.push_front(message);
                    self.on_transport_fault(&e);
                    return true;
                }

                if let Poll::Ready(Err(e)) = Pin::new(&mut **t).poll_flush(cx) {
                    self.on_transport_fault(&e);
                    return true;
                }

                // Sending anything postpones the next heartbeat by one interval.
                self.heartbeat.reset();
                true
            }
            Poll::Ready(Err(e)) => {
                self.on_transport_fault(&e);
                true
            }
            Poll::Pending => false,
        }
    }

    fn poll_inbound(&mut self, cx: &mut Context<'_>) -> bool {
        let TransportState::Open(t) = &mut self.transport else {
            return false;
        };

        match Pin::new(&mut **t).poll_next(cx) {
            Poll::Ready(Some(Ok(text))) => {
                self.handle_inbound_text(&text);
                true
            }
            Poll::Ready(Some(Err(e))) => {
                self.on_transport_fault(&e);
                true
            }
            Poll::Ready(None) => {
                self.on_transport_fault(&TransportError::StreamClosed);
                true
            }
            Poll::Pending => false,
        }
    }

    fn poll_heartbeat(&mut self, cx: &mut Context<'_>) -> bool {
        if !self.transport_open() {
            return false;
        }

        match self.heartbeat.poll(cx) {
            Poll::Ready(Ok(id)) => {
                self.enqueue_envelope(Envelope::new(
                    None,
                    Some(id),
                    HEARTBEAT_TOPIC,
                    HEARTBEAT_EVENT,
                    json!({}),
                ));
                true
            }
            Poll::Ready(Err(_missed)) => {
                self.on_transport_fault(&TransportError::HeartbeatTimeout);
                true
            }
            Poll::Pending => false,
        }
    }

    /// Polls every channel's rejoin timer and every push's timeout timer.
    /// O(channels * pushes) per tick, acceptable for the tens-of-channels
    /// cardinality spec.md §5 calls out.
    fn poll_channel_timers(&mut self, cx: &mut Context<'_>) -> bool {
        let ids: Vec<ChannelId> = self.channels.keys().copied().collect();

        for id in &ids {
            let fired = self
                .channels
                .get_mut(id)
                .map(|ch| ch.rejoin_timer.poll(cx).is_ready())
                .unwrap_or(false);

            if fired {
                if self.transport_open() {
                    self.rejoin(*id, None);
                }
                return true;
            }
        }

        for id in &ids {
            let due = self.channels.get_mut(id).and_then(|ch| {
                ch.pushes
                    .iter_mut()
                    .find(|(_, p)| p.timeout_timer.poll(cx).is_ready())
                    .map(|(pid, _)| *pid)
            });

            if let Some(push_id) = due {
                self.push_deadline(*id, push_id);
                return true;
            }
        }

        false
    }

    // ---- transport lifecycle -------------------------------------------

    fn on_open(&mut self, transport: Box<dyn Transport>) {
        tracing::info!("connected");
        self.transport = TransportState::Open(transport);
        self.reconnect_timer.reset();
        self.heartbeat.reset();

        let errored: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|(_, ch)| matches!(ch.state, ChannelState::Errored))
            .map(|(id, _)| *id)
            .collect();

        for id in errored {
            self.rejoin(id, None);
        }
    }

    fn schedule_reconnect(&mut self, e: TransportError) {
        tracing::warn!(error = %e, "connection attempt failed");
        self.transport = TransportState::Closed;

        if !self.explicit_disconnect {
            self.reconnect_timer.schedule_timeout();
        }
    }

    fn on_transport_fault(&mut self, e: &dyn std::fmt::Display) {
        tracing::warn!(error = %e, "transport fault");
        self.transport = TransportState::Closed;
        self.heartbeat.reset();

        let affected: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|(_, ch)| matches!(ch.state, ChannelState::Joined | ChannelState::Joining))
            .map(|(id, _)| *id)
            .collect();

        for id in affected {
            if let Some(ch) = self.channels.get_mut(&id) {
                ch.state = ChannelState::Errored;
                ch.rejoin_timer.schedule_timeout();
            }
        }

        if !self.explicit_disconnect {
            self.reconnect_timer.schedule_timeout();
        }
    }

    fn do_connect(&mut self) {
        if matches!(
            self.transport,
            TransportState::Connecting(_) | TransportState::Open(_)
        ) {
            return;
        }

        self.explicit_disconnect = false;
        self.reconnect_timer.reset();
        self.transport = TransportState::Connecting((self.connector)());
    }

    fn do_disconnect(&mut self, code: u16, reason: String) {
        tracing::info!(code, %reason, "disconnecting");
        self.explicit_disconnect = true;
        self.reconnect_timer.reset();

        match std::mem::replace(&mut self.transport, TransportState::Closed) {
            TransportState::Open(t) | TransportState::Closing(t) => {
                self.transport = TransportState::Closing(t);
            }
            TransportState::Connecting(_) | TransportState::Closed => {
                self.transport = TransportState::Closed;
            }
        }
    }

    // ---- command handling ------------------------------------------------

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect => self.do_connect(),
            Command::Disconnect { code, reason } => self.do_disconnect(code, reason),
            Command::RegisterChannel { id, topic, params } => {
                self.channels.insert(
                    id,
                    ChannelActorState::new(
                        topic,
                        params,
                        self.opts.timeout,
                        self.opts.rejoin_after.clone(),
                    ),
                );
            }
            Command::Join {
                channel,
                push,
                timeout,
            } => self.channel_join(channel, push, timeout),
            Command::Push {
                channel,
                push,
                event,
                payload,
                timeout,
            } => self.channel_push(channel, push, event, payload, timeout),
            Command::Leave {
                channel,
                push,
                timeout,
            } => self.channel_leave(channel, push, timeout),
            Command::On {
                channel,
                subscription,
                event,
                callback,
            } => {
                if let Some(ch) = self.channels.get_mut(&channel) {
                    ch.bindings.push((subscription, event, callback));
                }
            }
            Command::Off {
                channel,
                subscription,
                event,
            } => {
                if let Some(ch) = self.channels.get_mut(&channel) {
                    ch.bindings.retain(|(id, ev, _)| match (subscription, &event) {
                        (Some(target), _) => *id != target,
                        (None, Some(target_event)) => ev != target_event,
                        (None, None) => true,
                    });
                }
            }
            Command::PushReceive {
                channel,
                push,
                status,
                callback,
            } => {
                if let Some(ch) = self.channels.get_mut(&channel) {
                    if let Some(p) = ch.pushes.get_mut(&push) {
                        p.add_receiver(status, callback);
                    }
                }
            }
            Command::PushCancelTimeout { channel, push } => {
                if let Some(ch) = self.channels.get_mut(&channel) {
                    if let Some(p) = ch.pushes.get_mut(&push) {
                        p.timeout_timer.cancel();
                    }
                }
            }
            Command::PushResend {
                channel,
                push,
                timeout,
            } => self.push_resend(channel, push, timeout),
            Command::SetMessageHook { channel, hook } => {
                if let Some(ch) = self.channels.get_mut(&channel) {
                    ch.message_hook = Some(hook);
                }
            }
        }
    }

    // ---- channel state machine (spec.md §4.2) ----------------------------

    fn channel_join(&mut self, channel_id: ChannelId, push_id: PushId, timeout: Option<Duration>) {
        let Some(ch) = self.channels.get_mut(&channel_id) else {
            return;
        };

        ch.joined_once = true;
        ch.state = ChannelState::Joining;
        let push_timeout = timeout.unwrap_or(ch.default_timeout);
        ch.pushes.insert(
            push_id,
            PushState::new(PHX_JOIN.to_owned(), PayloadSource::Fixed(ch.params.clone()), push_timeout),
        );
        ch.join_push = Some(push_id);

        self.push_send(channel_id, push_id);
    }

    fn channel_push(
        &mut self,
        channel_id: ChannelId,
        push_id: PushId,
        event: String,
        payload: PayloadSource,
        timeout: Option<Duration>,
    ) {
        let can_send = {
            let Some(ch) = self.channels.get_mut(&channel_id) else {
                return;
            };

            let push_timeout = timeout.unwrap_or(ch.default_timeout);
            ch.pushes
                .insert(push_id, PushState::new(event, payload, push_timeout));

            let can_send = ch.can_push(self.transport_open());
            if !can_send {
                if let Some(push) = ch.pushes.get_mut(&push_id) {
                    push.timeout_timer.schedule_in(push_timeout);
                }
                ch.buffer_push(push_id);
            }

            can_send
        };

        if can_send {
            self.push_send(channel_id, push_id);
        }
    }

    fn channel_leave(&mut self, channel_id: ChannelId, push_id: PushId, timeout: Option<Duration>) {
        let Some(ch) = self.channels.get_mut(&channel_id) else {
            return;
        };

        ch.state = ChannelState::Leaving;
        let push_timeout = timeout.unwrap_or(ch.default_timeout);
        ch.pushes.insert(
            push_id,
            PushState::new(PHX_LEAVE.to_owned(), PayloadSource::Fixed(Value::Object(Default::default())), push_timeout),
        );
        ch.leave_push = Some(push_id);

        // The join push is no longer going anywhere useful once we're leaving.
        if let Some(jp) = ch.join_push {
            if let Some(p) = ch.pushes.get_mut(&jp) {
                p.timeout_timer.cancel();
            }
        }

        self.push_send(channel_id, push_id);
    }

    /// `rejoin(timeout?)` (spec.md §4.2): no-op while Leaving; otherwise
    /// evicts any other channel on the same topic and resends the singleton
    /// join push with a fresh ref.
    fn rejoin(&mut self, channel_id: ChannelId, timeout: Option<Duration>) {
        let Some(ch) = self.channels.get(&channel_id) else {
            return;
        };
        if matches!(ch.state, ChannelState::Leaving) {
            return;
        }
        let topic = ch.topic.clone();

        self.leave_open_topic(&topic, Some(channel_id));

        let join_push_id = {
            let Some(ch) = self.channels.get_mut(&channel_id) else {
                return;
            };
            ch.state = ChannelState::Joining;
            ch.join_push
        };

        let Some(join_push_id) = join_push_id else {
            return;
        };
        self.push_resend(channel_id, join_push_id, timeout);
    }

    /// `Socket.leaveOpenTopic` (spec.md §4.1): force-close any other channel
    /// registered for `topic` that is currently Joined or Joining.
    fn leave_open_topic(&mut self, topic: &str, except: Option<ChannelId>) {
        let victims: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|(id, ch)| {
                Some(**id) != except
                    && ch.topic == topic
                    && matches!(ch.state, ChannelState::Joined | ChannelState::Joining)
            })
            .map(|(id, _)| *id)
            .collect();

        for id in victims {
            self.transition_closed(id);
        }
    }

    fn transition_closed(&mut self, channel_id: ChannelId) {
        let Some(ch) = self.channels.get_mut(&channel_id) else {
            return;
        };

        ch.state = ChannelState::Closed;
        ch.rejoin_timer.reset();
        ch.leave_push = None;
        // spec.md §9: "event callbacks ... are cleared on Closed." Without
        // this, a channel's stale join_ref (never otherwise invalidated)
        // would keep matching `is_member` and firing subscribers for
        // envelopes belonging to an incarnation that's already gone.
        ch.bindings.clear();
        ch.join_ref = None;

        if let Some(join_push_id) = ch.join_push {
            if let Some(p) = ch.pushes.get_mut(&join_push_id) {
                p.timeout_timer.cancel();
            }
        }
    }

    fn join_ok(&mut self, channel_id: ChannelId) {
        let drained: Vec<PushId> = {
            let Some(ch) = self.channels.get_mut(&channel_id) else {
                return;
            };
            ch.state = ChannelState::Joined;
            ch.rejoin_timer.reset();
            ch.push_buffer.drain(..).collect()
        };

        for push_id in drained {
            self.push_send(channel_id, push_id);
        }
    }

    fn join_error(&mut self, channel_id: ChannelId, reason: ErrorReply) {
        let transport_open = self.transport_open();
        let Some(ch) = self.channels.get_mut(&channel_id) else {
            return;
        };

        tracing::debug!(topic = %ch.topic, %reason, "server rejected join");
        ch.state = ChannelState::Errored;
        if transport_open {
            ch.rejoin_timer.schedule_timeout();
        }
    }

    /// `Joining | joinPush timeout | Errored` (spec.md §4.2): fire-and-forget
    /// `phx_leave`, reset the join push for the next resend, schedule rejoin.
    fn join_timeout(&mut self, channel_id: ChannelId) {
        let (topic, join_ref) = {
            let Some(ch) = self.channels.get_mut(&channel_id) else {
                return;
            };
            ch.state = ChannelState::Errored;
            if let Some(jp) = ch.join_push {
                if let Some(p) = ch.pushes.get_mut(&jp) {
                    p.reset_for_resend();
                }
            }
            (ch.topic.clone(), ch.join_ref)
        };

        let reference = self.next_ref();
        self.enqueue_envelope(Envelope::new(join_ref, Some(reference), topic, PHX_LEAVE, json!({})));

        if self.transport_open() {
            if let Some(ch) = self.channels.get_mut(&channel_id) {
                ch.rejoin_timer.schedule_timeout();
            }
        }
    }

    fn handle_phx_error(&mut self, channel_id: ChannelId) {
        let transport_open = self.transport_open();
        let Some(ch) = self.channels.get_mut(&channel_id) else {
            return;
        };

        ch.state = ChannelState::Errored;
        if let Some(jp) = ch.join_push {
            if let Some(p) = ch.pushes.get_mut(&jp) {
                p.timeout_timer.cancel();
            }
        }
        if transport_open {
            ch.rejoin_timer.schedule_timeout();
        }
    }

    fn push_deadline(&mut self, channel_id: ChannelId, push_id: PushId) {
        let (is_join, is_leave) = {
            let Some(ch) = self.channels.get_mut(&channel_id) else {
                return;
            };
            let is_join = ch.join_push == Some(push_id);
            let is_leave = ch.leave_push == Some(push_id);
            if let Some(push) = ch.pushes.get_mut(&push_id) {
                push.resolve(ReplyStatus::Timeout, Value::Object(Default::default()));
            }
            (is_join, is_leave)
        };

        if is_join {
            self.join_timeout(channel_id);
        } else if is_leave {
            self.transition_closed(channel_id);
        }
    }

    fn push_resend(&mut self, channel_id: ChannelId, push_id: PushId, timeout: Option<Duration>) {
        {
            let Some(ch) = self.channels.get_mut(&channel_id) else {
                return;
            };
            let Some(push) = ch.pushes.get_mut(&push_id) else {
                return;
            };
            push.reset_for_resend();
            if let Some(t) = timeout {
                push.timeout = t;
            }
        }

        self.push_send(channel_id, push_id);
    }

    /// `Push.send()` (spec.md §4.3): assign a ref if needed, start the
    /// timeout, and enqueue the envelope for the transport.
    fn push_send(&mut self, channel_id: ChannelId, push_id: PushId) {
        let candidate_ref = self.next_ref();
        let envelope = {
            let Some(ch) = self.channels.get_mut(&channel_id) else {
                return;
            };
            let topic = ch.topic.clone();

            let (reference, is_join, payload, event_name, timeout) = {
                let Some(push) = ch.pushes.get_mut(&push_id) else {
                    return;
                };
                let reference = *push.reference.get_or_insert(candidate_ref);
                push.sent = true;
                (
                    reference,
                    push.event == PHX_JOIN,
                    push.payload.resolve(),
                    push.event.clone(),
                    push.timeout,
                )
            };

            if is_join {
                ch.join_ref = Some(reference);
            }

            if let Some(push) = ch.pushes.get_mut(&push_id) {
                push.timeout_timer.schedule_in(timeout);
            }

            tracing::trace!(
                topic = %topic,
                event = %event_name,
                ref_event = %error::ref_event(&reference),
                "sending push"
            );

            Envelope::new(ch.join_ref, Some(reference), topic, event_name, payload)
        };

        self.enqueue_envelope(envelope);
    }

    fn enqueue_envelope(&mut self, envelope: Envelope) {
        let text = match self.opts.serializer.encode(&envelope) {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode outbound envelope");
                return;
            }
        };

        if self.send_buffer.len() >= MAX_BUFFERED_MESSAGES {
            if self.send_buffer.pop_front().is_some() {
                tracing::warn!(
                    "dropping oldest buffered message; exceeded max buffer of {MAX_BUFFERED_MESSAGES}"
                );
            }
        }

        self.send_buffer.push_back(text);
    }

    // ---- inbound routing (spec.md §4.1 "Routing") ------------------------

    fn handle_inbound_text(&mut self, text: &str) {
        let envelope = match self.opts.serializer.decode(text) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "failed to decode inbound envelope");
                return;
            }
        };

        tracing::trace!(target: "wire::recv", %text);

        if envelope.topic == HEARTBEAT_TOPIC {
            if let Some(r) = envelope.reference {
                self.heartbeat.maybe_handle_reply(r);
            }
            return;
        }

        let targets: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|(_, ch)| ch.is_member(&envelope.topic, envelope.join_ref))
            .map(|(id, _)| *id)
            .collect();

        if targets.is_empty() {
            tracing::info!(
                topic = %envelope.topic,
                join_ref = ?envelope.join_ref,
                "dropping envelope for unknown or stale channel incarnation"
            );
            return;
        }

        for channel_id in targets {
            match envelope.event.as_str() {
                PHX_REPLY => self.handle_reply(channel_id, &envelope),
                PHX_CLOSE => self.transition_closed(channel_id),
                PHX_ERROR => self.handle_phx_error(channel_id),
                event => {
                    if let Some(ch) = self.channels.get_mut(&channel_id) {
                        ch.dispatch(event, &envelope.payload);
                    }
                }
            }
        }
    }

    fn handle_reply(&mut self, channel_id: ChannelId, envelope: &Envelope) {
        let reply: ReplyPayload = match serde_json::from_value(envelope.payload.clone()) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "malformed phx_reply payload");
                return;
            }
        };
        let status = ReplyStatus::parse(&reply.status).unwrap_or(ReplyStatus::Error);

        let Some(reference) = envelope.reference else {
            tracing::warn!(topic = %envelope.topic, "discarding reply without a reference");
            return;
        };

        let (is_join, is_leave) = {
            let Some(ch) = self.channels.get_mut(&channel_id) else {
                return;
            };
            let push_id = ch
                .pushes
                .iter()
                .find(|(_, p)| p.reference == Some(reference))
                .map(|(id, _)| *id);
            let Some(push_id) = push_id else {
                return;
            };

            let is_join = ch.join_push == Some(push_id);
            let is_leave = ch.leave_push == Some(push_id);
            if let Some(push) = ch.pushes.get_mut(&push_id) {
                push.resolve(status, reply.response.clone());
            }
            (is_join, is_leave)
        };

        match (is_join, status) {
            (true, ReplyStatus::Ok) => self.join_ok(channel_id),
            (true, _) => self.join_error(channel_id, ErrorReply::from_response(&reply.response)),
            _ => {}
        }

        if is_leave {
            self.transition_closed(channel_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{connector_once, mock_pair};
    use serde_json::json;

    async fn join_lobby(socket: &Socket, server: &mut crate::test_support::MockServer) -> Channel {
        socket.connect().unwrap();
        let channel = socket.channel("rooms:lobby", json!({})).unwrap();
        let _push = channel.join(None).unwrap();

        let frame = server.recv().await.expect("join frame");
        assert!(frame.contains("phx_join"));

        server.send(r#"{"join_ref":"1","ref":"1","topic":"rooms:lobby","event":"phx_reply","payload":{"status":"ok","response":{}}}"#);

        // Let the actor process the reply.
        tokio::time::sleep(Duration::from_millis(10)).await;

        channel
    }

    #[tokio::test]
    async fn happy_join_sends_expected_frame_and_reaches_joined() {
        let (transport, mut server) = mock_pair();
        let (socket, _handle) = spawn(connector_once(transport), SocketOpts::default());

        let _channel = join_lobby(&socket, &mut server).await;
    }

    #[tokio::test]
    async fn buffered_push_is_sent_after_join_completes() {
        let (transport, mut server) = mock_pair();
        let (socket, _handle) = spawn(connector_once(transport), SocketOpts::default());

        socket.connect().unwrap();
        let channel = socket.channel("rooms:lobby", json!({})).unwrap();
        let push = channel.push("msg", json!({"body": "hi"}), None).unwrap();
        drop(push);

        let _ = channel.join(None).unwrap();

        let join_frame = server.recv().await.expect("join frame");
        assert!(join_frame.contains("phx_join"));

        server.send(r#"{"join_ref":"1","ref":"1","topic":"rooms:lobby","event":"phx_reply","payload":{"status":"ok","response":{}}}"#);

        let msg_frame = server.recv().await.expect("buffered push frame");
        assert!(msg_frame.contains("\"msg\""));
        assert!(msg_frame.contains("\"hi\""));
    }

    #[tokio::test]
    async fn stale_join_ref_is_dropped() {
        let (transport, mut server) = mock_pair();
        let (socket, _handle) = spawn(connector_once(transport), SocketOpts::default());

        let channel = join_lobby(&socket, &mut server).await;

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        channel
            .on("shout", move |payload| {
                seen2.lock().unwrap().push(payload.clone());
            })
            .unwrap();

        server.send(r#"{"join_ref":"99","ref":null,"topic":"rooms:lobby","event":"shout","payload":{"body":"stale"}}"#);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(seen.lock().unwrap().is_empty());

        server.send(r#"{"join_ref":"1","ref":null,"topic":"rooms:lobby","event":"shout","payload":{"body":"fresh"}}"#);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn leave_during_join_transitions_to_closed_on_reply() {
        let (transport, mut server) = mock_pair();
        let (socket, _handle) = spawn(connector_once(transport), SocketOpts::default());

        socket.connect().unwrap();
        let channel = socket.channel("rooms:lobby", json!({})).unwrap();
        let _join = channel.join(None).unwrap();
        let _ = server.recv().await.expect("join frame");

        let _leave = channel.leave(None).unwrap();
        let leave_frame = server.recv().await.expect("leave frame");
        assert!(leave_frame.contains("phx_leave"));

        server.send(r#"{"join_ref":"1","ref":"2","topic":"rooms:lobby","event":"phx_reply","payload":{"status":"ok","response":{}}}"#);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let seen = Arc::new(std::sync::Mutex::new(0usize));
        let seen2 = seen.clone();
        channel
            .on("shout", move |_| {
                *seen2.lock().unwrap() += 1;
            })
            .unwrap();
        server.send(r#"{"join_ref":"1","ref":null,"topic":"rooms:lobby","event":"shout","payload":{}}"#);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*seen.lock().unwrap(), 0, "closed channel fires no subscribers");
    }

    #[tokio::test]
    async fn message_hook_rewrites_payload_before_fan_out() {
        let (transport, mut server) = mock_pair();
        let (socket, _handle) = spawn(connector_once(transport), SocketOpts::default());

        let channel = join_lobby(&socket, &mut server).await;

        channel
            .set_message_hook(|_event, payload| {
                let mut rewritten = payload.clone();
                rewritten["hooked"] = json!(true);
                rewritten
            })
            .unwrap();

        let seen = Arc::new(std::sync::Mutex::new(None));
        let seen2 = seen.clone();
        channel
            .on("shout", move |payload| {
                *seen2.lock().unwrap() = Some(payload.clone());
            })
            .unwrap();

        server.send(r#"{"join_ref":"1","ref":null,"topic":"rooms:lobby","event":"shout","payload":{"body":"hi"}}"#);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            seen.lock().unwrap().clone(),
            Some(json!({"body": "hi", "hooked": true}))
        );
    }

    #[tokio::test]
    async fn message_hook_returning_null_for_non_null_payload_swallows_the_event() {
        let (transport, mut server) = mock_pair();
        let (socket, _handle) = spawn(connector_once(transport), SocketOpts::default());

        let channel = join_lobby(&socket, &mut server).await;
        channel
            .set_message_hook(|_event, _payload| Value::Null)
            .unwrap();

        let seen = Arc::new(std::sync::Mutex::new(0usize));
        let seen2 = seen.clone();
        channel
            .on("shout", move |_| {
                *seen2.lock().unwrap() += 1;
            })
            .unwrap();

        server.send(r#"{"join_ref":"1","ref":null,"topic":"rooms:lobby","event":"shout","payload":{"body":"hi"}}"#);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            *seen.lock().unwrap(),
            0,
            "a hook that nulls out a non-null payload is a protocol violation, not a deliverable event"
        );
    }
}
