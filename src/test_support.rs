//! An in-memory stand-in for the real transport, so the socket/channel/push
//! state machines can be exercised deterministically without TLS or a real
//! server. Enabled via the `test-util` feature (this crate depends on itself
//! with that feature turned on as a dev-dependency, a common pattern for
//! shipping test helpers alongside a library).

use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::{FutureExt, Sink, Stream};
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::socket::Connector;
use crate::transport::Transport;

/// The client side of an in-memory transport pair.
pub struct MockTransport {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<String>,
}

/// The "server" side: send frames to the client, observe what it sent.
pub struct MockServer {
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl MockServer {
    pub fn send(&self, text: impl Into<String>) {
        // The client may have gone away (e.g. after `disconnect`); tests that
        // care about that race assert on state, not on this return value.
        let _ = self.to_client.send(text.into());
    }

    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    pub fn try_recv(&mut self) -> Option<String> {
        self.from_client.try_recv().ok()
    }
}

/// Builds a connected pair: feed the `MockTransport` to [`crate::Socket`],
/// keep the [`MockServer`] in the test to drive replies.
pub fn mock_pair() -> (MockTransport, MockServer) {
    let (client_tx, server_rx) = mpsc::unbounded_channel();
    let (server_tx, client_rx) = mpsc::unbounded_channel();

    (
        MockTransport {
            outbound: client_tx,
            inbound: client_rx,
        },
        MockServer {
            to_client: server_tx,
            from_client: server_rx,
        },
    )
}

/// A [`Connector`] that hands out a single pre-built transport and then
/// fails every subsequent connect attempt, for tests with no reconnect.
pub fn connector_once(transport: MockTransport) -> Connector {
    let transport = Mutex::new(Some(transport));

    std::sync::Arc::new(move || -> BoxFuture<'static, Result<Box<dyn Transport>, TransportError>> {
        let taken = transport.lock().unwrap().take();
        async move {
            match taken {
                Some(t) => Ok(Box::new(t) as Box<dyn Transport>),
                None => Err(TransportError::StreamClosed),
            }
        }
        .boxed()
    })
}

/// A [`Connector`] that hands out transports from `transports` in order, one
/// per connect attempt, for tests that exercise reconnect. Fails once the
/// list is exhausted.
pub fn connector_sequence(transports: Vec<MockTransport>) -> Connector {
    let transports = Mutex::new(transports.into_iter().collect::<std::collections::VecDeque<_>>());

    std::sync::Arc::new(move || -> BoxFuture<'static, Result<Box<dyn Transport>, TransportError>> {
        let next = transports.lock().unwrap().pop_front();
        async move {
            match next {
                Some(t) => Ok(Box::new(t) as Box<dyn Transport>),
                None => Err(TransportError::StreamClosed),
            }
        }
        .boxed()
    })
}

impl Stream for MockTransport {
    type Item = Result<String, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inbound.poll_recv(cx) {
            Poll::Ready(Some(text)) => Poll::Ready(Some(Ok(text))),
            Poll::Ready(None) => Poll::Ready(Some(Err(TransportError::StreamClosed))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Sink<String> for MockTransport {
    type Error = TransportError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(mut self: Pin<&mut Self>, item: String) -> Result<(), Self::Error> {
        self.outbound
            .send(item)
            .map_err(|_| TransportError::StreamClosed)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}
