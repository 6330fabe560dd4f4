//! The external transport collaborator (spec.md §6 "IWebsocket").
//!
//! Modeled as a `Stream<Item = Result<String, _>> + Sink<String, _>` rather
//! than four injected callbacks — idiomatic for Rust, and it's exactly the
//! shape `tokio_tungstenite::WebSocketStream` already has once text frames
//! are unwrapped, which is how the teacher drives it directly in its own
//! `poll` (`stream.poll_next_unpin` / `stream.poll_ready_unpin` /
//! `stream.start_send_unpin`).

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use base64::Engine;
use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use rand_core::{OsRng, RngCore};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{handshake::client::Request, Message};
use tokio_tungstenite::{client_async_tls, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::TransportError;

/// A duplex text-frame channel. Anything satisfying this can back a [`crate::Socket`].
pub trait Transport:
    Stream<Item = Result<String, TransportError>> + Sink<String, Error = TransportError> + Unpin + Send
{
}

impl<T> Transport for T where
    T: Stream<Item = Result<String, TransportError>>
        + Sink<String, Error = TransportError>
        + Unpin
        + Send
{
}

/// The production transport: a TLS-capable WebSocket over TCP.
pub struct WebsocketTransport {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Stream for WebsocketTransport {
    type Item = Result<String, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            return match self.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(Message::Text(text)))) => {
                    Poll::Ready(Some(Ok(text.to_string())))
                }
                // Frame types with no payload relevant to the channel protocol;
                // tungstenite already answers pings/close handshakes for us.
                Poll::Ready(Some(Ok(_))) => continue,
                Poll::Ready(Some(Err(e))) => {
                    Poll::Ready(Some(Err(TransportError::WebSocket(e))))
                }
                Poll::Ready(None) => Poll::Ready(Some(Err(TransportError::StreamClosed))),
                Poll::Pending => Poll::Pending,
            };
        }
    }
}

impl Sink<String> for WebsocketTransport {
    type Error = TransportError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready_unpin(cx).map_err(TransportError::WebSocket)
    }

    fn start_send(mut self: Pin<&mut Self>, item: String) -> Result<(), Self::Error> {
        self.inner
            .start_send_unpin(Message::Text(item.into()))
            .map_err(TransportError::WebSocket)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_flush_unpin(cx).map_err(TransportError::WebSocket)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_close_unpin(cx).map_err(TransportError::WebSocket)
    }
}

/// Connects a new [`WebsocketTransport`], bounding the attempt with an overall timeout.
pub async fn connect(
    url: Url,
    addresses: Vec<SocketAddr>,
    host: String,
    user_agent: String,
) -> Result<WebsocketTransport, TransportError> {
    tracing::debug!(%host, ?addresses, %user_agent, "Connecting to server");

    let timeout = Duration::from_secs(5);
    let tcp = tokio::time::timeout(timeout, connect_tcp(&addresses))
        .await
        .map_err(|_| TransportError::Timeout { duration: timeout })??;

    let (inner, _response) = client_async_tls(make_request(url, host, user_agent), tcp)
        .await
        .map_err(TransportError::WebSocket)?;

    Ok(WebsocketTransport { inner })
}

async fn connect_tcp(addresses: &[SocketAddr]) -> Result<TcpStream, TransportError> {
    let mut last_error = None;

    for addr in addresses {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }

    Err(TransportError::Connect(last_error.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses to connect to")
    })))
}

/// Builds the WebSocket upgrade request by hand so we can add a `User-Agent`
/// header, same as the teacher's `make_request`.
fn make_request(url: Url, host: String, user_agent: String) -> Request {
    let mut key_bytes = [0u8; 16];
    OsRng.fill_bytes(&mut key_bytes);
    let key = base64::engine::general_purpose::STANDARD.encode(key_bytes);

    Request::builder()
        .method("GET")
        .header("Host", host)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", key)
        .header("User-Agent", user_agent)
        .uri(url.to_string())
        .body(())
        .expect("should always be able to build a request if we only pass strings to it")
}

/// Boxed future alias used by the socket actor's `Connecting` state.
pub(crate) type BoxedConnect =
    Pin<Box<dyn Future<Output = Result<WebsocketTransport, TransportError>> + Send>>;

pub(crate) fn boxed_connect(
    url: Url,
    addresses: Vec<SocketAddr>,
    host: String,
    user_agent: String,
) -> BoxedConnect {
    connect(url, addresses, host, user_agent).boxed()
}
