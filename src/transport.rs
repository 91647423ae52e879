//! Message-framed transport seam.
//!
//! Sessions speak to the world through a pair of narrow traits — one sink,
//! one stream — so the relay logic never touches sockets directly. Two
//! implementations exist: WebSocket (the production transport) and an
//! in-memory channel pair used by tests to wire a server and client
//! together without networking.
//!
//! `recv` yields raw message text: parsing happens in the session task so
//! a malformed payload can be answered with an `error` message instead of
//! tearing the connection down.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use crate::error::{RelayError, Result};
use crate::protocol::WireMessage;

/// Outbound half: one writer per session drains the outbound queue into
/// this.
#[async_trait]
pub trait TransportSink: Send {
    async fn send(&mut self, msg: WireMessage) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// Inbound half: framed message text, `Ok(None)` on clean close.
#[async_trait]
pub trait TransportStream: Send {
    async fn recv(&mut self) -> Result<Option<String>>;
}

/// A bidirectional transport that can be split into independent halves.
pub trait MessageTransport {
    type Sink: TransportSink + 'static;
    type Stream: TransportStream + 'static;

    fn split(self) -> (Self::Sink, Self::Stream);
}

// ---------------------------------------------------------------------------
// WebSocket transport
// ---------------------------------------------------------------------------

/// WebSocket transport over any async byte stream.
pub struct WsTransport<S> {
    inner: WebSocketStream<S>,
}

/// Server side: the WebSocket transport over an accepted TCP connection.
pub type ServerWsTransport = WsTransport<TcpStream>;

/// Client side: the WebSocket transport over a possibly TLS-wrapped stream.
pub type ClientWsTransport = WsTransport<MaybeTlsStream<TcpStream>>;

impl ServerWsTransport {
    /// Perform the server side of the WebSocket handshake.
    pub async fn accept(stream: TcpStream) -> Result<Self> {
        let inner = tokio_tungstenite::accept_async(stream).await?;
        Ok(Self { inner })
    }
}

impl ClientWsTransport {
    /// Dial a relay server.
    pub async fn connect(url: &str) -> Result<Self> {
        let (inner, _response) = tokio_tungstenite::connect_async(url).await?;
        Ok(Self { inner })
    }
}

pub struct WsSink<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
}

pub struct WsStream<S> {
    inner: SplitStream<WebSocketStream<S>>,
}

impl<S> MessageTransport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Sink = WsSink<S>;
    type Stream = WsStream<S>;

    fn split(self) -> (Self::Sink, Self::Stream) {
        let (sink, stream) = self.inner.split();
        (WsSink { inner: sink }, WsStream { inner: stream })
    }
}

#[async_trait]
impl<S> TransportSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, msg: WireMessage) -> Result<()> {
        let text = msg.to_json();
        trace!(bytes = text.len(), "sending message");
        self.inner.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.send(Message::Close(None)).await.ok();
        self.inner.close().await.ok();
        Ok(())
    }
}

#[async_trait]
impl<S> TransportStream for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> Result<Option<String>> {
        loop {
            match self.inner.next().await {
                None => return Ok(None),
                Some(Ok(Message::Text(text))) => return Ok(Some(text.to_string())),
                Some(Ok(Message::Close(_))) => {
                    debug!("peer sent close frame");
                    return Ok(None);
                }
                // Keepalive traffic; tungstenite answers pings on flush.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Binary(_))) => {
                    return Err(RelayError::protocol(
                        "binary frames are not part of this protocol",
                    ));
                }
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory transport (tests, embedding)
// ---------------------------------------------------------------------------

/// Channel-backed transport endpoint. [`channel_pair`] returns two of
/// these wired back to back.
pub struct ChannelTransport {
    tx: mpsc::Sender<String>,
    rx: mpsc::Receiver<String>,
}

/// Create a connected pair of in-memory transports.
pub fn channel_pair(buffer: usize) -> (ChannelTransport, ChannelTransport) {
    let (a_tx, a_rx) = mpsc::channel(buffer);
    let (b_tx, b_rx) = mpsc::channel(buffer);
    (ChannelTransport { tx: a_tx, rx: b_rx }, ChannelTransport { tx: b_tx, rx: a_rx })
}

pub struct ChannelSink {
    tx: mpsc::Sender<String>,
}

pub struct ChannelStream {
    rx: mpsc::Receiver<String>,
}

impl MessageTransport for ChannelTransport {
    type Sink = ChannelSink;
    type Stream = ChannelStream;

    fn split(self) -> (Self::Sink, Self::Stream) {
        (ChannelSink { tx: self.tx }, ChannelStream { rx: self.rx })
    }
}

#[async_trait]
impl TransportSink for ChannelSink {
    async fn send(&mut self, msg: WireMessage) -> Result<()> {
        self.tx
            .send(msg.to_json())
            .await
            .map_err(|_| RelayError::transport("peer endpoint dropped"))
    }

    async fn close(&mut self) -> Result<()> {
        // Dropping the sender closes the stream; nothing to flush.
        Ok(())
    }
}

#[async_trait]
impl TransportStream for ChannelStream {
    async fn recv(&mut self) -> Result<Option<String>> {
        Ok(self.rx.recv().await)
    }
}

/// Convenience for tests and embedded callers: send a message on a raw
/// endpoint before splitting.
impl ChannelTransport {
    pub async fn send(&mut self, msg: WireMessage) -> Result<()> {
        self.send_raw(&msg.to_json()).await
    }

    /// Send arbitrary text, bypassing serialization. Lets tests exercise
    /// the malformed-payload path.
    pub async fn send_raw(&mut self, text: &str) -> Result<()> {
        self.tx
            .send(text.to_string())
            .await
            .map_err(|_| RelayError::transport("peer endpoint dropped"))
    }

    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ControlAction;

    #[tokio::test]
    async fn channel_pair_roundtrips_messages() {
        let (mut client, server) = channel_pair(8);
        let (mut server_sink, mut server_stream) = server.split();

        client
            .send(WireMessage::Control {
                action: ControlAction::Start,
                payload: serde_json::Value::Null,
            })
            .await
            .unwrap();

        let text = server_stream.recv().await.unwrap().unwrap();
        let msg = WireMessage::parse(&text).unwrap();
        assert!(matches!(msg, WireMessage::Control { action: ControlAction::Start, .. }));

        server_sink
            .send(WireMessage::Error { code: "capacity".into(), message: "full".into() })
            .await
            .unwrap();
        let text = client.recv().await.unwrap();
        assert!(text.contains("capacity"));
    }

    #[tokio::test]
    async fn dropped_peer_surfaces_as_transport_error_and_end_of_stream() {
        let (client, server) = channel_pair(8);
        let (mut client_sink, mut client_stream) = client.split();
        drop(server);

        let err = client_sink
            .send(WireMessage::Error { code: "x".into(), message: "y".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Transport { .. }));
        assert!(client_stream.recv().await.unwrap().is_none());
    }
}
