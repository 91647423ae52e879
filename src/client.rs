//! Client side of the relay protocol.
//!
//! A [`ConnectedClient`] wraps one live connection: it numbers outbound
//! frames, parses inbound messages, and tracks the server's target frame
//! rate so a capture stream can be paced with
//! [`PaceExt::pace`](crate::stream::PaceExt). [`RelayClient::run`] adds
//! the reconnect policy on top: unexpected closures retry with bounded
//! exponential backoff, and a connection that stays up long enough resets
//! the schedule.

use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::Result;
use crate::protocol::{ControlAction, WireMessage};
use crate::reconnect::Backoff;
use crate::transport::{ClientWsTransport, MessageTransport, TransportSink, TransportStream};

/// One live client connection, generic over the transport so tests can
/// drive it in memory.
pub struct ConnectedClient<T: MessageTransport> {
    sink: T::Sink,
    stream: T::Stream,
    next_frame_number: u64,
    fps_tx: watch::Sender<u32>,
    fps_rx: watch::Receiver<u32>,
}

impl<T: MessageTransport> ConnectedClient<T> {
    pub fn new(transport: T, config: &RelayConfig) -> Self {
        let (sink, stream) = transport.split();
        let (fps_tx, fps_rx) = watch::channel(config.quality.initial_fps);
        Self { sink, stream, next_frame_number: 1, fps_tx, fps_rx }
    }

    /// Watch channel carrying the server's current target frame rate.
    /// Feed it to [`PaceExt::pace`](crate::stream::PaceExt) on the capture
    /// stream.
    pub fn target_fps(&self) -> watch::Receiver<u32> {
        self.fps_rx.clone()
    }

    /// Send one captured frame. Frame numbers are assigned here,
    /// monotonically, and never reused.
    pub async fn send_frame(
        &mut self,
        data: Vec<u8>,
        captured_at_ms: u64,
        metadata: serde_json::Value,
    ) -> Result<u64> {
        let frame_number = self.next_frame_number;
        self.next_frame_number += 1;
        self.sink
            .send(WireMessage::RawFrame { timestamp_ms: captured_at_ms, data, frame_number, metadata })
            .await?;
        Ok(frame_number)
    }

    pub async fn send_control(
        &mut self,
        action: ControlAction,
        payload: serde_json::Value,
    ) -> Result<()> {
        self.sink.send(WireMessage::Control { action, payload }).await
    }

    /// Receive the next server message, `None` on clean close.
    ///
    /// Quality updates are applied to the target-fps channel before being
    /// handed to the caller.
    pub async fn next_message(&mut self) -> Result<Option<WireMessage>> {
        let Some(text) = self.stream.recv().await? else {
            return Ok(None);
        };
        let msg = WireMessage::parse(&text)?;
        if let WireMessage::ControlResponse {
            action: ControlAction::Quality,
            payload,
            success: true,
        } = &msg
        {
            if let Some(fps) = payload.get("target_fps").and_then(|v| v.as_u64()) {
                debug!(target_fps = fps, "server adjusted target frame rate");
                self.fps_tx.send_replace(fps as u32);
            }
        }
        Ok(Some(msg))
    }

    /// Close the connection cleanly.
    pub async fn close(mut self) -> Result<()> {
        self.sink.close().await
    }
}

/// Reconnecting relay client.
pub struct RelayClient {
    url: String,
    config: RelayConfig,
}

impl RelayClient {
    pub fn new(url: impl Into<String>, config: RelayConfig) -> Self {
        Self { url: url.into(), config }
    }

    /// Dial once, without retry.
    pub async fn connect(&self) -> Result<ConnectedClient<ClientWsTransport>> {
        let transport = ClientWsTransport::connect(&self.url).await?;
        Ok(ConnectedClient::new(transport, &self.config))
    }

    /// Run a session handler with reconnect-on-failure.
    ///
    /// The handler is invoked once per established connection. A handler
    /// that returns `Ok` ends the run; a transport-level error waits out
    /// the backoff delay and redials. Cancellation stops everything.
    pub async fn run<H, Fut>(&self, cancel: CancellationToken, mut handler: H) -> Result<()>
    where
        H: FnMut(ConnectedClient<ClientWsTransport>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut backoff = Backoff::new(self.config.backoff.clone());
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            match self.connect().await {
                Ok(client) => {
                    info!(url = %self.url, "connected to relay");
                    backoff.on_established(Instant::now());
                    let outcome = tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        outcome = handler(client) => outcome,
                    };
                    backoff.on_closed(Instant::now());
                    match outcome {
                        Ok(()) => return Ok(()),
                        Err(err) if err.is_session_fatal() => {
                            warn!(%err, "session lost; will reconnect");
                        }
                        Err(err) => return Err(err),
                    }
                }
                Err(err) => {
                    warn!(url = %self.url, %err, "connection attempt failed");
                }
            }
            let delay = backoff.next_delay();
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
