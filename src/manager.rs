//! Connection manager: accepts transports, owns session tasks.
//!
//! One lightweight task per session, all scheduled on the shared runtime;
//! there is no global lock across sessions. Each accepted connection gets
//! its own [`Session`], [`FrameProcessor`] and outbound queue — processor
//! state is never shared, so a slow client cannot stall anyone else.
//!
//! Connections past the configured session limit are rejected with an
//! explicit capacity error, never silently queued.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analyzer::LandmarkAnalyzer;
use crate::codec::FrameCodec;
use crate::config::RelayConfig;
use crate::dispatch::{DispatchFlow, Dispatcher, OutboundQueue};
use crate::error::{RelayError, Result};
use crate::processor::FrameProcessor;
use crate::protocol::WireMessage;
use crate::session::{Session, SessionId};
use crate::sink::SessionSink;
use crate::transport::{MessageTransport, ServerWsTransport, TransportSink, TransportStream};

/// Creates one analyzer per session, keeping detector state isolated
/// per connection.
pub trait AnalyzerFactory: Send + Sync {
    fn create(&self) -> Arc<dyn LandmarkAnalyzer>;
}

impl<F> AnalyzerFactory for F
where
    F: Fn() -> Arc<dyn LandmarkAnalyzer> + Send + Sync,
{
    fn create(&self) -> Arc<dyn LandmarkAnalyzer> {
        self()
    }
}

/// RAII slot in the session count.
struct SessionSlot {
    active: Arc<AtomicUsize>,
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The server side of the relay.
pub struct RelayServer {
    config: RelayConfig,
    factory: Arc<dyn AnalyzerFactory>,
    sink: Arc<dyn SessionSink>,
    active: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl RelayServer {
    pub fn new(
        config: RelayConfig,
        factory: Arc<dyn AnalyzerFactory>,
        sink: Arc<dyn SessionSink>,
    ) -> Self {
        Self {
            config,
            factory,
            sink,
            active: Arc::new(AtomicUsize::new(0)),
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the accept loop and all session tasks.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Bind a listener and run the accept loop until cancelled.
    pub async fn serve(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!(%local, max_sessions = self.config.limits.max_sessions, "relay listening");
        self.accept_loop(listener).await
    }

    /// Accept loop over an already bound listener (lets callers bind on
    /// port 0 and learn the address first).
    pub async fn accept_loop(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("accept loop cancelled");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "transport connection accepted");
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        match ServerWsTransport::accept(stream).await {
                            Ok(transport) => {
                                if let Err(err) = server.attach(transport).await {
                                    debug!(%peer, %err, "connection rejected");
                                }
                            }
                            Err(err) => warn!(%peer, %err, "websocket handshake failed"),
                        }
                    });
                }
                Err(err) => {
                    // Transient accept errors (fd exhaustion etc.) should
                    // not kill the server.
                    warn!(%err, "accept failed");
                }
            }
        }
    }

    /// Attach one connected transport as a session and drive it to
    /// completion.
    ///
    /// Over capacity, the client is told why before the connection is
    /// dropped; the error is fatal for this attempt only.
    pub async fn attach<T>(&self, transport: T) -> Result<SessionId>
    where
        T: MessageTransport,
    {
        let slot = match self.try_reserve() {
            Ok(slot) => slot,
            Err(err) => {
                let (mut sink, _stream) = transport.split();
                sink.send(WireMessage::from_error(&err)).await.ok();
                sink.close().await.ok();
                return Err(err);
            }
        };
        let id = self.session_loop(transport).await;
        drop(slot);
        Ok(id)
    }

    fn try_reserve(&self) -> Result<SessionSlot> {
        let limit = self.config.limits.max_sessions;
        let reserved = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                if active < limit { Some(active + 1) } else { None }
            });
        match reserved {
            Ok(_) => Ok(SessionSlot { active: Arc::clone(&self.active) }),
            Err(active) => Err(RelayError::Capacity { active, limit }),
        }
    }

    /// One session's full lifecycle: reader loop, single-writer drain,
    /// close handshake, summary emission.
    async fn session_loop<T: MessageTransport>(&self, transport: T) -> SessionId {
        let (mut sink, mut stream) = transport.split();
        let mut session = Session::new(&self.config, Instant::now());
        session.handshake_complete();
        let id = session.id();
        info!(session = %id, "session established");

        let processor = Arc::new(FrameProcessor::new(
            FrameCodec::new(self.config.limits.max_frame_bytes),
            self.factory.create(),
        ));
        let queue = Arc::new(OutboundQueue::new(self.config.dispatch.outbound_queue_depth));
        let dispatcher = Dispatcher::new(
            processor,
            Arc::clone(&queue),
            self.config.timing.processing_ceiling(),
        );

        // Single writer per session: outbound FIFO ordering on the wire.
        let writer_queue = Arc::clone(&queue);
        let writer = tokio::spawn(async move {
            while let Some(msg) = writer_queue.pop().await {
                if let Err(err) = sink.send(msg).await {
                    debug!(%err, "outbound write failed; stopping writer");
                    break;
                }
            }
            sink.close().await.ok();
        });

        let idle_timeout = self.config.timing.idle_timeout();
        loop {
            // Inbound frames are handled strictly sequentially; the idle
            // clock runs only while we are actually waiting for traffic.
            let received = tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(session = %id, "session cancelled by server shutdown");
                    break;
                }
                received = tokio::time::timeout(idle_timeout, stream.recv()) => received,
            };
            match received {
                Err(_) => {
                    info!(session = %id, ?idle_timeout, "idle timeout; closing session");
                    break;
                }
                Ok(Ok(None)) => {
                    debug!(session = %id, "transport closed by peer");
                    break;
                }
                Ok(Ok(Some(text))) => match WireMessage::parse(&text) {
                    Ok(msg) => {
                        if dispatcher.dispatch(&mut session, msg).await == DispatchFlow::Close {
                            break;
                        }
                    }
                    Err(err) => {
                        debug!(session = %id, %err, "malformed inbound message");
                        dispatcher.reject_malformed(&mut session, &err);
                    }
                },
                Ok(Err(err)) => {
                    warn!(session = %id, %err, "transport error; closing session");
                    break;
                }
            }
        }

        // Close handshake: stop accepting frames, let the writer drain
        // within the grace period, then release everything.
        session.begin_close();
        queue.close();
        if tokio::time::timeout(self.config.timing.close_grace(), writer).await.is_err() {
            debug!(session = %id, "writer did not drain within grace period");
        }
        session.finish_close();

        let summary = session.summary(Instant::now());
        let analytics = Arc::clone(&self.sink);
        // Fire-and-forget: a failing or slow sink never affects streaming.
        tokio::spawn(async move {
            analytics.record(id, &summary);
        });
        info!(session = %id, "session closed");
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::Analysis;
    use crate::protocol::ControlAction;
    use crate::sink::LogSink;
    use crate::transport::channel_pair;
    use image::DynamicImage;
    use std::collections::BTreeMap;

    struct StubAnalyzer;

    impl LandmarkAnalyzer for StubAnalyzer {
        fn analyze(&self, _image: &DynamicImage) -> Result<Analysis> {
            Ok(Analysis { detections: BTreeMap::new(), confidence: 0.5, annotated: None })
        }
    }

    fn server_with_limit(max_sessions: usize) -> Arc<RelayServer> {
        let config = RelayConfig {
            limits: crate::config::LimitsConfig { max_sessions, ..Default::default() },
            ..Default::default()
        };
        let factory: Arc<dyn AnalyzerFactory> =
            Arc::new(|| Arc::new(StubAnalyzer) as Arc<dyn LandmarkAnalyzer>);
        Arc::new(RelayServer::new(config, factory, Arc::new(LogSink)))
    }

    #[tokio::test]
    async fn capacity_overflow_is_rejected_with_an_explicit_error() {
        let server = server_with_limit(1);

        // First session occupies the only slot.
        let (client_a, server_a) = channel_pair(8);
        let holder = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.attach(server_a).await })
        };
        // Give the first session a moment to reserve its slot.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(server.active_sessions(), 1);

        // Second connection is turned away with a capacity error message.
        let (mut client_b, server_b) = channel_pair(8);
        let err = server.attach(server_b).await.unwrap_err();
        assert!(matches!(err, RelayError::Capacity { active: 1, limit: 1 }));
        let text = client_b.recv().await.unwrap();
        match WireMessage::parse(&text).unwrap() {
            WireMessage::Error { code, .. } => assert_eq!(code, "capacity"),
            other => panic!("unexpected message: {other:?}"),
        }

        // Closing the first session frees the slot.
        drop(client_a);
        holder.await.unwrap().unwrap();
        assert_eq!(server.active_sessions(), 0);

        let (_client_c, server_c) = channel_pair(8);
        let server2 = Arc::clone(&server);
        let attach = tokio::spawn(async move { server2.attach(server_c).await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(server.active_sessions(), 1);
        server.cancel_token().cancel();
        attach.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stop_control_closes_the_session_with_a_summary() {
        let server = server_with_limit(4);
        let (mut client, server_end) = channel_pair(16);
        let task = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.attach(server_end).await })
        };

        client
            .send(WireMessage::Control {
                action: ControlAction::Start,
                payload: serde_json::Value::Null,
            })
            .await
            .unwrap();
        client
            .send(WireMessage::Control {
                action: ControlAction::Stop,
                payload: serde_json::Value::Null,
            })
            .await
            .unwrap();

        let mut saw_summary = false;
        while let Some(text) = client.recv().await {
            if matches!(WireMessage::parse(&text).unwrap(), WireMessage::SessionComplete { .. }) {
                saw_summary = true;
            }
        }
        assert!(saw_summary, "expected a session_complete before close");
        task.await.unwrap().unwrap();
        assert_eq!(server.active_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_closes_itself() {
        let mut config = RelayConfig::default();
        config.timing.idle_timeout_ms = 100;
        let factory: Arc<dyn AnalyzerFactory> =
            Arc::new(|| Arc::new(StubAnalyzer) as Arc<dyn LandmarkAnalyzer>);
        let server = Arc::new(RelayServer::new(config, factory, Arc::new(LogSink)));

        let (mut client, server_end) = channel_pair(8);
        let task = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.attach(server_end).await })
        };

        // No traffic at all: the session must close on its own, emitting
        // nothing.
        task.await.unwrap().unwrap();
        assert!(client.recv().await.is_none());
        assert_eq!(server.active_sessions(), 0);
    }
}
