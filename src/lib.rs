//! Real-time frame streaming and landmark-analysis relay.
//!
//! Framelink accepts a continuous sequence of camera frames over a
//! persistent bidirectional connection, runs each frame through a
//! pluggable visual-landmark analyzer, and streams the annotated result
//! back with bounded latency.
//!
//! # Features
//!
//! - **Per-session isolation**: one session, one processor, one outbound
//!   queue — no shared mutable state across clients
//! - **Graceful degradation**: per-frame failures become data, never
//!   faults; repeated failure degrades a session instead of closing it
//! - **Adaptive quality**: live latency telemetry steps compression,
//!   resolution and target frame rate up and down
//! - **Bounded everything**: frame size caps, queue depth, processing
//!   ceilings and idle timeouts
//!
//! # Quick start (server)
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use framelink::{Relay, RelayConfig, LandmarkAnalyzer, Analysis};
//!
//! struct MyDetector;
//!
//! impl LandmarkAnalyzer for MyDetector {
//!     fn analyze(&self, image: &image::DynamicImage) -> framelink::Result<Analysis> {
//!         # let _ = image;
//!         todo!("call into the detection model")
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> framelink::Result<()> {
//!     let server = Relay::server(RelayConfig::default(), || {
//!         Arc::new(MyDetector) as Arc<dyn LandmarkAnalyzer>
//!     });
//!     server.serve("0.0.0.0:9443".parse().unwrap()).await
//! }
//! ```
//!
//! # Quick start (client)
//!
//! ```rust,no_run
//! use framelink::{Relay, RelayConfig, ControlAction};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> framelink::Result<()> {
//!     let client = Relay::client("ws://localhost:9443", RelayConfig::default());
//!     client
//!         .run(CancellationToken::new(), |mut session| async move {
//!             session.send_control(ControlAction::Start, serde_json::Value::Null).await?;
//!             while let Some(msg) = session.next_message().await? {
//!                 println!("{msg:?}");
//!             }
//!             Ok(())
//!         })
//!         .await
//! }
//! ```

pub mod analyzer;
pub mod client;
pub mod codec;
pub mod config;
pub mod dispatch;
mod error;
pub mod manager;
pub mod processor;
pub mod protocol;
pub mod quality;
pub mod reconnect;
pub mod session;
pub mod sink;
pub mod stream;
pub mod transport;

// Core exports
pub use analyzer::{Analysis, LandmarkAnalyzer};
pub use codec::FrameCodec;
pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use processor::{FrameProcessor, ProcessingResult};
pub use protocol::{ControlAction, Frame, SessionSummaryPayload, WireMessage};
pub use quality::{QualityProfile, QualityState};
pub use session::{Session, SessionId, SessionState};

// Pipeline exports
pub use client::{ConnectedClient, RelayClient};
pub use dispatch::{Dispatcher, OutboundQueue};
pub use manager::{AnalyzerFactory, RelayServer};
pub use reconnect::Backoff;
pub use sink::{LogSink, SessionSink};
pub use stream::PaceExt;

use std::sync::Arc;

/// Unified entry point for relay endpoints.
///
/// Constructs either side of the protocol with the same configuration
/// type; both sides share the wire protocol in [`protocol`].
pub struct Relay;

impl Relay {
    /// Build a server that creates one analyzer per accepted session.
    pub fn server<F>(config: RelayConfig, factory: F) -> Arc<RelayServer>
    where
        F: Fn() -> Arc<dyn LandmarkAnalyzer> + Send + Sync + 'static,
    {
        Arc::new(RelayServer::new(config, Arc::new(factory), Arc::new(LogSink)))
    }

    /// Build a server that reports session summaries to a custom sink.
    pub fn server_with_sink<F>(
        config: RelayConfig,
        factory: F,
        sink: Arc<dyn SessionSink>,
    ) -> Arc<RelayServer>
    where
        F: Fn() -> Arc<dyn LandmarkAnalyzer> + Send + Sync + 'static,
    {
        Arc::new(RelayServer::new(config, Arc::new(factory), sink))
    }

    /// Build a reconnecting client for the given relay URL.
    pub fn client(url: impl Into<String>, config: RelayConfig) -> RelayClient {
        RelayClient::new(url, config)
    }
}
