//! Inbound message routing and the per-session outbound queue.
//!
//! The dispatcher routes one session's inbound messages: frame payloads go
//! through the frame processor (on a blocking thread, bounded by the
//! processing ceiling), control payloads mutate session state directly and
//! are acknowledged. Outbound messages land on a bounded FIFO queue
//! drained by a single writer, which guarantees on-wire ordering.
//!
//! The queue is the system's backpressure valve: when it is full, the
//! oldest *processed-frame* message is evicted and counted as a drop.
//! Control responses, summaries and errors are never evicted, so a slow
//! client costs frame loss, not unbounded memory.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::processor::{FrameProcessor, ProcessingResult};
use crate::protocol::{ControlAction, Frame, WireMessage};
use crate::session::{Session, SessionState};

/// Bounded per-session outbound queue with a single async consumer.
pub struct OutboundQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    depth: usize,
}

struct QueueInner {
    messages: VecDeque<WireMessage>,
    closed: bool,
}

impl OutboundQueue {
    pub fn new(depth: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner { messages: VecDeque::new(), closed: false }),
            notify: Notify::new(),
            depth: depth.max(1),
        }
    }

    /// Enqueue one message. Returns the message evicted to make room, if
    /// the queue was full and held something expendable.
    pub fn push(&self, msg: WireMessage) -> Option<WireMessage> {
        let mut inner = self.inner.lock().expect("outbound queue poisoned");
        if inner.closed {
            // Writer is gone; the message can only be dropped.
            return Some(msg);
        }
        let mut evicted = None;
        if inner.messages.len() >= self.depth {
            if let Some(pos) = inner.messages.iter().position(|m| m.is_droppable()) {
                evicted = inner.messages.remove(pos);
            }
            // A queue full of must-deliver messages grows past its depth;
            // those messages are rare and small.
        }
        inner.messages.push_back(msg);
        drop(inner);
        self.notify.notify_one();
        evicted
    }

    /// Dequeue the next message, waiting if the queue is empty. Returns
    /// `None` once the queue is closed and fully drained.
    pub async fn pop(&self) -> Option<WireMessage> {
        loop {
            {
                let mut inner = self.inner.lock().expect("outbound queue poisoned");
                if let Some(msg) = inner.messages.pop_front() {
                    return Some(msg);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Mark the queue closed. The writer drains what is already queued,
    /// then observes the end of stream.
    pub fn close(&self) {
        self.inner.lock().expect("outbound queue poisoned").closed = true;
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("outbound queue poisoned").messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What the session task should do after handling one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchFlow {
    Continue,
    /// A stop control or terminal condition was handled; begin closing.
    Close,
}

/// Routes one session's inbound messages and produces its outbound ones.
pub struct Dispatcher {
    processor: Arc<FrameProcessor>,
    queue: Arc<OutboundQueue>,
    processing_ceiling: Duration,
}

impl Dispatcher {
    pub fn new(
        processor: Arc<FrameProcessor>,
        queue: Arc<OutboundQueue>,
        processing_ceiling: Duration,
    ) -> Self {
        Self { processor, queue, processing_ceiling }
    }

    pub fn queue(&self) -> &Arc<OutboundQueue> {
        &self.queue
    }

    /// Handle one parsed inbound message.
    ///
    /// Per-frame failures are absorbed here and surfaced as outbound data;
    /// this method itself cannot fail.
    pub async fn dispatch(&self, session: &mut Session, msg: WireMessage) -> DispatchFlow {
        match msg {
            WireMessage::RawFrame { timestamp_ms, data, frame_number, metadata } => {
                let frame = Frame {
                    data,
                    client_number: frame_number,
                    captured_at_ms: timestamp_ms,
                    metadata,
                };
                self.handle_frame(session, frame).await;
                DispatchFlow::Continue
            }
            WireMessage::Control { action, payload } => {
                self.handle_control(session, action, payload)
            }
            // Server-bound kinds arriving from a client are a protocol
            // misuse; report and keep the connection open.
            other => {
                debug!(session = %session.id(), kind = ?other, "unexpected inbound message kind");
                self.send(
                    session,
                    WireMessage::from_error(&RelayError::protocol(
                        "message kind not valid in this direction",
                    )),
                );
                DispatchFlow::Continue
            }
        }
    }

    /// Report a malformed (non-parseable) inbound payload. Does not close
    /// the connection.
    pub fn reject_malformed(&self, session: &mut Session, err: &RelayError) {
        self.send(session, WireMessage::from_error(err));
    }

    async fn handle_frame(&self, session: &mut Session, frame: Frame) {
        let now = Instant::now();
        if !session.accepts_frames() {
            session.record_drop(now);
            return;
        }
        let Some(server_number) = session.admit_frame(frame.client_number, now) else {
            // Duplicate or regressed number; already counted.
            return;
        };

        let profile = session.quality().profile;
        let processor = Arc::clone(&self.processor);
        let received = Instant::now();
        let handle =
            tokio::task::spawn_blocking(move || (processor.process(&frame, profile), frame));

        // Frames are processed strictly sequentially within one session:
        // awaiting here bounds per-session memory and keeps ordering. The
        // ceiling abandons a stuck frame; the in-flight analysis is left
        // to finish on its blocking thread and its result is discarded.
        match tokio::time::timeout(self.processing_ceiling, handle).await {
            Ok(Ok((result, frame))) => {
                let latency = received.elapsed();
                self.deliver_result(session, server_number, &frame, result, latency);
            }
            Ok(Err(join_err)) => {
                warn!(session = %session.id(), %join_err, "processing task failed");
                session.record_drop(Instant::now());
            }
            Err(_) => {
                info!(
                    session = %session.id(),
                    server_number,
                    ceiling_ms = self.processing_ceiling.as_millis() as u64,
                    "frame abandoned past processing ceiling"
                );
                session.record_drop(Instant::now());
                self.send(
                    session,
                    WireMessage::from_error(&RelayError::Timeout {
                        duration: self.processing_ceiling,
                    }),
                );
            }
        }
    }

    fn deliver_result(
        &self,
        session: &mut Session,
        server_number: u64,
        frame: &Frame,
        result: ProcessingResult,
        latency: Duration,
    ) {
        let now = Instant::now();

        // An unreadable payload is skipped outright: an `error` message and
        // a drop count, no streaming-state side effects. Only decoded frames
        // count as valid for the lifecycle and the degradation window.
        if !result.decoded() {
            session.count_skipped();
            self.send(
                session,
                WireMessage::Error {
                    code: result.error_code.unwrap_or("decode_error").to_string(),
                    message: format!("frame {} skipped", result.client_frame_number),
                },
            );
            return;
        }

        let outcome = session.record_result(&result, latency, now);
        let processing_time_ms = result.total_ms();

        // An encode failure skips the frame too; an analysis failure still
        // ships a degraded processed frame.
        match (result.annotated, result.error_code) {
            (Some(data), _) => {
                self.send(
                    session,
                    WireMessage::ProcessedFrame {
                        timestamp_ms: frame.captured_at_ms,
                        data: Some(data),
                        server_frame_number: server_number,
                        client_frame_number: result.client_frame_number,
                        processing_time_ms,
                        detections: result.detections,
                        confidence: result.confidence,
                        success: result.success,
                    },
                );
            }
            (None, code) => {
                session.count_skipped();
                self.send(
                    session,
                    WireMessage::Error {
                        code: code.unwrap_or("encode_error").to_string(),
                        message: format!("frame {} skipped", result.client_frame_number),
                    },
                );
            }
        }

        if let Some(transition) = outcome.transition {
            let (code, message) = match transition.to {
                SessionState::Degraded => (
                    "session_degraded",
                    "processing failure rate exceeded threshold; results may be degraded",
                ),
                _ => ("session_recovered", "processing failure rate back below threshold"),
            };
            info!(session = %session.id(), ?transition, "session state changed");
            self.send(
                session,
                WireMessage::Error { code: code.into(), message: message.into() },
            );
        }

        if let Some(adjustment) = outcome.adjustment {
            info!(
                session = %session.id(),
                profile = ?adjustment.state.profile,
                target_fps = adjustment.state.target_fps,
                direction = ?adjustment.direction,
                "quality adjusted"
            );
            self.send(
                session,
                WireMessage::ControlResponse {
                    action: ControlAction::Quality,
                    payload: serde_json::json!({
                        "profile": adjustment.state.profile,
                        "target_fps": adjustment.state.target_fps,
                    }),
                    success: true,
                },
            );
        }
    }

    fn handle_control(
        &self,
        session: &mut Session,
        action: ControlAction,
        _payload: serde_json::Value,
    ) -> DispatchFlow {
        session.touch(Instant::now());
        match action {
            ControlAction::Start => {
                session.start_streaming();
                self.send(
                    session,
                    WireMessage::ControlResponse {
                        action,
                        payload: serde_json::json!({
                            "session_id": session.id().to_string(),
                            "target_fps": session.quality().target_fps,
                        }),
                        success: true,
                    },
                );
                DispatchFlow::Continue
            }
            ControlAction::Next => {
                let step = session.advance_step();
                self.send(
                    session,
                    WireMessage::ControlResponse {
                        action,
                        payload: serde_json::json!({ "step": step }),
                        success: true,
                    },
                );
                DispatchFlow::Continue
            }
            ControlAction::Stop => {
                self.send(
                    session,
                    WireMessage::ControlResponse {
                        action,
                        payload: serde_json::Value::Null,
                        success: true,
                    },
                );
                self.send(
                    session,
                    WireMessage::SessionComplete { summary: session.summary(Instant::now()) },
                );
                DispatchFlow::Close
            }
            ControlAction::Quality => {
                // Clients do not drive quality; refuse politely.
                self.send(
                    session,
                    WireMessage::ControlResponse {
                        action,
                        payload: serde_json::Value::Null,
                        success: false,
                    },
                );
                DispatchFlow::Continue
            }
        }
    }

    /// Enqueue an outbound message, converting an eviction into a drop on
    /// this session's counter.
    fn send(&self, session: &mut Session, msg: WireMessage) {
        if let Some(evicted) = self.queue.push(msg) {
            if evicted.is_droppable() {
                debug!(
                    session = %session.id(),
                    "outbound queue full; evicted oldest processed frame"
                );
                session.record_drop(Instant::now());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{Analysis, LandmarkAnalyzer};
    use crate::codec::FrameCodec;
    use crate::config::RelayConfig;
    use crate::error::Result;
    use crate::quality::QualityProfile;
    use image::DynamicImage;
    use std::collections::BTreeMap;

    fn processed(n: u64) -> WireMessage {
        WireMessage::ProcessedFrame {
            timestamp_ms: 0,
            data: None,
            server_frame_number: n,
            client_frame_number: n,
            processing_time_ms: 1,
            detections: BTreeMap::new(),
            confidence: Some(0.5),
            success: true,
        }
    }

    #[test]
    fn queue_is_fifo() {
        let queue = OutboundQueue::new(8);
        for n in 0..4 {
            assert!(queue.push(processed(n)).is_none());
        }
        queue.close();
        let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
        let order: Vec<u64> = rt.block_on(async {
            let mut out = Vec::new();
            while let Some(WireMessage::ProcessedFrame { server_frame_number, .. }) =
                queue.pop().await
            {
                out.push(server_frame_number);
            }
            out
        });
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[test]
    fn overflow_evicts_oldest_processed_frame_only() {
        let queue = OutboundQueue::new(3);
        let control = WireMessage::ControlResponse {
            action: ControlAction::Start,
            payload: serde_json::Value::Null,
            success: true,
        };
        assert!(queue.push(control.clone()).is_none());
        assert!(queue.push(processed(1)).is_none());
        assert!(queue.push(processed(2)).is_none());

        // Full: the oldest *processed frame* goes, not the control message.
        let evicted = queue.push(processed(3)).expect("eviction");
        match evicted {
            WireMessage::ProcessedFrame { server_frame_number, .. } => {
                assert_eq!(server_frame_number, 1)
            }
            other => panic!("evicted wrong message: {other:?}"),
        }
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn must_deliver_messages_are_never_evicted() {
        let queue = OutboundQueue::new(2);
        let complete = WireMessage::SessionComplete {
            summary: crate::protocol::SessionSummaryPayload {
                message: "done".into(),
                score: 1.0,
                elapsed_ms: 1,
            },
        };
        assert!(queue.push(complete.clone()).is_none());
        assert!(queue.push(complete.clone()).is_none());
        // Nothing droppable in the queue: it grows rather than lose these.
        assert!(queue.push(complete).is_none());
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn push_after_close_is_dropped() {
        let queue = OutboundQueue::new(2);
        queue.close();
        assert!(queue.push(processed(1)).is_some());
    }

    struct HappyAnalyzer;

    impl LandmarkAnalyzer for HappyAnalyzer {
        fn analyze(&self, image: &DynamicImage) -> Result<Analysis> {
            Ok(Analysis {
                detections: BTreeMap::from([("hands".to_string(), true)]),
                confidence: 0.9,
                annotated: Some(image.clone()),
            })
        }
    }

    fn fixture(cfg: &RelayConfig) -> (Dispatcher, Session) {
        let processor = Arc::new(FrameProcessor::new(
            FrameCodec::new(cfg.limits.max_frame_bytes),
            Arc::new(HappyAnalyzer),
        ));
        let queue = Arc::new(OutboundQueue::new(cfg.dispatch.outbound_queue_depth));
        let dispatcher = Dispatcher::new(processor, queue, cfg.timing.processing_ceiling());
        let mut session = Session::new(cfg, Instant::now());
        session.handshake_complete();
        (dispatcher, session)
    }

    fn jpeg_frame(number: u64) -> WireMessage {
        let codec = FrameCodec::new(1024 * 1024);
        let data = codec.encode(&DynamicImage::new_rgb8(64, 48), QualityProfile::Balanced).unwrap();
        WireMessage::RawFrame {
            timestamp_ms: number * 33,
            data,
            frame_number: number,
            metadata: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn valid_frame_produces_processed_frame_message() {
        let cfg = RelayConfig::default();
        let (dispatcher, mut session) = fixture(&cfg);

        let flow = dispatcher.dispatch(&mut session, jpeg_frame(1)).await;
        assert_eq!(flow, DispatchFlow::Continue);
        assert_eq!(session.state(), SessionState::Streaming);

        match dispatcher.queue().pop().await.unwrap() {
            WireMessage::ProcessedFrame { success, client_frame_number, detections, .. } => {
                assert!(success);
                assert_eq!(client_frame_number, 1);
                assert_eq!(detections.get("hands"), Some(&true));
            }
            other => panic!("unexpected outbound message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_byte_frame_reports_decode_error_and_keeps_session_open() {
        let cfg = RelayConfig::default();
        let (dispatcher, mut session) = fixture(&cfg);

        let msg = WireMessage::RawFrame {
            timestamp_ms: 0,
            data: Vec::new(),
            frame_number: 1,
            metadata: serde_json::Value::Null,
        };
        let flow = dispatcher.dispatch(&mut session, msg).await;
        assert_eq!(flow, DispatchFlow::Continue);

        // The skipped frame is answered with an error message and counted
        // as a drop; an unreadable payload is not a valid first frame, so
        // the session stays Open and undegraded.
        assert_eq!(session.state(), SessionState::Open);
        match dispatcher.queue().pop().await.unwrap() {
            WireMessage::Error { code, .. } => assert_eq!(code, "decode_error"),
            other => panic!("unexpected outbound message: {other:?}"),
        }
        assert_eq!(session.frames_dropped(), 1);

        // A decodable frame afterwards starts streaming normally.
        dispatcher.dispatch(&mut session, jpeg_frame(2)).await;
        assert_eq!(session.state(), SessionState::Streaming);
    }

    #[tokio::test]
    async fn control_start_and_next_are_acknowledged() {
        let cfg = RelayConfig::default();
        let (dispatcher, mut session) = fixture(&cfg);

        let msg = WireMessage::Control {
            action: ControlAction::Start,
            payload: serde_json::Value::Null,
        };
        assert_eq!(dispatcher.dispatch(&mut session, msg).await, DispatchFlow::Continue);
        assert_eq!(session.state(), SessionState::Streaming);

        let msg =
            WireMessage::Control { action: ControlAction::Next, payload: serde_json::Value::Null };
        dispatcher.dispatch(&mut session, msg).await;
        assert_eq!(session.current_step(), 1);

        match dispatcher.queue().pop().await.unwrap() {
            WireMessage::ControlResponse { action: ControlAction::Start, success, .. } => {
                assert!(success)
            }
            other => panic!("unexpected outbound message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_emits_ack_then_summary_and_closes() {
        let cfg = RelayConfig::default();
        let (dispatcher, mut session) = fixture(&cfg);
        dispatcher.dispatch(&mut session, jpeg_frame(1)).await;

        let msg =
            WireMessage::Control { action: ControlAction::Stop, payload: serde_json::Value::Null };
        assert_eq!(dispatcher.dispatch(&mut session, msg).await, DispatchFlow::Close);

        let mut kinds = Vec::new();
        dispatcher.queue().close();
        while let Some(msg) = dispatcher.queue().pop().await {
            kinds.push(msg);
        }
        assert!(matches!(kinds.last(), Some(WireMessage::SessionComplete { summary })
            if summary.message.contains("processed 1 frames")));
    }

    #[tokio::test]
    async fn frame_accounting_is_exact() {
        let cfg = RelayConfig::default();
        let (dispatcher, mut session) = fixture(&cfg);

        // 5 valid frames, 2 duplicates, 1 undecodable: every submission is
        // either answered with a processed_frame or counted as a drop.
        for n in [1u64, 2, 3, 3, 4, 4, 5] {
            dispatcher.dispatch(&mut session, jpeg_frame(n)).await;
        }
        let bad = WireMessage::RawFrame {
            timestamp_ms: 0,
            data: vec![0xde, 0xad],
            frame_number: 6,
            metadata: serde_json::Value::Null,
        };
        dispatcher.dispatch(&mut session, bad).await;

        dispatcher.queue().close();
        let mut emitted = 0u64;
        while let Some(msg) = dispatcher.queue().pop().await {
            if matches!(msg, WireMessage::ProcessedFrame { .. }) {
                emitted += 1;
            }
        }
        assert_eq!(emitted + session.frames_dropped(), 8);
    }
}
