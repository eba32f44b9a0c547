//! Session orchestration
//!
//! A [`RelaySession`] is the single entry point of the relay. Starting it
//! spawns the upstream pump and returns the byte stream to send to the client
//! together with a handle for the session report.
//!
//! The client stream is driven by a small state machine:
//!
//! ```text
//! Idle -> Opening -> Streaming -> Finalizing -> Closed
//!            \___________________/
//!             pre-stream error
//! ```
//!
//! Whatever the outcome, the client stream ends with exactly one `[DONE]` frame.
//! An error frame is only synthesized while the client has seen no upstream
//! content yet.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::bridge::{BridgeReport, RelayBridge, RelayItem};
use super::detector::ProxyErrorDetector;
use super::frames;
use super::outcome::RelayOutcome;
use crate::config::RelayConfig;
use crate::error::Result;
use crate::message::Role;
use crate::upstream::{ChunkStream, START_FAILURE_MESSAGE, UpstreamError};

/// Per-session relay tuning
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub queue_capacity: usize,
    pub detector: ProxyErrorDetector,
}

impl RelaySettings {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            queue_capacity: config.effective_queue_capacity(),
            detector: ProxyErrorDetector::new(config.proxy_error_marker.clone()),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::from_config(&RelayConfig::default())
    }
}

/// Receives the finished transcript of a session.
///
/// Exactly one method is called per finalized session, after its closing
/// frames have been decided. Failures are logged and never reach the client.
#[async_trait]
pub trait TranscriptSink: Send + Sync {
    async fn persist(&self, conversation_id: &str, role: Role, transcript: &str) -> Result<()>;

    async fn discard(&self, conversation_id: &str, outcome: &RelayOutcome);
}

/// Summary of a finalized session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub conversation_id: String,
    pub outcome: RelayOutcome,
    pub forwarded_chunks: usize,
    /// Whether the relay wrote an error frame of its own
    pub synthesized_error: bool,
}

/// Resolves once the closing frames of a session are decided
#[derive(Debug)]
pub struct ReportHandle {
    rx: oneshot::Receiver<SessionReport>,
}

impl ReportHandle {
    /// Wait for the report; `None` if the client went away first
    pub async fn outcome(self) -> Option<SessionReport> {
        self.rx.await.ok()
    }
}

/// A started session
pub struct RelayHandle {
    /// Frames to write to the client, in order
    pub client_stream: BoxStream<'static, Bytes>,
    pub report: ReportHandle,
}

/// One client request relayed from the gateway
pub struct RelaySession {
    conversation_id: String,
    settings: RelaySettings,
    sink: Option<Arc<dyn TranscriptSink>>,
}

impl RelaySession {
    pub fn new(conversation_id: impl Into<String>, settings: RelaySettings) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            settings,
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn TranscriptSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Spawn the upstream pump and return the client side of the session.
    ///
    /// `open` is polled on the pump task; it should connect to the gateway and
    /// return the response body as a chunk stream.
    pub fn start<F>(self, open: F) -> RelayHandle
    where
        F: Future<Output = std::result::Result<ChunkStream, UpstreamError>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(self.settings.queue_capacity.max(1));
        let (report_tx, report_rx) = oneshot::channel();

        tracing::info!(
            conversation_id = %self.conversation_id,
            queue_capacity = self.settings.queue_capacity,
            "Starting relay session"
        );

        let bridge = RelayBridge::new(self.settings.detector);
        tokio::spawn(bridge.run(open, tx));

        let driver = SessionDriver {
            conversation_id: self.conversation_id,
            state: SessionState::Idle,
            rx,
            pending: VecDeque::new(),
            forwarded: 0,
            frames: 0,
            report_tx: Some(report_tx),
            sink: self.sink,
        };

        let client_stream = stream::unfold(driver, |mut driver| async move {
            let frame = driver.next_frame().await?;
            Some((frame, driver))
        })
        .boxed();

        RelayHandle {
            client_stream,
            report: ReportHandle { rx: report_rx },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    Opening,
    Streaming,
    Finalizing,
    Closed,
}

struct SessionDriver {
    conversation_id: String,
    state: SessionState,
    rx: mpsc::Receiver<RelayItem>,
    pending: VecDeque<Bytes>,
    forwarded: usize,
    frames: usize,
    report_tx: Option<oneshot::Sender<SessionReport>>,
    sink: Option<Arc<dyn TranscriptSink>>,
}

impl SessionDriver {
    async fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                self.frames += 1;
                return Some(frame);
            }

            match self.state {
                SessionState::Idle => {
                    self.pending.push_back(frames::open_comment());
                    self.pending.push_back(frames::meta(&self.conversation_id));
                    self.state = SessionState::Opening;
                }
                SessionState::Opening | SessionState::Streaming => match self.rx.recv().await {
                    Some(RelayItem::Chunk(chunk)) => {
                        if self.state == SessionState::Opening {
                            tracing::debug!(
                                conversation_id = %self.conversation_id,
                                "First upstream byte received"
                            );
                            self.state = SessionState::Streaming;
                        }
                        self.forwarded += 1;
                        self.frames += 1;
                        return Some(chunk);
                    }
                    Some(RelayItem::End(report)) => self.finalize(report),
                    None => self.finalize(BridgeReport::abandoned(self.forwarded)),
                },
                SessionState::Finalizing => self.state = SessionState::Closed,
                SessionState::Closed => return None,
            }
        }
    }

    fn finalize(&mut self, report: BridgeReport) {
        self.state = SessionState::Finalizing;

        let error_frame = match &report.outcome {
            RelayOutcome::UpstreamPreStreamError { message, .. } => Some(message.as_str()),
            RelayOutcome::UpstreamMidStreamError { .. } | RelayOutcome::ProxyErrorSignaled { .. }
                if report.chunks_forwarded == 0 =>
            {
                Some(START_FAILURE_MESSAGE)
            }
            _ => None,
        };
        let synthesized_error = error_frame.is_some();

        if report.open_line && (synthesized_error || !report.saw_sentinel) {
            self.pending.push_back(frames::line_break());
        }
        if let Some(message) = error_frame {
            self.pending.push_back(frames::error(message));
        }
        if !report.saw_sentinel {
            self.pending.push_back(frames::done());
        }

        if report.outcome.is_error() {
            tracing::warn!(
                conversation_id = %self.conversation_id,
                outcome = report.outcome.label(),
                forwarded_chunks = report.chunks_forwarded,
                frames = self.frames + self.pending.len(),
                synthesized_error,
                "Relay session finished with an upstream error"
            );
        } else {
            tracing::info!(
                conversation_id = %self.conversation_id,
                outcome = report.outcome.label(),
                forwarded_chunks = report.chunks_forwarded,
                frames = self.frames + self.pending.len(),
                "Relay session finished"
            );
        }

        let summary = SessionReport {
            conversation_id: self.conversation_id.clone(),
            outcome: report.outcome.clone(),
            forwarded_chunks: report.chunks_forwarded,
            synthesized_error,
        };
        if let Some(report_tx) = self.report_tx.take() {
            // Nobody waiting on the report is fine.
            let _ = report_tx.send(summary);
        }

        if let Some(sink) = self.sink.take() {
            let conversation_id = self.conversation_id.clone();
            tokio::spawn(hand_off(sink, conversation_id, report.outcome));
        }
    }
}

impl Drop for SessionDriver {
    fn drop(&mut self) {
        if matches!(
            self.state,
            SessionState::Opening | SessionState::Streaming
        ) {
            tracing::info!(
                conversation_id = %self.conversation_id,
                forwarded_chunks = self.forwarded,
                "Client disconnected before the relay finished"
            );
        }
    }
}

async fn hand_off(sink: Arc<dyn TranscriptSink>, conversation_id: String, outcome: RelayOutcome) {
    match outcome.transcript() {
        Some(transcript) => {
            if let Err(e) = sink
                .persist(&conversation_id, Role::Assistant, transcript)
                .await
            {
                tracing::warn!(
                    error_type = "persist",
                    error_message = %e,
                    conversation_id = %conversation_id,
                    "Failed to persist assistant transcript"
                );
            }
        }
        None => sink.discard(&conversation_id, &outcome).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::parser::{FrameParser, SseRecord};
    use crate::testing::{RecordingSink, SinkCall, chunk_stream, collect_frames, delta_frame};
    use std::time::Duration;

    fn settings() -> RelaySettings {
        RelaySettings::default()
    }

    fn ok(chunk: impl Into<String>) -> std::result::Result<Bytes, UpstreamError> {
        Ok(Bytes::from(chunk.into()))
    }

    fn done_count(frames: &[Bytes]) -> usize {
        let mut parser = FrameParser::new();
        frames
            .iter()
            .flat_map(|frame| parser.feed(frame))
            .filter(SseRecord::is_sentinel)
            .count()
    }

    fn error_frames(frames: &[Bytes]) -> Vec<String> {
        let mut parser = FrameParser::new();
        frames
            .iter()
            .flat_map(|frame| parser.feed(frame))
            .filter_map(|record| match record {
                SseRecord::Data(data) => serde_json::from_str::<serde_json::Value>(&data).ok(),
                SseRecord::Done => None,
            })
            .filter_map(|value| value.get("message")?.as_str().map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn test_successful_session_frames() {
        let upstream = chunk_stream(vec![
            ok(delta_frame("Hi")),
            ok(delta_frame(" there")),
            ok("data: [DONE]\n\n"),
        ]);
        let handle = RelaySession::new("conv-1", settings()).start(async { Ok(upstream) });

        let frames = collect_frames(handle.client_stream).await;
        assert_eq!(frames[0], frames::open_comment());
        assert_eq!(frames[1], frames::meta("conv-1"));
        assert_eq!(frames[2], Bytes::from(delta_frame("Hi")));
        assert_eq!(frames.len(), 5);
        assert_eq!(done_count(&frames), 1);

        let report = handle.report.outcome().await.unwrap();
        assert_eq!(
            report.outcome,
            RelayOutcome::Completed {
                transcript: "Hi there".to_string()
            }
        );
        assert_eq!(report.forwarded_chunks, 3);
        assert!(!report.synthesized_error);
    }

    #[tokio::test]
    async fn test_missing_upstream_sentinel_is_appended() {
        let upstream = chunk_stream(vec![ok(delta_frame("Hi"))]);
        let handle = RelaySession::new("conv-1", settings()).start(async { Ok(upstream) });

        let frames = collect_frames(handle.client_stream).await;
        assert_eq!(frames.last().unwrap(), &frames::done());
        assert_eq!(done_count(&frames), 1);
    }

    #[tokio::test]
    async fn test_pre_stream_error_emits_error_then_done() {
        let open = async {
            Err(UpstreamError::PreStream {
                status: Some(503),
                message: "down".to_string(),
            })
        };
        let handle = RelaySession::new("conv-1", settings()).start(open);

        let frames = collect_frames(handle.client_stream).await;
        assert_eq!(
            frames,
            vec![
                frames::open_comment(),
                frames::meta("conv-1"),
                frames::error("down"),
                frames::done(),
            ]
        );

        let report = handle.report.outcome().await.unwrap();
        assert_eq!(
            report.outcome,
            RelayOutcome::UpstreamPreStreamError {
                status: Some(503),
                message: "down".to_string()
            }
        );
        assert!(report.synthesized_error);
    }

    #[tokio::test]
    async fn test_mid_stream_error_after_content_is_swallowed() {
        let upstream = chunk_stream(vec![
            ok(delta_frame("partial")),
            Err(UpstreamError::MidStream("connection reset".to_string())),
        ]);
        let handle = RelaySession::new("conv-1", settings()).start(async { Ok(upstream) });

        let frames = collect_frames(handle.client_stream).await;
        assert!(error_frames(&frames).is_empty());
        assert_eq!(frames[2], Bytes::from(delta_frame("partial")));
        assert_eq!(frames[3], frames::done());
        assert_eq!(frames.len(), 4);

        let report = handle.report.outcome().await.unwrap();
        assert!(matches!(
            report.outcome,
            RelayOutcome::UpstreamMidStreamError { .. }
        ));
        assert!(!report.synthesized_error);
    }

    #[tokio::test]
    async fn test_mid_stream_error_inside_a_line_still_ends_with_done() {
        let upstream = chunk_stream(vec![
            ok(delta_frame("Hi")),
            ok("data: {\"choices\":[{\"delta\":{\"content\":\"Hel"),
            Err(UpstreamError::MidStream("connection reset".to_string())),
        ]);
        let handle = RelaySession::new("conv-1", settings()).start(async { Ok(upstream) });

        let frames = collect_frames(handle.client_stream).await;
        assert_eq!(done_count(&frames), 1);
        assert!(error_frames(&frames).is_empty());
        assert_eq!(frames[4], frames::line_break());
        assert_eq!(frames.last().unwrap(), &frames::done());

        let report = handle.report.outcome().await.unwrap();
        assert!(matches!(
            report.outcome,
            RelayOutcome::UpstreamMidStreamError { .. }
        ));
    }

    #[tokio::test]
    async fn test_exhaustion_inside_a_line_still_ends_with_done() {
        let upstream = chunk_stream(vec![ok("data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}")]);
        let handle = RelaySession::new("conv-1", settings()).start(async { Ok(upstream) });

        let frames = collect_frames(handle.client_stream).await;
        assert_eq!(frames.len(), 5);
        assert_eq!(done_count(&frames), 1);
    }

    #[tokio::test]
    async fn test_mid_stream_error_before_content_shows_generic_error() {
        let upstream = chunk_stream(vec![Err(UpstreamError::MidStream("reset".to_string()))]);
        let handle = RelaySession::new("conv-1", settings()).start(async { Ok(upstream) });

        let frames = collect_frames(handle.client_stream).await;
        assert_eq!(error_frames(&frames), vec![START_FAILURE_MESSAGE.to_string()]);
        assert_eq!(done_count(&frames), 1);
        assert!(handle.report.outcome().await.unwrap().synthesized_error);
    }

    #[tokio::test]
    async fn test_proxy_error_signal_before_content() {
        let upstream = chunk_stream(vec![ok(
            "data: {\"error\":{\"message\":\"litellm.APIConnectionError: x\"}}\n\n",
        )]);
        let handle = RelaySession::new("conv-1", settings()).start(async { Ok(upstream) });

        let frames = collect_frames(handle.client_stream).await;
        assert_eq!(
            frames,
            vec![
                frames::open_comment(),
                frames::meta("conv-1"),
                frames::error(START_FAILURE_MESSAGE),
                frames::done(),
            ]
        );
        assert_eq!(
            handle.report.outcome().await.unwrap().outcome,
            RelayOutcome::ProxyErrorSignaled {
                partial: String::new()
            }
        );
    }

    #[tokio::test]
    async fn test_configured_marker_is_used() {
        let settings = RelaySettings::from_config(&RelayConfig {
            proxy_error_marker: "gateway.Unreachable".to_string(),
            ..RelayConfig::default()
        });
        let upstream = chunk_stream(vec![
            ok(delta_frame("a")),
            ok("data: {\"error\":\"gateway.Unreachable\"}\n\n"),
        ]);
        let handle = RelaySession::new("conv-1", settings).start(async { Ok(upstream) });

        let frames = collect_frames(handle.client_stream).await;
        assert_eq!(frames.len(), 4);
        assert_eq!(
            handle.report.outcome().await.unwrap().outcome,
            RelayOutcome::ProxyErrorSignaled {
                partial: "a".to_string()
            }
        );
    }

    // =========================================================================
    // Transcript sink
    // =========================================================================

    mod sink_tests {
        use super::*;

        async fn next_call(
            calls: &mut tokio::sync::mpsc::UnboundedReceiver<SinkCall>,
        ) -> SinkCall {
            tokio::time::timeout(Duration::from_secs(1), calls.recv())
                .await
                .expect("sink call")
                .expect("sink open")
        }

        #[tokio::test]
        async fn test_completed_transcript_is_persisted() {
            let (sink, mut calls) = RecordingSink::new();
            let upstream = chunk_stream(vec![ok(delta_frame("Hello")), ok("data: [DONE]\n\n")]);
            let handle = RelaySession::new("conv-1", settings())
                .with_sink(sink)
                .start(async { Ok(upstream) });

            collect_frames(handle.client_stream).await;

            assert_eq!(
                next_call(&mut calls).await,
                SinkCall::Persisted {
                    conversation_id: "conv-1".to_string(),
                    role: Role::Assistant,
                    transcript: "Hello".to_string(),
                }
            );
        }

        #[tokio::test]
        async fn test_empty_transcript_is_discarded() {
            let (sink, mut calls) = RecordingSink::new();
            let upstream = chunk_stream(vec![ok("data: [DONE]\n\n")]);
            let handle = RelaySession::new("conv-1", settings())
                .with_sink(sink)
                .start(async { Ok(upstream) });

            collect_frames(handle.client_stream).await;

            assert_eq!(
                next_call(&mut calls).await,
                SinkCall::Discarded {
                    conversation_id: "conv-1".to_string(),
                    outcome: RelayOutcome::CompletedEmpty,
                }
            );
        }

        #[tokio::test]
        async fn test_partial_transcript_after_error_is_discarded() {
            let (sink, mut calls) = RecordingSink::new();
            let upstream = chunk_stream(vec![
                ok(delta_frame("partial")),
                Err(UpstreamError::MidStream("reset".to_string())),
            ]);
            let handle = RelaySession::new("conv-1", settings())
                .with_sink(sink)
                .start(async { Ok(upstream) });

            collect_frames(handle.client_stream).await;

            assert!(matches!(
                next_call(&mut calls).await,
                SinkCall::Discarded {
                    outcome: RelayOutcome::UpstreamMidStreamError { .. },
                    ..
                }
            ));
        }

        #[tokio::test]
        async fn test_partial_transcript_before_proxy_error_is_persisted() {
            let (sink, mut calls) = RecordingSink::new();
            let upstream = chunk_stream(vec![
                ok(delta_frame("partial")),
                ok("data: {\"error\":{\"message\":\"litellm.APIConnectionError: x\"}}\n\n"),
            ]);
            let handle = RelaySession::new("conv-1", settings())
                .with_sink(sink)
                .start(async { Ok(upstream) });

            let frames = collect_frames(handle.client_stream).await;
            assert!(error_frames(&frames).is_empty());
            assert_eq!(done_count(&frames), 1);

            assert_eq!(
                next_call(&mut calls).await,
                SinkCall::Persisted {
                    conversation_id: "conv-1".to_string(),
                    role: Role::Assistant,
                    transcript: "partial".to_string(),
                }
            );
        }

        #[tokio::test]
        async fn test_persist_failure_does_not_change_client_frames() {
            let (sink, mut calls) = RecordingSink::failing();
            let upstream = chunk_stream(vec![ok(delta_frame("Hello")), ok("data: [DONE]\n\n")]);
            let handle = RelaySession::new("conv-1", settings())
                .with_sink(sink)
                .start(async { Ok(upstream) });

            let frames = collect_frames(handle.client_stream).await;
            assert!(error_frames(&frames).is_empty());
            assert_eq!(done_count(&frames), 1);
            assert!(matches!(
                next_call(&mut calls).await,
                SinkCall::Persisted { .. }
            ));
        }
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    mod cancellation_tests {
        use super::*;
        use tokio_stream::wrappers::ReceiverStream;

        #[tokio::test]
        async fn test_client_disconnect_closes_upstream() {
            let (upstream_tx, upstream_rx) = mpsc::channel(4);
            let upstream = ReceiverStream::new(upstream_rx).boxed();
            let handle = RelaySession::new("conv-1", settings()).start(async { Ok(upstream) });

            let mut client = handle.client_stream;
            assert_eq!(client.next().await, Some(frames::open_comment()));
            assert_eq!(client.next().await, Some(frames::meta("conv-1")));

            upstream_tx.send(ok(delta_frame("a"))).await.unwrap();
            assert_eq!(client.next().await, Some(Bytes::from(delta_frame("a"))));

            drop(client);
            let _ = upstream_tx.send(ok(delta_frame("b"))).await;
            tokio::time::timeout(Duration::from_secs(1), upstream_tx.closed())
                .await
                .expect("upstream released after client disconnect");

            assert!(handle.report.outcome().await.is_none());
        }

        #[tokio::test]
        async fn test_client_disconnect_releases_idle_upstream() {
            let (upstream_tx, upstream_rx) =
                mpsc::channel::<std::result::Result<Bytes, UpstreamError>>(4);
            let upstream = ReceiverStream::new(upstream_rx).boxed();
            let handle = RelaySession::new("conv-1", settings()).start(async { Ok(upstream) });

            let mut client = handle.client_stream;
            assert_eq!(client.next().await, Some(frames::open_comment()));
            assert_eq!(client.next().await, Some(frames::meta("conv-1")));
            drop(client);

            // Upstream stays silent; the pump still lets go of it.
            tokio::time::timeout(Duration::from_secs(1), upstream_tx.closed())
                .await
                .expect("idle upstream released after client disconnect");
            assert!(handle.report.outcome().await.is_none());
        }
    }
}
