//! Upstream pump feeding the bounded handoff queue
//!
//! The bridge runs as its own task. It reads the upstream chunk stream,
//! forwards every well-formed chunk to the client side through a bounded
//! channel, and parses the same bytes to rebuild the assistant reply. A full
//! channel suspends the pump, which in turn stops reading upstream.

use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use std::future::Future;
use tokio::sync::mpsc;

use super::accumulator::{Accumulator, DeltaFragment};
use super::detector::ProxyErrorDetector;
use super::outcome::RelayOutcome;
use super::parser::{FrameParser, SseRecord};
use crate::upstream::{ChunkStream, UpstreamError};

/// Item passed from the pump to the client side
#[derive(Debug)]
pub enum RelayItem {
    /// Upstream bytes to forward verbatim
    Chunk(Bytes),
    /// End marker; always the last item of a session
    End(BridgeReport),
}

/// What the pump observed by the time it stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeReport {
    pub outcome: RelayOutcome,
    /// Whether upstream's own `[DONE]` record was forwarded
    pub saw_sentinel: bool,
    pub chunks_forwarded: usize,
    /// Whether the last forwarded bytes stopped partway through a line
    pub open_line: bool,
}

impl BridgeReport {
    fn not_started(outcome: RelayOutcome) -> Self {
        Self {
            outcome,
            saw_sentinel: false,
            chunks_forwarded: 0,
            open_line: false,
        }
    }

    /// Report for a pump that vanished without sending its end marker
    pub fn abandoned(chunks_forwarded: usize) -> Self {
        Self {
            outcome: RelayOutcome::UpstreamMidStreamError {
                message: "Relay pump stopped without an end marker".to_string(),
            },
            saw_sentinel: false,
            chunks_forwarded,
            open_line: false,
        }
    }
}

enum Stop {
    Sentinel,
    Exhausted,
    ProxySignal,
    Failed(UpstreamError),
    ClientGone,
}

/// Per-session pump state: parser, accumulator and sentinel tracking
pub struct RelayBridge {
    detector: ProxyErrorDetector,
    parser: FrameParser,
    accumulator: Accumulator,
    saw_sentinel: bool,
    forwarded: usize,
}

impl RelayBridge {
    pub fn new(detector: ProxyErrorDetector) -> Self {
        Self {
            detector,
            parser: FrameParser::new(),
            accumulator: Accumulator::new(),
            saw_sentinel: false,
            forwarded: 0,
        }
    }

    /// Open the upstream stream, pump it, and finish with an end marker.
    ///
    /// The end marker is sent on every path: sentinel, exhaustion, proxy error
    /// signal, upstream failure and failure to open. Only a client that has
    /// already gone away misses it.
    pub async fn run<F>(self, open: F, tx: mpsc::Sender<RelayItem>)
    where
        F: Future<Output = Result<ChunkStream, UpstreamError>>,
    {
        let report = match open.await {
            Ok(chunks) => self.pump(chunks, &tx).await,
            Err(err) => BridgeReport::not_started(RelayOutcome::from_open_error(err)),
        };

        if tx.send(RelayItem::End(report)).await.is_err() {
            tracing::debug!("Client side closed before the end marker was delivered");
        }
    }

    /// Pump chunks until the stream ends, fails, signals an error, the
    /// sentinel is seen or the client side closes. The upstream stream is
    /// dropped before returning.
    pub async fn pump<S>(mut self, mut chunks: S, tx: &mpsc::Sender<RelayItem>) -> BridgeReport
    where
        S: Stream<Item = Result<Bytes, UpstreamError>> + Unpin,
    {
        let stop = loop {
            // A silent upstream must not keep the pump alive after the client left.
            let next = tokio::select! {
                next = chunks.next() => next,
                () = tx.closed() => break Stop::ClientGone,
            };
            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(err)) => break Stop::Failed(err),
                None => break Stop::Exhausted,
            };

            if chunk.is_empty() {
                continue;
            }

            if self.detector.is_signal(&chunk) {
                break Stop::ProxySignal;
            }

            if tx.send(RelayItem::Chunk(chunk.clone())).await.is_err() {
                break Stop::ClientGone;
            }
            self.forwarded += 1;

            self.ingest(&chunk);
            if self.saw_sentinel {
                break Stop::Sentinel;
            }
        };

        drop(chunks);
        self.finish(stop)
    }

    fn ingest(&mut self, chunk: &[u8]) {
        for record in self.parser.feed(chunk) {
            match record {
                SseRecord::Done => {
                    self.saw_sentinel = true;
                    break;
                }
                SseRecord::Data(payload) => {
                    if let Some(fragment) = DeltaFragment::from_payload(&payload) {
                        self.accumulator.append(&fragment);
                    }
                }
            }
        }
    }

    fn finish(self, stop: Stop) -> BridgeReport {
        let open_line = !self.saw_sentinel && !self.parser.pending().is_empty();
        let outcome = match stop {
            Stop::Sentinel | Stop::Exhausted => {
                RelayOutcome::completed(self.accumulator.into_transcript())
            }
            Stop::ClientGone => {
                tracing::debug!(
                    chunks_forwarded = self.forwarded,
                    "Client disconnected, upstream pump stopped"
                );
                RelayOutcome::completed(self.accumulator.into_transcript())
            }
            Stop::ProxySignal => {
                tracing::warn!(
                    error_type = "proxy_signal",
                    marker = self.detector.marker(),
                    chunks_forwarded = self.forwarded,
                    "Gateway signalled a provider connectivity failure in-stream"
                );
                RelayOutcome::ProxyErrorSignaled {
                    partial: self.accumulator.into_transcript(),
                }
            }
            Stop::Failed(err) => {
                tracing::warn!(
                    error_type = err.category(),
                    error = %err,
                    chunks_forwarded = self.forwarded,
                    "Upstream stream failed"
                );
                RelayOutcome::UpstreamMidStreamError {
                    message: err.to_string(),
                }
            }
        };

        BridgeReport {
            outcome,
            saw_sentinel: self.saw_sentinel,
            chunks_forwarded: self.forwarded,
            open_line,
        }
    }
}
