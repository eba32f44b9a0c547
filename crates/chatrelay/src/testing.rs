//! Test utilities for chatrelay - SSE fixtures and a recording transcript sink
//!
//! Shared by the unit tests and the integration tests under `tests/`.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{ChatRelayError, Result};
use crate::message::Role;
use crate::relay::{RelayOutcome, TranscriptSink};
use crate::upstream::{ChunkStream, UpstreamError};

/// One streaming delta record as the gateway sends it
pub fn delta_frame(content: &str) -> String {
    let payload = serde_json::json!({
        "id": "chatcmpl-test",
        "object": "chat.completion.chunk",
        "choices": [{ "index": 0, "delta": { "content": content } }]
    });
    format!("data: {payload}\n\n")
}

/// Full upstream body: one delta record per fragment, then `[DONE]`
pub fn sse_body(fragments: &[&str]) -> String {
    let mut body: String = fragments.iter().map(|f| delta_frame(f)).collect();
    body.push_str("data: [DONE]\n\n");
    body
}

/// Wrap prepared chunks as an upstream chunk stream
pub fn chunk_stream(chunks: Vec<std::result::Result<Bytes, UpstreamError>>) -> ChunkStream {
    stream::iter(chunks).boxed()
}

/// Drain a client stream into its frames
pub async fn collect_frames<S>(client_stream: S) -> Vec<Bytes>
where
    S: Stream<Item = Bytes>,
{
    client_stream.collect().await
}

/// A call observed by [`RecordingSink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCall {
    Persisted {
        conversation_id: String,
        role: Role,
        transcript: String,
    },
    Discarded {
        conversation_id: String,
        outcome: RelayOutcome,
    },
}

/// Transcript sink that reports every call over a channel
#[derive(Debug)]
pub struct RecordingSink {
    calls: mpsc::UnboundedSender<SinkCall>,
    fail_persist: bool,
}

impl RecordingSink {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SinkCall>) {
        Self::build(false)
    }

    /// Like [`RecordingSink::new`] but every persist call fails after recording
    pub fn failing() -> (Arc<Self>, mpsc::UnboundedReceiver<SinkCall>) {
        Self::build(true)
    }

    fn build(fail_persist: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<SinkCall>) {
        let (calls, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                calls,
                fail_persist,
            }),
            rx,
        )
    }
}

#[async_trait]
impl TranscriptSink for RecordingSink {
    async fn persist(&self, conversation_id: &str, role: Role, transcript: &str) -> Result<()> {
        let _ = self.calls.send(SinkCall::Persisted {
            conversation_id: conversation_id.to_string(),
            role,
            transcript: transcript.to_string(),
        });

        if self.fail_persist {
            return Err(ChatRelayError::Storage("recording sink set to fail".to_string()));
        }
        Ok(())
    }

    async fn discard(&self, conversation_id: &str, outcome: &RelayOutcome) {
        let _ = self.calls.send(SinkCall::Discarded {
            conversation_id: conversation_id.to_string(),
            outcome: outcome.clone(),
        });
    }
}
