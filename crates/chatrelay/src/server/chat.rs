//! Chat endpoints
//!
//! Both endpoints share a preamble: validate the messages, resolve or create
//! the conversation, store the incoming messages and load the full history.
//! `/chat/stream` then hands the history to a relay session; `/chat/complete`
//! makes a single non-streaming call.

use async_trait::async_trait;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;

use super::AppState;
use super::error::ApiError;
use crate::error::Result;
use crate::message::{ChatMessage, IncomingMessage, Role, last_user_text, validate_messages};
use crate::relay::{RelayOutcome, RelaySession, TranscriptSink};
use crate::store::{ConversationId, ConversationStore};
use crate::title::TitleGenerator;
use crate::upstream::{CompletionRequest, completion_text};

/// Body of `/chat/stream` and `/chat/complete`
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<IncomingMessage>,
    #[serde(default)]
    pub model: Option<String>,
}

struct PreparedTurn {
    conversation_id: ConversationId,
    model: String,
    history: Vec<ChatMessage>,
    last_user: Option<String>,
}

async fn prepare_turn(
    state: &AppState,
    request: ChatRequest,
) -> std::result::Result<PreparedTurn, ApiError> {
    let messages = validate_messages(&request.messages).map_err(ApiError::Validation)?;

    let conversation_id = match request.conversation_id.as_deref() {
        Some(raw) => {
            let id: ConversationId = raw.parse()?;
            if !state.store.exists(&id).await? {
                return Err(ApiError::ConversationNotFound);
            }
            id
        }
        None => state.store.create().await?,
    };

    state.store.append(&conversation_id, &messages).await?;
    let history = state.store.history(&conversation_id).await?;
    let last_user = last_user_text(&history).map(str::to_string);

    let model = request
        .model
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| state.config.upstream.default_model.clone());

    Ok(PreparedTurn {
        conversation_id,
        model,
        history,
        last_user,
    })
}

/// `POST /chat/stream`
pub async fn chat_stream(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> std::result::Result<Response, ApiError> {
    let turn = prepare_turn(&state, request).await?;

    let recorder = ConversationRecorder::new(state.store.clone(), state.titles.clone())
        .with_last_user(turn.last_user);

    tracing::debug!(
        conversation_id = %turn.conversation_id,
        model = %turn.model,
        messages = turn.history.len(),
        "Relaying chat turn"
    );

    let upstream_request = CompletionRequest::streaming(turn.model, turn.history);
    let client = state.upstream.clone();
    let handle = RelaySession::new(turn.conversation_id.to_string(), state.relay.clone())
        .with_sink(Arc::new(recorder))
        .start(async move { client.open(&upstream_request).await });

    event_stream_response(&turn.conversation_id, handle.client_stream)
}

fn event_stream_response(
    conversation_id: &ConversationId,
    frames: BoxStream<'static, Bytes>,
) -> std::result::Result<Response, ApiError> {
    let conversation_header = HeaderValue::from_str(&conversation_id.to_string())
        .map_err(|e| ApiError::Internal(format!("Invalid conversation id header: {e}")))?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache, no-transform")
        .header(header::CONNECTION, "keep-alive")
        .header("x-accel-buffering", "no")
        .header("x-conversation-id", conversation_header)
        .body(Body::from_stream(frames.map(Ok::<_, Infallible>)))
        .map_err(|e| ApiError::Internal(format!("Failed to build response: {e}")))
}

/// `POST /chat/complete`
pub async fn chat_complete(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> std::result::Result<Json<Value>, ApiError> {
    let turn = prepare_turn(&state, request).await?;
    let conversation_id = turn.conversation_id;

    let upstream_request = CompletionRequest::non_streaming(turn.model, turn.history);
    let mut body = state
        .upstream
        .complete(&upstream_request, None)
        .await
        .map_err(|e| {
            tracing::warn!(
                error_type = e.category(),
                error_message = %e,
                conversation_id = %conversation_id,
                "Non-streaming completion failed"
            );
            ApiError::Upstream
        })?;

    if let Some(reply) = completion_text(&body) {
        let recorder = ConversationRecorder::new(state.store.clone(), state.titles.clone())
            .with_last_user(turn.last_user);
        recorder.record(&conversation_id, &reply).await?;
        tokio::spawn(async move { recorder.maybe_set_title(&conversation_id, &reply).await });
    }

    if let Value::Object(map) = &mut body {
        map.entry("conversation_id")
            .or_insert_with(|| Value::String(conversation_id.to_string()));
    }

    Ok(Json(body))
}

/// Stores finished assistant replies and titles new conversations
pub struct ConversationRecorder {
    store: Arc<dyn ConversationStore>,
    titles: Option<Arc<TitleGenerator>>,
    last_user: Option<String>,
}

impl ConversationRecorder {
    pub fn new(store: Arc<dyn ConversationStore>, titles: Option<Arc<TitleGenerator>>) -> Self {
        Self {
            store,
            titles,
            last_user: None,
        }
    }

    /// User text the title is generated from
    pub fn with_last_user(mut self, last_user: Option<String>) -> Self {
        self.last_user = last_user;
        self
    }

    async fn record(&self, conversation_id: &ConversationId, reply: &str) -> Result<()> {
        self.store
            .append(conversation_id, &[ChatMessage::new(Role::Assistant, reply)])
            .await
    }

    /// Generate and store a title if the conversation has none yet
    pub async fn maybe_set_title(&self, conversation_id: &ConversationId, reply: &str) {
        let Some(titles) = &self.titles else {
            return;
        };

        match self.store.title(conversation_id).await {
            Ok(None) => {}
            Ok(Some(_)) => return,
            Err(e) => {
                tracing::warn!(error_type = "storage", error_message = %e, "Failed to read conversation title");
                return;
            }
        }

        let user_text = self.last_user.as_deref().unwrap_or_default();
        let Some(title) = titles.generate(user_text, reply).await else {
            return;
        };

        match self.store.set_title(conversation_id, &title).await {
            Ok(()) => tracing::debug!(conversation_id = %conversation_id, title = %title, "Conversation titled"),
            Err(e) => tracing::warn!(
                error_type = "storage",
                error_message = %e,
                conversation_id = %conversation_id,
                "Failed to store conversation title"
            ),
        }
    }
}

#[async_trait]
impl TranscriptSink for ConversationRecorder {
    async fn persist(&self, conversation_id: &str, role: Role, transcript: &str) -> Result<()> {
        let id: ConversationId = conversation_id.parse()?;
        self.store
            .append(&id, &[ChatMessage::new(role, transcript)])
            .await?;
        self.maybe_set_title(&id, transcript).await;
        Ok(())
    }

    async fn discard(&self, conversation_id: &str, outcome: &RelayOutcome) {
        tracing::debug!(
            conversation_id = %conversation_id,
            outcome = outcome.label(),
            "No assistant reply to store"
        );
    }
}
