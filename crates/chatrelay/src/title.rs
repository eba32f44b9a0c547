//! Conversation title generation
//!
//! After the first assistant reply, a short title is requested from the
//! gateway with a non-streaming completion. Failures leave the title unset.

use std::time::Duration;

use crate::config::TitleConfig;
use crate::message::{ChatMessage, Role};
use crate::upstream::{CompletionRequest, UpstreamClient, completion_text};

const TITLE_SYSTEM_PROMPT: &str = "You are a helpful assistant that generates short conversation titles. \
Create a concise title (max 5 words) that starts with an emoji and summarizes the user's question and assistant's answer. \
Return ONLY the title text.";

pub struct TitleGenerator {
    client: UpstreamClient,
    model: String,
    timeout: Duration,
    input_chars: usize,
}

impl TitleGenerator {
    pub fn new(client: UpstreamClient, config: &TitleConfig) -> Self {
        Self {
            client,
            model: config.model.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            input_chars: config.input_chars,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Messages sent to the title model
    pub fn prompt(&self, user_text: &str, assistant_text: &str) -> Vec<ChatMessage> {
        vec![
            ChatMessage::new(Role::System, TITLE_SYSTEM_PROMPT),
            ChatMessage::new(Role::User, truncate(user_text, self.input_chars)),
            ChatMessage::new(Role::Assistant, truncate(assistant_text, self.input_chars)),
        ]
    }

    /// Ask the gateway for a title. `None` on any failure or an empty answer.
    pub async fn generate(&self, user_text: &str, assistant_text: &str) -> Option<String> {
        let request =
            CompletionRequest::non_streaming(&self.model, self.prompt(user_text, assistant_text));

        let body = match self.client.complete(&request, Some(self.timeout)).await {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(
                    error_type = e.category(),
                    error_message = %e,
                    model = %self.model,
                    "Title generation failed"
                );
                return None;
            }
        };

        let title = completion_text(&body)?.trim().to_string();
        if title.is_empty() { None } else { Some(title) }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
