//! Decoding of the server's event stream into reply events

use chatrelay::relay::{DeltaFragment, FrameParser, SseRecord};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyEvent {
    /// Conversation id announced by the server
    Meta(String),
    Delta(String),
    /// Error reported in place of a reply
    Error(String),
    Done,
}

/// Final result of a streamed chat turn
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChatSummary {
    pub conversation_id: Option<String>,
    pub reply: String,
    pub error: Option<String>,
}

/// Incrementally turns response body chunks into [`ReplyEvent`]s
#[derive(Debug, Default)]
pub struct ReplyCollector {
    parser: FrameParser,
    summary: ChatSummary,
    finished: bool,
}

impl ReplyCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ReplyEvent> {
        if self.finished {
            return Vec::new();
        }

        let mut events = Vec::new();
        for record in self.parser.feed(chunk) {
            let event = match record {
                SseRecord::Done => ReplyEvent::Done,
                SseRecord::Data(data) => match classify(&data) {
                    Some(event) => event,
                    None => continue,
                },
            };
            self.apply(&event);
            let done = event == ReplyEvent::Done;
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    fn apply(&mut self, event: &ReplyEvent) {
        match event {
            ReplyEvent::Meta(id) => self.summary.conversation_id = Some(id.clone()),
            ReplyEvent::Delta(text) => self.summary.reply.push_str(text),
            ReplyEvent::Error(message) => self.summary.error = Some(message.clone()),
            ReplyEvent::Done => self.finished = true,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn summary(&self) -> &ChatSummary {
        &self.summary
    }

    pub fn into_summary(self) -> ChatSummary {
        self.summary
    }
}

fn classify(data: &str) -> Option<ReplyEvent> {
    let value: Value = serde_json::from_str(data).ok()?;

    if let Some(id) = value.pointer("/meta/conversation_id") {
        let id = match id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return Some(ReplyEvent::Meta(id));
    }

    if value.get("choices").is_none() {
        if let Some(message) = value.get("message").and_then(Value::as_str) {
            return Some(ReplyEvent::Error(message.to_string()));
        }
        if let Some(message) = value.pointer("/error/message").and_then(Value::as_str) {
            return Some(ReplyEvent::Error(message.to_string()));
        }
        return None;
    }

    DeltaFragment::from_payload(data).map(|fragment| ReplyEvent::Delta(fragment.as_str().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatrelay::relay::frames;
    use chatrelay::testing::{delta_frame, sse_body};

    #[test]
    fn test_collects_meta_deltas_and_done() {
        let mut collector = ReplyCollector::new();
        let mut events = collector.feed(&frames::open_comment());
        events.extend(collector.feed(&frames::meta("abc")));
        events.extend(collector.feed(sse_body(&["Hel", "lo"]).as_bytes()));

        assert_eq!(
            events,
            vec![
                ReplyEvent::Meta("abc".to_string()),
                ReplyEvent::Delta("Hel".to_string()),
                ReplyEvent::Delta("lo".to_string()),
                ReplyEvent::Done,
            ]
        );
        assert!(collector.is_finished());
        assert_eq!(
            collector.into_summary(),
            ChatSummary {
                conversation_id: Some("abc".to_string()),
                reply: "Hello".to_string(),
                error: None,
            }
        );
    }

    #[test]
    fn test_error_frame_is_reported() {
        let mut collector = ReplyCollector::new();
        collector.feed(&frames::error("down"));
        collector.feed(&frames::done());

        assert_eq!(collector.summary().error.as_deref(), Some("down"));
        assert!(collector.summary().reply.is_empty());
    }

    #[test]
    fn test_frames_split_across_chunks() {
        let body = format!("{}{}", delta_frame("split"), "data: [DONE]\n\n");
        let (first, second) = body.as_bytes().split_at(body.len() / 2);

        let mut collector = ReplyCollector::new();
        let mut events = collector.feed(first);
        events.extend(collector.feed(second));

        assert_eq!(
            events,
            vec![ReplyEvent::Delta("split".to_string()), ReplyEvent::Done]
        );
    }

    #[test]
    fn test_usage_chunk_without_choices_is_ignored() {
        let mut collector = ReplyCollector::new();
        let events = collector.feed(b"data: {\"choices\":[],\"usage\":{\"total_tokens\":3}}\n\n");
        assert!(events.is_empty());
    }

    #[test]
    fn test_nothing_after_done() {
        let mut collector = ReplyCollector::new();
        collector.feed(&frames::done());
        assert!(collector.feed(delta_frame("late").as_bytes()).is_empty());
    }
}
