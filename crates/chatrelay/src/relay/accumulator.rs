//! Reconstruction of the assistant reply from streamed payloads

use serde::Deserialize;

/// OpenAI-compatible streaming chunk, reduced to the fields the relay reads
#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ContentField>,
    #[serde(default)]
    message: Option<ContentField>,
}

#[derive(Debug, Deserialize)]
struct ContentField {
    #[serde(default)]
    content: Option<String>,
}

/// A piece of assistant-visible text from one streamed record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaFragment(String);

impl DeltaFragment {
    /// Extract text from a record payload.
    ///
    /// Reads `choices[0].delta.content`, falling back to
    /// `choices[0].message.content` only when the delta carries no text.
    /// Malformed JSON and unexpected shapes yield `None`.
    pub fn from_payload(payload: &str) -> Option<Self> {
        let chunk: CompletionChunk = serde_json::from_str(payload).ok()?;
        let choice = chunk.choices.into_iter().next()?;

        let text = non_empty(choice.delta).or_else(|| non_empty(choice.message))?;
        Some(DeltaFragment(text))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeltaFragment {
    fn from(text: &str) -> Self {
        DeltaFragment(text.to_string())
    }
}

fn non_empty(field: Option<ContentField>) -> Option<String> {
    field?.content.filter(|c| !c.is_empty())
}

/// Append-only transcript buffer owned by a single relay session
#[derive(Debug, Default)]
pub struct Accumulator {
    text: String,
    fragments: usize,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, fragment: &DeltaFragment) {
        if fragment.0.is_empty() {
            return;
        }
        self.text.push_str(&fragment.0);
        self.fragments += 1;
    }

    pub fn transcript(&self) -> &str {
        &self.text
    }

    pub fn into_transcript(self) -> String {
        self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Number of non-empty fragments appended
    pub fn fragment_count(&self) -> usize {
        self.fragments
    }
}
