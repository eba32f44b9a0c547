//! Detection of in-band gateway failures
//!
//! Some gateways answer `200 OK` and then write a provider connectivity
//! failure into the event stream body:
//!
//! ```text
//! data: {"error": {"message": "litellm.APIConnectionError: ..."}}
//! ```
//!
//! Such a chunk must end the session instead of being forwarded. The match is
//! textual; swap `is_signal` for a structured check once the gateway error
//! shape is standardized.

/// Matches raw chunks that carry an embedded gateway error payload
#[derive(Debug, Clone)]
pub struct ProxyErrorDetector {
    marker: String,
}

impl ProxyErrorDetector {
    /// Create a detector triggered by `marker` (e.g. `litellm.APIConnectionError`)
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// True when the chunk holds an `"error"` field together with the marker.
    ///
    /// Chunks that are not valid UTF-8 are never a signal.
    pub fn is_signal(&self, chunk: &[u8]) -> bool {
        if self.marker.is_empty() {
            return false;
        }
        match std::str::from_utf8(chunk) {
            Ok(text) => text.contains("\"error\"") && text.contains(self.marker.as_str()),
            Err(_) => false,
        }
    }
}
