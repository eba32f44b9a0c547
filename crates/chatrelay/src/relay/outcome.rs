use crate::upstream::{START_FAILURE_MESSAGE, UpstreamError};

/// Terminal result of one relay session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Stream ended normally with assistant text
    Completed { transcript: String },
    /// Stream ended normally without any assistant text
    CompletedEmpty,
    /// The gateway failed before sending any body bytes
    UpstreamPreStreamError {
        status: Option<u16>,
        message: String,
    },
    /// The transport failed after the body started
    UpstreamMidStreamError { message: String },
    /// The gateway reported an in-band connectivity failure; `partial` holds
    /// the assistant text forwarded before the signal, possibly empty
    ProxyErrorSignaled { partial: String },
}

impl RelayOutcome {
    pub fn completed(transcript: String) -> Self {
        if transcript.is_empty() {
            RelayOutcome::CompletedEmpty
        } else {
            RelayOutcome::Completed { transcript }
        }
    }

    /// Outcome for a failed attempt to open the upstream stream
    pub fn from_open_error(err: UpstreamError) -> Self {
        match err {
            UpstreamError::PreStream { status, message } => {
                RelayOutcome::UpstreamPreStreamError { status, message }
            }
            other => {
                tracing::warn!(error_type = other.category(), error = %other, "Unexpected error opening upstream stream");
                RelayOutcome::UpstreamPreStreamError {
                    status: None,
                    message: START_FAILURE_MESSAGE.to_string(),
                }
            }
        }
    }

    /// Assistant text worth storing for this outcome
    pub fn transcript(&self) -> Option<&str> {
        match self {
            RelayOutcome::Completed { transcript } => Some(transcript),
            RelayOutcome::ProxyErrorSignaled { partial } if !partial.is_empty() => Some(partial),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        !matches!(
            self,
            RelayOutcome::Completed { .. } | RelayOutcome::CompletedEmpty
        )
    }

    /// Short tag for logs
    pub fn label(&self) -> &'static str {
        match self {
            RelayOutcome::Completed { .. } => "completed",
            RelayOutcome::CompletedEmpty => "completed_empty",
            RelayOutcome::UpstreamPreStreamError { .. } => "pre_stream_error",
            RelayOutcome::UpstreamMidStreamError { .. } => "mid_stream_error",
            RelayOutcome::ProxyErrorSignaled { .. } => "proxy_error",
        }
    }
}
