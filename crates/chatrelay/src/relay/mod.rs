//! Streaming chat relay
//!
//! - `parser`: incremental SSE record parser
//! - `detector`: in-band gateway failure predicate
//! - `accumulator`: assistant transcript reconstruction
//! - `bridge`: upstream pump feeding the bounded handoff queue
//! - `session`: per-request orchestration and closing frames

pub mod accumulator;
pub mod bridge;
pub mod detector;
pub mod frames;
pub mod outcome;
pub mod parser;
pub mod session;

pub use accumulator::{Accumulator, DeltaFragment};
pub use bridge::{BridgeReport, RelayBridge, RelayItem};
pub use detector::ProxyErrorDetector;
pub use outcome::RelayOutcome;
pub use parser::{DONE_SENTINEL, FrameParser, SseRecord};
pub use session::{
    RelayHandle, RelaySession, RelaySettings, ReportHandle, SessionReport, TranscriptSink,
};
