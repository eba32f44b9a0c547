//! Chatrelay - streaming chat relay for an OpenAI-compatible LLM gateway
//!
//! This crate provides a chat backend that forwards conversation turns to an
//! LLM gateway and relays the streamed completion to the client as it is
//! generated, while rebuilding the assistant reply for storage.

pub mod config;
pub mod error;
pub mod message;
pub mod relay;
pub mod server;
pub mod store;
pub mod testing;
pub mod title;
pub mod upstream;

pub use error::ChatRelayError;
