pub mod client;
pub mod commands;
pub mod error;
pub mod output;
pub mod reply;

pub use client::{DEFAULT_SERVER_URL, ServerClient};
pub use commands::{ChatCommand, HealthCommand};
pub use error::{CliError, CliResult};
pub use output::{OutputFormat, truncate_string};
pub use reply::{ChatSummary, ReplyCollector, ReplyEvent};
