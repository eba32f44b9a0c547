pub mod chat;
pub mod health;

pub use chat::ChatCommand;
pub use health::HealthCommand;
