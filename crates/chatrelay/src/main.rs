//! Chatrelay server - streams LLM gateway completions to chat clients

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use chatrelay::config::Config;
use chatrelay::error::Result;
use chatrelay::server::ChatServer;

/// Chatrelay - streaming chat backend for an OpenAI-compatible LLM gateway
#[derive(Parser)]
#[command(name = "chatrelay")]
#[command(about = "A chat backend that relays streamed LLM completions to clients")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Override the listen address
    #[arg(long, global = true)]
    pub listen: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the chat server (default command)
    #[command(name = "serve")]
    Serve,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => serve(cli.config, cli.listen).await,
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,chatrelay=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn serve(config_path: Option<PathBuf>, listen: Option<String>) -> Result<()> {
    tracing::info!("Starting chatrelay");

    let mut config =
        Config::load(config_path.as_deref())?.with_env_overrides(|name| std::env::var(name).ok());
    if let Some(listen) = listen {
        config.server.listen_addr = listen;
    }
    tracing::debug!("Config loaded: {:?}", config);

    ChatServer::new(config).serve().await?;

    tracing::info!("Chatrelay stopped");
    Ok(())
}
