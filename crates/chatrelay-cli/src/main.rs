use clap::{Parser, Subcommand};
use chatrelay_cli::client::{DEFAULT_SERVER_URL, ServerClient};
use chatrelay_cli::commands::{ChatCommand, HealthCommand};
use chatrelay_cli::error::CliResult;
use chatrelay_cli::output::OutputFormat;

#[derive(Parser)]
#[command(name = "chatrelay-cli")]
#[command(about = "Chatrelay CLI - Chat with a running chatrelay server")]
#[command(version)]
pub struct Cli {
    #[clap(long, short, global = true, help = "Output in JSON format")]
    pub json: bool,

    #[clap(long, global = true, default_value = DEFAULT_SERVER_URL, help = "Server base URL")]
    pub server: String,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    #[clap(about = "Send a message and stream the reply")]
    Chat(ChatCommand),

    #[clap(about = "Check that the server is up")]
    Health(HealthCommand),
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    let client = ServerClient::new(&cli.server)?;

    match &cli.command {
        Command::Chat(cmd) => cmd.execute(&client, format).await,
        Command::Health(cmd) => cmd.execute(&client, format).await,
    }
}
