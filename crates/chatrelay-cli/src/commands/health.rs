use clap::Parser;

use crate::client::ServerClient;
use crate::error::CliResult;
use crate::output::OutputFormat;

#[derive(Parser)]
pub struct HealthCommand {}

impl HealthCommand {
    pub async fn execute(&self, client: &ServerClient, format: OutputFormat) -> CliResult<()> {
        let health = client.health().await?;

        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&health)?),
            OutputFormat::Text => {
                let status = health
                    .get("status")
                    .and_then(|s| s.as_str())
                    .unwrap_or("unknown");
                println!("{}: {status}", client.base());
            }
        }

        Ok(())
    }
}
