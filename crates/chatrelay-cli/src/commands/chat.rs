use std::io::Write;

use clap::Parser;
use futures::StreamExt;
use serde_json::{Value, json};

use crate::client::ServerClient;
use crate::error::{CliError, CliResult};
use crate::output::OutputFormat;
use crate::reply::{ChatSummary, ReplyCollector, ReplyEvent};

#[derive(Parser)]
pub struct ChatCommand {
    #[clap(help = "Message to send")]
    pub prompt: String,

    #[clap(long, short = 'C', help = "Continue an existing conversation")]
    pub conversation: Option<String>,

    #[clap(long, short, help = "Model alias to use instead of the server default")]
    pub model: Option<String>,

    #[clap(long, short, help = "System message sent before the prompt")]
    pub system: Option<String>,
}

impl ChatCommand {
    /// Request body for `/chat/stream`
    pub fn request_body(&self) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = &self.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": self.prompt}));

        let mut body = json!({ "messages": messages });
        if let Some(id) = &self.conversation {
            body["conversation_id"] = json!(id);
        }
        if let Some(model) = &self.model {
            body["model"] = json!(model);
        }
        body
    }

    pub async fn execute(&self, client: &ServerClient, format: OutputFormat) -> CliResult<()> {
        let mut body = client.stream_chat(&self.request_body()).await?;
        let mut collector = ReplyCollector::new();
        let mut stdout = std::io::stdout();

        while let Some(chunk) = body.next().await {
            for event in collector.feed(&chunk?) {
                if format == OutputFormat::Text {
                    render(&mut stdout, &event)?;
                }
            }
            if collector.is_finished() {
                break;
            }
        }

        let summary = collector.into_summary();
        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
            OutputFormat::Text => finish_text(&summary),
        }

        match summary.error {
            Some(error) => Err(CliError(error)),
            None => Ok(()),
        }
    }
}

fn render(out: &mut impl Write, event: &ReplyEvent) -> CliResult<()> {
    if let ReplyEvent::Delta(text) = event {
        write!(out, "{text}")?;
        out.flush()?;
    }
    Ok(())
}

fn finish_text(summary: &ChatSummary) {
    if !summary.reply.is_empty() {
        println!();
    }
    if let Some(id) = &summary.conversation_id {
        eprintln!("conversation: {id}");
    }
}
