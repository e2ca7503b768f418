//! Terminal client for the chat relay
//!
//! Reads one message per line from stdin and prints the reply as it streams.

use chat_relay::client::{ChatClient, ChatView, ClientError, EntryStatus};
use chat_relay::config::env_or;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chat_relay=warn".into()),
        )
        .init();

    let base_url: String = env_or("RELAY_URL", "http://localhost:3001".to_string());
    let client = ChatClient::new(&base_url);
    let mut view = ChatView::new();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt()?;
    while let Some(line) = lines.next_line().await? {
        let mut printed = 0;
        let result = client
            .send(&line, &mut view, |entry| {
                let delta = entry.content.get(printed..).unwrap_or_default();
                print!("{delta}");
                let _ = std::io::stdout().flush();
                printed = entry.content.len();
            })
            .await;

        match result {
            Ok(EntryStatus::Complete) => println!(),
            Ok(EntryStatus::Incomplete) => println!("\n[connection lost, reply incomplete]"),
            Ok(EntryStatus::Failed) => println!("\n[reply failed, send again to retry]"),
            Ok(EntryStatus::Streaming) => println!(),
            Err(ClientError::EmptyMessage) => {}
            Err(e) => eprintln!("{e}"),
        }
        prompt()?;
    }

    Ok(())
}

fn prompt() -> std::io::Result<()> {
    print!("> ");
    std::io::stdout().flush()
}
