//! Conversation Example
//!
//! A two-step conversation built from a persistent listener and a one-shot
//! wait. Events are read as JSON lines from stdin, standing in for a real
//! transport:
//!
//! ```text
//! {"kind":"message","scope":{"chat_id":1,"user_id":7},"payload":{"text":"/ask"}}
//! {"kind":"message","scope":{"chat_id":1,"user_id":7},"payload":{"text":"blue"}}
//! ```
//!
//! The `/ask` listener matches every message in every chat. While it waits
//! for the answer, the wait is more specific (chat and user), so the answer
//! goes to the wait and not back to the listener.
//!
//! # Usage
//!
//! ```bash
//! cargo run --package conversation -- --timeout 30 < events.jsonl
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tether::core::ErrorSink;
use tether::prelude::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(about = "Drive a question-and-answer conversation from JSON events on stdin")]
struct Args {
    /// Seconds to wait for an answer before giving up.
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Configuration file to load instead of searching the current directory.
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Asks a question on `/ask` and waits for the same user to answer it.
async fn ask_handler(correlator: Correlator, event: BoxedEvent, timeout: Duration) -> Result<()> {
    let Some(raw) = event.downcast_ref::<RawEvent>() else {
        return Ok(());
    };
    if raw.text() != Some("/ask") {
        return Ok(());
    }

    let scope = event.scope();
    let (Some(chat), Some(user)) = (scope.chat_id(), scope.user_id()) else {
        return Ok(());
    };
    info!(chat, user, "What is your favourite colour?");

    let answer = correlator
        .wait(
            Interest::message(Identifier::chat(chat).with_user(user))
                .filter_as::<RawEvent, _>(|event| event.text().is_some())
                .name("colour-answer")
                .timeout(timeout),
        )
        .await;

    match answer {
        Ok(answer) => {
            let colour = answer
                .downcast_ref::<RawEvent>()
                .and_then(RawEvent::text)
                .unwrap_or_default();
            info!(chat, user, colour, "Got an answer");
        }
        Err(e) if e.is_timeout() => info!(chat, user, "No answer, giving up"),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Logs button presses anywhere.
async fn button_handler(event: BoxedEvent) -> Result<()> {
    let data = event
        .raw_json()
        .and_then(|payload| payload.get("data"))
        .context("callback query without data")?;
    info!(scope = %event.scope(), %data, "Button pressed");
    Ok(())
}

struct LogFailures;

impl ErrorSink for LogFailures {
    fn report(&self, handle: ExpectationHandle, error: CorrelationError) {
        warn!(?handle, %error, "Handler failed");
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let timeout = Duration::from_secs(args.timeout);

    let mut builder = TetherRuntime::builder().error_sink(LogFailures);
    if let Some(path) = &args.config {
        builder = builder.config_file(path);
    }
    let runtime = builder.build()?;

    let correlator = runtime.correlator().clone();
    runtime
        .correlator()
        .register(Interest::message(Identifier::any()).name("ask"), move |event| {
            ask_handler(correlator.clone(), event, timeout)
        });
    runtime
        .correlator()
        .register(Interest::callback_query(Identifier::any()), button_handler);

    let events = runtime.event_sender();
    let feed = async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RawEvent>(&line) {
                Ok(event) => {
                    if events.feed(BoxedEvent::new(event)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, line, "Skipping malformed event"),
            }
        }
        // Leave pending waits a chance to be answered or time out.
        tokio::time::sleep(timeout).await;
    };

    runtime.run_until(feed).await?;
    Ok(())
}
