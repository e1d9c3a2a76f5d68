//! Tail a session channel.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use codevec_core::stream::channel_name;
use codevec_core::{ChannelMessage, Config, MessageKind, Step, StreamEvent};
use codevec_redis::RedisBroker;
use codevec_web::subscriber::{ReconnectingSubscriber, SubscriberConfig};
use colored::Colorize;

use super::shutdown_on_ctrl_c;

#[derive(Args)]
pub struct ListenArgs {
    /// Session to follow
    pub session_id: String,

    /// Keep listening after the answer completes
    #[arg(long)]
    pub follow: bool,
}

pub async fn execute(args: ListenArgs, config: Config) -> Result<()> {
    let broker = RedisBroker::connect(&config.redis.url())
        .await
        .context("Failed to connect to Redis")?;
    let channel = channel_name(&args.session_id);
    let mut subscriber = ReconnectingSubscriber::connect(
        Arc::new(broker),
        &channel,
        SubscriberConfig::from(&config.gateway),
    )
    .await?;

    println!("{} {}", "Listening on".dimmed(), channel.bold());

    let cancel = shutdown_on_ctrl_c();
    let result = loop {
        let message = match subscriber.next_message(&cancel).await {
            Ok(Some(message)) => message,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e.into()),
        };
        let finished = print_message(&message)?;
        if finished && !args.follow {
            break Ok(());
        }
    };

    subscriber.close().await;
    result
}

/// Print one message. Returns true when it ends an answer.
fn print_message(message: &ChannelMessage) -> Result<bool> {
    let mut stdout = std::io::stdout();
    match message.kind() {
        MessageKind::Event(event) => print_event(&mut stdout, event),
        MessageKind::Notice(notice) => {
            println!("{}", format!("[{}] {}", notice.kind, notice.message).dimmed());
            Ok(false)
        }
        MessageKind::Opaque => {
            println!("{}", message.raw());
            Ok(false)
        }
    }
}

fn print_event(out: &mut impl Write, event: &StreamEvent) -> Result<bool> {
    match event.step {
        Step::Start => writeln!(out, "{}", "--- answer ---".dimmed())?,
        Step::Chunk => {
            if let Some(fragment) = event.fragment() {
                write!(out, "{}", fragment)?;
            }
        }
        Step::Complete => writeln!(out, "\n{}", "--- done ---".dimmed())?,
        Step::Error => {
            let message = event.data.as_str().unwrap_or("unknown error");
            writeln!(out, "\n{} {}", "Error:".red().bold(), message)?;
        }
    }
    out.flush()?;
    Ok(event.step.is_terminal())
}
