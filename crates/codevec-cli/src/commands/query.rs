//! Queue a question from the shell.

use anyhow::{Context, Result};
use clap::Args;
use codevec_core::{task, Config};
use codevec_redis::RedisTaskQueue;
use colored::Colorize;

#[derive(Args)]
pub struct QueryArgs {
    /// Session (project) the question is about
    pub session_id: String,

    /// The question
    pub question: String,
}

pub async fn execute(args: QueryArgs, config: Config) -> Result<()> {
    let queue = RedisTaskQueue::connect(
        &config.redis.url(),
        &config.worker.queue,
        config.worker.max_retries,
    )
    .await
    .context("Failed to open task queue")?;

    let handle = task::enqueue(&queue, &args.question, &args.session_id).await?;

    println!("{} {}", "Task queued:".green(), handle.to_string().bold());
    println!(
        "{}",
        format!(
            "Answer streams on stream:{} (codevec listen {})",
            args.session_id, args.session_id
        )
        .dimmed()
    );
    Ok(())
}
