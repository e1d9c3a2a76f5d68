//! Worker pool command.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use codevec_core::{Config, TaskExecutor, WorkerPool};
use codevec_embedding::RagAnswerer;
use codevec_redis::{RedisBroker, RedisTaskQueue};
use colored::Colorize;

use super::shutdown_on_ctrl_c;

#[derive(Args)]
pub struct WorkerArgs {
    /// Number of tasks processed concurrently
    #[arg(long)]
    pub concurrency: Option<usize>,
}

pub async fn execute(args: WorkerArgs, mut config: Config) -> Result<()> {
    if let Some(concurrency) = args.concurrency {
        config.worker.concurrency = concurrency;
    }

    let redis_url = config.redis.url();
    let broker = RedisBroker::connect(&redis_url)
        .await
        .context("Failed to connect to Redis")?;
    let queue = RedisTaskQueue::connect(&redis_url, &config.worker.queue, config.worker.max_retries)
        .await
        .context("Failed to open task queue")?;
    let answers = RagAnswerer::from_config(&config.ollama, &config.qdrant)?;

    let executor = Arc::new(TaskExecutor::new(Arc::new(broker), Arc::new(answers)));
    let pool = WorkerPool::new(Arc::new(queue), executor, &config.worker);

    println!();
    println!("  {} {}", "Codevec".cyan().bold(), "Worker".bold());
    println!();
    println!("  {}        {}", "Queue".green(), config.worker.queue);
    println!("  {}  {}", "Concurrency".green(), config.worker.concurrency.max(1));
    println!("  {}        {} @ {}", "Model".green(), config.ollama.model, config.ollama.url);
    println!("  {}       {}", "Qdrant".green(), config.qdrant.url);
    println!();
    println!("  {}", "Ctrl+C to stop".dimmed());
    println!();

    pool.run(shutdown_on_ctrl_c()).await?;
    Ok(())
}
