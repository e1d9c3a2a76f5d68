//! Relay gateway command.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use codevec_core::config::GatewayConfig;
use codevec_core::Config;
use codevec_redis::{RedisBroker, RedisTaskQueue};
use codevec_web::{AppState, RelaySettings, TokenVerifier};
use colored::Colorize;
use tracing::warn;

use super::shutdown_on_ctrl_c;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Args)]
pub struct ServeArgs {
    /// Port to listen on
    #[arg(long)]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Forward client frames onto the session channel (true/false)
    #[arg(long)]
    pub allow_client_publish: Option<bool>,
}

impl ServeArgs {
    fn apply(&self, gateway: &mut GatewayConfig) {
        if let Some(port) = self.port {
            gateway.port = port;
        }
        if let Some(host) = &self.host {
            gateway.host = host.clone();
        }
        if let Some(allow) = self.allow_client_publish {
            gateway.allow_client_publish = allow;
        }
    }
}

pub async fn execute(args: ServeArgs, mut config: Config) -> Result<()> {
    args.apply(&mut config.gateway);

    let redis_url = config.redis.url();
    let broker = RedisBroker::connect(&redis_url)
        .await
        .context("Failed to connect to Redis")?;
    broker.ping().await.context("Redis did not answer PING")?;
    let queue = RedisTaskQueue::connect(&redis_url, &config.worker.queue, config.worker.max_retries)
        .await
        .context("Failed to open task queue")?;

    let verifier = TokenVerifier::new(config.auth.jwt_secret.as_deref());
    if !verifier.is_configured() {
        warn!("No JWT secret configured; every client will be rejected");
    }

    let state = AppState::new(
        Arc::new(broker),
        Arc::new(queue),
        verifier,
        RelaySettings::from(&config.gateway),
    );

    let gateway = &config.gateway;
    println!();
    println!("  {} {}", "Codevec".cyan().bold(), "Relay Gateway".bold());
    println!();
    println!("  {}        http://{}:{}/v1/query", "Query".green(), gateway.host, gateway.port);
    println!(
        "  {}    ws://{}:{}/socket/ws/{{session_id}}",
        "WebSocket".green(),
        gateway.host,
        gateway.port
    );
    println!("  {}       http://{}:{}/health", "Health".green(), gateway.host, gateway.port);
    println!("  {}        {}", "Redis".green(), config.redis.host);
    if !state.verifier.is_configured() {
        println!();
        println!(
            "  {}",
            "No JWT secret set (CODEVEC_JWT_SECRET); all clients will be rejected".yellow()
        );
    }
    println!();
    println!("  {}", "Ctrl+C to stop".dimmed());
    println!();

    let shutdown = shutdown_on_ctrl_c();
    let server_shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        server_shutdown.cancel();
    });

    codevec_web::run_server(state, &gateway.host, gateway.port, SHUTDOWN_GRACE).await
}
