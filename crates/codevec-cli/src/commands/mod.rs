//! CLI command definitions and handlers.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use codevec_core::Config;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod listen;
pub mod query;
pub mod serve;
pub mod worker;

/// Codevec - streamed answers about indexed codebases
#[derive(Parser)]
#[command(name = "codevec")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to a TOML config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the relay gateway
    Serve(serve::ServeArgs),

    /// Start a worker pool that answers queued questions
    Worker(worker::WorkerArgs),

    /// Queue a question for a session
    Query(query::QueryArgs),

    /// Print a session's stream as it arrives
    Listen(listen::ListenArgs),
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        let config = Config::load(self.config.as_deref())?;
        match self.command {
            Commands::Serve(args) => serve::execute(args, config).await,
            Commands::Worker(args) => worker::execute(args, config).await,
            Commands::Query(args) => query::execute(args, config).await,
            Commands::Listen(args) => listen::execute(args, config).await,
        }
    }
}

/// Token cancelled on Ctrl+C.
pub(crate) fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
        }
        trigger.cancel();
    });
    token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_global_flags() {
        let cli = Cli::try_parse_from([
            "codevec", "--config", "codevec.toml", "-v", "serve", "--port", "9000",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("codevec.toml")));
        match cli.command {
            Commands::Serve(args) => assert_eq!(args.port, Some(9000)),
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_parse_query() {
        let cli = Cli::try_parse_from(["codevec", "query", "s1", "why?"]).unwrap();
        match cli.command {
            Commands::Query(args) => {
                assert_eq!(args.session_id, "s1");
                assert_eq!(args.question, "why?");
            }
            _ => panic!("expected query"),
        }
    }

    #[test]
    fn test_query_requires_question() {
        assert!(Cli::try_parse_from(["codevec", "query", "s1"]).is_err());
    }
}
