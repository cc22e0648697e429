use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod proxy;
mod replay;

#[derive(Parser)]
#[command(name = "liveproof", version, about = "LiveProof liveness verification client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print daemon status as JSON
    Status,
    /// Replay a recorded landmark stream through a new session
    Replay {
        /// JSON-lines recording
        file: PathBuf,
        /// Sleep between frames for their recorded duration
        #[arg(long)]
        realtime: bool,
    },
    /// Show the state of a session
    State {
        session_id: String,
    },
    /// Cancel a running session
    Cancel {
        session_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let proxy = proxy::connect()
        .await
        .context("failed to connect to liveproofd (is the daemon running?)")?;

    match cli.command {
        Command::Status => {
            let status = proxy.status().await?;
            let value: serde_json::Value = serde_json::from_str(&status)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Command::Replay { file, realtime } => replay::run(&proxy, file, realtime).await?,
        Command::State { session_id } => {
            let (state, reason) = proxy.get_state(&session_id).await?;
            if reason.is_empty() {
                println!("{state}");
            } else {
                println!("{state} ({reason})");
            }
        }
        Command::Cancel { session_id } => {
            proxy.cancel_session(&session_id).await?;
            println!("cancelled {session_id}");
        }
    }

    Ok(())
}
