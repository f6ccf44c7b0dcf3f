// ABOUTME: Command-line entry point for the lvconnect bridge
// ABOUTME: One-shot login/fetch/run commands plus a periodic daemon mode
//
// SPDX-License-Identifier: MIT OR Apache-2.0

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use lvconnect::{ConnectConfig, Engine};

#[derive(Parser)]
#[command(name = "lvconnect", version, about = "LibreView to Nightscout synchronization bridge")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Authenticate against the LibreView API and report the outcome
    Login,
    /// Fetch and convert the latest data, printing entries to stdout
    Fetch,
    /// Run one full sync: fetch, convert and upload
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ConnectConfig::from_env()?;
    let interval = config.interval;
    let mut engine = Engine::new(config)?;

    match Cli::parse().command {
        Some(Command::Login) => {
            let status = engine.login().await?;
            info!(?status, "login finished");
        }
        Some(Command::Fetch) => {
            let entries = engine.fetch_entries().await?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        Some(Command::Run) => {
            let status = engine.run_once().await?;
            info!(%status, "sync finished");
        }
        None => loop {
            info!("fetching LibreView data...");
            engine.run().await;
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                result = tokio::signal::ctrl_c() => {
                    result?;
                    info!("shutting down");
                    break;
                }
            }
        },
    }

    Ok(())
}
