//! Entry point of the operator daemon.

use anyhow::Result;
use clap::{Parser, Subcommand};
use quarry_common::telemetry;
use tracing::info;

/// Command line interface for the quarry operator.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// OTLP endpoint spans are exported to. When unset spans stay local.
    #[arg(long, env = "OPERATOR_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the search cluster controller.
    Daemon,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    telemetry::init_tracing(args.otlp_endpoint.clone()).await?;

    match args.command {
        Command::Daemon => {
            info!("starting search cluster controller");
            quarry_operator::cluster::run().await;
        }
    }

    telemetry::shutdown();
    Ok(())
}
