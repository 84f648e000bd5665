use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use coinalyze_ops::{ExportArgs, LiveArgs, MarketsArgs, export, live, markets};

#[derive(Parser, Debug)]
#[command(version, about = "Coinalyze market-data collector and exporters")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Live polling loop: snapshot + JSONL stream per cycle, with retention
    Live(LiveArgs),
    /// Batch OHLCV history export (single day, range, or whole month)
    Export(ExportArgs),
    /// Inspect tradable markets / exchanges
    Markets(MarketsArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let args = Args::parse();
    match args.command {
        Command::Live(live_args) => live::execute(&live_args).await,
        Command::Export(export_args) => export::execute(&export_args).await,
        Command::Markets(markets_args) => markets::execute(&markets_args).await,
    }
}
