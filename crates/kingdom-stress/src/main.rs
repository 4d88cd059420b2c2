mod scenario_chunked;
mod scenario_common;
mod scenario_failover;
mod scenario_merge;
mod scenario_pubsub;
mod scenario_runner;

use clap::{Parser, Subcommand};
use scenario_common::ScenarioResult;

#[derive(Parser)]
#[command(name = "kingdom-stress", about = "Scenario driver for the Kingdom protocol")]
struct Cli {
    /// Emit one JSON line per scenario on stdout.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Two kingdoms drift into range; the greater king absorbs the other.
    Merge,
    /// The king vanishes; the prince takes over and peasants follow.
    Failover,
    /// Three devices trade messages on one channel.
    Pubsub,
    /// Payloads far above the frame limit cross the kingdom in chunks.
    Chunked,
    /// Every scenario in sequence, then a suite line per scenario.
    All,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    eprintln!("kingdom-stress v{}", env!("CARGO_PKG_VERSION"));

    let result = match cli.command {
        Command::Merge => scenario_merge::run().await?,
        Command::Failover => scenario_failover::run().await?,
        Command::Pubsub => scenario_pubsub::run().await?,
        Command::Chunked => scenario_chunked::run().await?,
        Command::All => scenario_runner::run(cli.json).await,
    };
    report(&result, cli.json);

    if !result.success() {
        std::process::exit(1);
    }
    Ok(())
}

fn report(result: &ScenarioResult, json: bool) {
    result.print_summary();
    if json {
        result.emit_jsonl();
    }
}
