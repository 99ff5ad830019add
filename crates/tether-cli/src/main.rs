use clap::{Parser, Subcommand};
use tether_core::TetherConfig;
use tracing::warn;

mod probe;

/// Drive a workload through the shared SQLite connection.
#[derive(Parser, Debug)]
#[command(name = "tether", version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to $TETHER_CONFIG, then ~/.tether/tether.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run concurrent tasks that borrow the shared connection.
    Probe(probe::ProbeArgs),
    /// Print the resolved configuration as JSON.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether=info,tether_lease=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // explicit --config > TETHER_CONFIG env > ~/.tether/tether.toml
    let config = TetherConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        TetherConfig::default()
    });

    match cli.command {
        Command::Probe(args) => probe::run(config, args).await,
        Command::Config => {
            println!("{}", config.to_json_pretty()?);
            Ok(())
        }
    }
}
