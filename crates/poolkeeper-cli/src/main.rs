use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "poolkeeper",
    about = "Poolkeeper — bounded per-database connection pools",
    version,
    propagate_version = true,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate a poolkeeper.toml, then print the resolved configuration
    Check {
        /// Path to the configuration file
        #[arg(short, long, default_value = "poolkeeper.toml")]
        config: PathBuf,
    },
    /// Open a connection to each database through the pool manager and run `SELECT 1`.
    ///
    /// Databases are probed in the order given, so with more databases than
    /// `max_db` the earliest non-persistent pools are evicted along the way.
    /// Per-pool statistics are printed as JSON.
    Probe {
        #[arg(short, long, default_value = "poolkeeper.toml")]
        config: PathBuf,
        /// Database to probe (repeatable). Defaults to connection.dbname.
        #[arg(long = "db")]
        databases: Vec<String>,
        /// Database whose pool must not be evicted (repeatable)
        #[arg(long)]
        persistent: Vec<String>,
        /// Seconds allowed for each new connection to be established
        #[arg(long, default_value_t = 10)]
        connect_timeout: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("poolkeeper=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config } => commands::check::check(&config),
        Commands::Probe {
            config,
            databases,
            persistent,
            connect_timeout,
        } => commands::probe::probe(&config, &databases, &persistent, connect_timeout).await,
    }
}
