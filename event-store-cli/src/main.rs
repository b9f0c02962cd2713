#![allow(missing_docs)]

mod config;

use clap::{Parser, Subcommand};
use envconfig::Envconfig;

use event_store_postgres::PostgresGateway;

use config::Config;

#[derive(Parser)]
#[command(name = "event-store-ctl", about = "Bootstrap and operate an event-store service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Creates the schema if it does not exist yet, idempotently.
    Init,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::init_from_env()?;

    init_tracing(&config.log_level);

    tokio::runtime::Builder::new_multi_thread().enable_all().build()?.block_on(run(cli, config))
}

async fn run(cli: Cli, config: Config) -> anyhow::Result<()> {
    match cli.command {
        Command::Init => {
            let dsn = config.postgres_dsn();
            PostgresGateway::connect(&dsn, config.db_pool_size).await?;
            tracing::info!("event-store schema is up to date");
            Ok(())
        }
    }
}

fn init_tracing(log_level: &str) {
    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::fmt().with_env_filter(filter_layer).json().init();
}
