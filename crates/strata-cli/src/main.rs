use std::path::PathBuf;

use clap::{Parser, Subcommand};
use strata::{Config, TieredMemory};
use strata_cli::commands::{IndexCommand, MigrateCommand, RecordCommand, StatsCommand};
use strata_cli::error::CliResult;
use strata_cli::output::OutputFormat;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Strata CLI - Operate a tiered memory store")]
#[command(version)]
pub struct Cli {
    #[clap(long, short, global = true, help = "Output in JSON format")]
    pub json: bool,

    #[clap(long, short = 'd', global = true, help = "Path to data directory")]
    pub data_dir: Option<PathBuf>,

    #[clap(long, short = 'c', global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    #[clap(about = "Show cache and durable tier statistics")]
    Stats(StatsCommand),

    #[clap(about = "Record inspection and management")]
    Record(RecordCommand),

    #[clap(about = "ANN index management")]
    Index(IndexCommand),

    #[clap(about = "Durable tier migrations")]
    Migrate(MigrateCommand),
}

#[tokio::main]
async fn main() {
    init_logging();

    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Table
    };

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir.clone() {
        config.storage.data_dir = data_dir;
    }

    let memory = TieredMemory::open(config).await?;

    match &cli.command {
        Command::Stats(cmd) => cmd.execute(&memory, format).await,
        Command::Record(cmd) => cmd.execute(&memory, format).await,
        Command::Index(cmd) => cmd.execute(&memory, format).await,
        Command::Migrate(cmd) => cmd.execute(&memory, format).await,
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,strata=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
