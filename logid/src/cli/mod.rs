mod host;
mod pair;
mod probe;
mod run;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context as _, Result};
use clap::{ArgAction, Parser, Subcommand};
use host::HostCommand;
use logid_hidpp::context::Context;
use pair::PairCommand;
use probe::ProbeCommand;
use run::RunCommand;
use tracing_subscriber::EnvFilter;

use crate::config::{self, Config};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    color: colorchoice_clap::Color,

    #[command(subcommand)]
    command: Commands,

    /// Path of the configuration file
    #[arg(short, long, global = true, default_value_os_t = config::default_path())]
    config: PathBuf,

    /// Log more details, repeat for even more
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Output plain JSON without color and interactivity
    #[arg(short, long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    Run(RunCommand),
    Probe(ProbeCommand),
    Pair(PairCommand),
    Host(HostCommand),
}

pub async fn execute() -> Result<()> {
    let cli = Cli::parse();

    cli.color.write_global();

    let config = Config::load(&cli.config)?;
    init_logging(cli.verbose, &config)?;

    match &cli.command {
        Commands::Run(cmd) => cmd.execute(&cli, config).await,
        Commands::Probe(cmd) => cmd.execute(&cli, config).await,
        Commands::Pair(cmd) => cmd.execute(&cli, config).await,
        Commands::Host(cmd) => cmd.execute(&cli, config).await,
    }
}

/// Logs to stderr. `RUST_LOG` takes precedence over the verbosity flags and
/// the configured level.
fn init_logging(verbose: u8, config: &Config) -> Result<()> {
    let default = match verbose {
        0 => config.log_level.as_deref().unwrap_or("info"),
        1 => "debug",
        _ => "trace",
    };

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default)
            .with_context(|| format!("invalid log level {default:?}"))?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}

fn create_context(config: &Config) -> Result<Arc<Context>> {
    Context::new(config.options.clone()).context("could not start the worker pool")
}
