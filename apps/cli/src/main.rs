//! Fishfresh CLI - train and inspect the freshness/species classifier
//!
//! This CLI provides a `fishfresh` command that drives the two-stage training
//! controller against a `datasets/{train,validation,testing}` corpus.

mod commands;
mod config;

use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use commands::{evaluate, restructure, taxonomy, train};
use config::PathOverrides;

/// Fishfresh CLI - multi-task fish freshness trainer
///
/// Trains a two-head (freshness + species) image classifier from a directory
/// corpus, resuming from the best checkpoint across invocations.
#[derive(Parser, Debug)]
#[command(
    name = "fishfresh",
    author,
    version,
    about = "Fishfresh - multi-task freshness and species trainer",
    long_about = "Fishfresh trains a freshness + species image classifier from a directory corpus.\nThe label taxonomy is persisted so indices stay stable across runs and resumes."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Training config file (defaults to ./fishfresh.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train the model
    ///
    /// Starts fresh (head stage, then fine-tune) or resumes the existing
    /// checkpoint at fine-tune settings.
    Train {
        #[command(flatten)]
        paths: PathOverrides,

        /// Ignore an existing checkpoint and start from scratch
        #[arg(long)]
        no_resume: bool,

        /// Output the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Evaluate the saved checkpoint on the testing split
    Evaluate {
        #[command(flatten)]
        paths: PathOverrides,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show discovered species next to the stored taxonomy
    Taxonomy {
        #[command(flatten)]
        paths: PathOverrides,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Move images sitting directly in freshness folders into `unknown/`
    Restructure {
        /// Dataset root containing the split folders
        #[arg(long)]
        data_root: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber =
        FmtSubscriber::builder().with_max_level(level).without_time().with_target(false).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // If no command provided, show help
    let Some(command) = args.command else {
        Args::command().print_help()?;
        return Ok(());
    };

    let config_path = args.config.as_deref();
    match command {
        Command::Train { paths, no_resume, json } => {
            let mut config = config::load_config(config_path, &paths)?;
            if no_resume {
                config.resume = false;
            }
            train::execute(config, json).await?;
        }
        Command::Evaluate { paths, json } => {
            evaluate::execute(config::load_config(config_path, &paths)?, json).await?;
        }
        Command::Taxonomy { paths, json } => {
            taxonomy::execute(&config::load_config(config_path, &paths)?, json)?;
        }
        Command::Restructure { data_root } => {
            let paths = PathOverrides { data_root, models_dir: None };
            restructure::execute(&config::load_config(config_path, &paths)?)?;
        }
    }

    Ok(())
}
