//! cncflow CLI - replay recorded collector output and inspect the result

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cncflow_core::config::Config;
use cncflow_core::fault::classify;
use cncflow_core::logging::init_logging;
use cncflow_core::record::ModuleId;
use cncflow_core::storage::{SqliteStore, Store};

mod replay;

#[derive(Parser)]
#[command(name = "cncflow")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    CheckConfig {
        /// Path to the TOML configuration
        path: PathBuf,
    },

    /// Print the default configuration as TOML
    DefaultConfig,

    /// Consolidate a JSONL file of records into a SQLite database
    Replay {
        /// Path to the TOML configuration (defaults apply when omitted)
        #[arg(short, long, env = "CNCFLOW_CONFIG")]
        config: Option<PathBuf>,

        /// SQLite database to write (created if missing)
        #[arg(long)]
        db: PathBuf,

        /// Stamps to register before replaying
        #[arg(long = "stamp", value_name = "ID")]
        stamps: Vec<i64>,

        /// One JSON record per line
        records: PathBuf,
    },

    /// Print the import log of a module as JSON lines
    ImportLog {
        /// SQLite database to read
        #[arg(long)]
        db: PathBuf,

        /// Module identifier
        #[arg(long)]
        module: u64,
    },
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(Config::default()),
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::CheckConfig { path } => {
            load_config(Some(&path))?;
            println!("{}: ok", path.display());
        }
        Commands::DefaultConfig => {
            print!("{}", Config::default().to_toml_string()?);
        }
        Commands::Replay {
            config,
            db,
            stamps,
            records,
        } => {
            let mut config = load_config(config.as_deref())?;
            if cli.verbose {
                config.logging.level = "debug".to_string();
            }
            // Replay proceeds without logging if the subscriber cannot be installed.
            let _ = init_logging(&config.logging);
            let summary = replay::replay(&config, &db, &records, &stamps).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::ImportLog { db, module } => {
            let store = SqliteStore::open(&db)
                .with_context(|| format!("opening database {}", db.display()))?;
            let entries = store.read("import_log", |tx| tx.import_log(ModuleId(module)))?;
            for entry in entries {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            let fatal = e
                .downcast_ref::<cncflow_core::Error>()
                .is_some_and(|core| classify(core).is_fatal());
            if fatal {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
