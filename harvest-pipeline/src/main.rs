//! harvest-pipeline - data collection and model retraining
//!
//! Invoked by an external scheduler:
//! - `run daily`  collects one snapshot per tracked entity
//! - `run weekly` evaluates coverage, trains, validates and promotes
//! - `run all`    both, in sequence
//!
//! Results are printed to stdout as JSON; logs go to stderr.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use harvest_common::config::{
    load_toml_config, resolve_config_path, resolve_root_folder, RootFolderInitializer,
};
use harvest_pipeline::api::model::VersionEntry;
use harvest_pipeline::config::PipelineConfig;
use harvest_pipeline::db::{collection_runs, retrain_runs};
use harvest_pipeline::services::{CommandTrainer, FncreateClient};
use harvest_pipeline::store::ArtifactStore;
use harvest_pipeline::workflow::{DailyOptions, Orchestrator, WeeklyOptions};
use harvest_pipeline::AppState;

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "\ngit: ",
    env!("GIT_HASH"),
    "\nbuilt: ",
    env!("BUILD_TIMESTAMP"),
    "\nprofile: ",
    env!("BUILD_PROFILE"),
);

const DEFAULT_PORT: u16 = 5790;

/// Command-line arguments for harvest-pipeline
#[derive(Parser, Debug)]
#[command(name = "harvest-pipeline")]
#[command(about = "Daily snapshot collection and gated model retraining")]
#[command(version, long_version = LONG_VERSION)]
struct Cli {
    /// Folder holding the database and the model store
    #[arg(long, global = true, value_name = "DIR")]
    root_folder: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a scheduled cadence
    Run {
        #[command(subcommand)]
        cadence: RunCommand,
    },
    /// Inspect or roll back the deployed model
    Model {
        #[command(subcommand)]
        action: ModelCommand,
    },
    /// Show the run logs
    Runs {
        #[command(subcommand)]
        log: RunsCommand,
    },
    /// List the entities a daily run collects
    Entities,
    /// Serve the status and rollback API
    Serve {
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
}

#[derive(Subcommand, Debug)]
enum RunCommand {
    /// Collect today's snapshots
    Daily(DailyArgs),
    /// Evaluate, train, validate and promote
    Weekly(WeeklyArgs),
    /// Daily then weekly
    All(WeeklyArgs),
}

#[derive(Args, Debug, Default)]
struct DailyArgs {
    /// Collect only these entities (comma separated)
    #[arg(long, value_delimiter = ',')]
    entities: Option<Vec<String>>,

    /// Re-collect only entities that failed earlier for the same day
    #[arg(long, conflicts_with = "entities")]
    retry_failed: bool,

    /// Collection day (YYYY-MM-DD, UTC); defaults to today
    #[arg(long, value_parser = parse_date_arg)]
    date: Option<NaiveDate>,
}

#[derive(Args, Debug, Clone, Copy)]
struct WeeklyArgs {
    /// Train even if fewer than the minimum new days accumulated
    #[arg(long)]
    force: bool,

    /// Report the decision without touching the model store
    #[arg(long)]
    dry_run: bool,
}

#[derive(Subcommand, Debug)]
enum ModelCommand {
    /// Current model metadata
    Show,
    /// Every stored version
    History,
    /// Every backup record
    Backups,
    /// Point the current model back at a stored version
    Rollback {
        /// Target version; defaults to the model replaced by the latest promotion
        version_id: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
enum RunsCommand {
    /// Latest collection runs
    Collection {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Latest retrain outcomes
    Retrain {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

fn parse_date_arg(value: &str) -> std::result::Result<NaiveDate, String> {
    harvest_common::time::parse_date(value).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    // Config is read before logging exists; its level feeds the filter
    let config_path = resolve_config_path(cli.config.as_deref());
    let toml_config = load_toml_config(config_path.as_deref())?;
    init_tracing(cli.verbose, toml_config.logging.level.as_deref());

    match &config_path {
        Some(path) if path.exists() => info!("Config file: {}", path.display()),
        Some(path) => warn!("Config file {} not found, using defaults", path.display()),
        None => info!("No config file, using defaults"),
    }

    let config = PipelineConfig::resolve(&toml_config)?;
    let root_folder = resolve_root_folder(cli.root_folder.as_deref(), &toml_config);

    let initializer = RootFolderInitializer::new(root_folder);
    initializer
        .ensure_directory_exists()
        .context("Failed to initialize root folder")?;
    info!("Root folder: {}", initializer.root_folder().display());

    let db = harvest_pipeline::db::init_database_pool(&initializer.database_path()).await?;
    let store = ArtifactStore::open(initializer.models_path())?;

    let source = Arc::new(FncreateClient::new(
        &config.metrics_base_url,
        config.fetch_timeout,
        config.requests_per_second,
    )?);
    let trainer = Arc::new(CommandTrainer::new(
        config.trainer_command.clone(),
        store.staging_dir(),
        config.training_timeout,
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        db.clone(),
        config,
        initializer.root_folder().to_path_buf(),
        store,
        source,
        trainer,
    ));

    let cancel = CancellationToken::new();
    spawn_ctrl_c_handler(cancel.clone());

    match cli.command {
        Command::Run { cadence } => run_cadence(&orchestrator, cadence, &cancel).await,
        Command::Model { action } => model_command(&orchestrator, action).await,
        Command::Runs { log } => {
            match log {
                RunsCommand::Collection { limit } => {
                    print_json(&collection_runs::latest_runs(&db, limit).await?)?
                }
                RunsCommand::Retrain { limit } => {
                    print_json(&retrain_runs::latest_outcomes(&db, limit).await?)?
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Entities => {
            print_json(&orchestrator.tracked_entities().await?)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Serve { port } => {
            serve(AppState::new(db, orchestrator), port, cancel).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_cadence(
    orchestrator: &Orchestrator,
    cadence: RunCommand,
    cancel: &CancellationToken,
) -> Result<ExitCode> {
    match cadence {
        RunCommand::Daily(args) => {
            let run = orchestrator.run_daily(&daily_options(args), cancel).await?;
            print_json(&run)?;
            Ok(ExitCode::SUCCESS)
        }
        RunCommand::Weekly(args) => {
            let outcome = orchestrator.run_weekly(weekly_options(args), cancel).await;
            print_json(&outcome)?;
            Ok(exit_code(outcome.status.map(|s| s.is_clean()).unwrap_or(false)))
        }
        RunCommand::All(args) => {
            // Weekly runs even when collection failed; both decide the exit code
            let daily = orchestrator
                .run_daily(&DailyOptions::default(), cancel)
                .await;
            if let Err(e) = &daily {
                error!(error = %e, "Daily collection failed, continuing with weekly run");
            }

            let outcome = orchestrator.run_weekly(weekly_options(args), cancel).await;

            let (daily_run, daily_error) = match &daily {
                Ok(run) => (Some(run), None),
                Err(e) => (None, Some(e.to_string())),
            };
            print_json(&json!({
                "daily": daily_run,
                "daily_error": daily_error,
                "weekly": outcome,
            }))?;

            let weekly_clean = outcome.status.map(|s| s.is_clean()).unwrap_or(false);
            Ok(exit_code(daily.is_ok() && weekly_clean))
        }
    }
}

async fn model_command(orchestrator: &Orchestrator, action: ModelCommand) -> Result<ExitCode> {
    let store = orchestrator.store();

    match action {
        ModelCommand::Show => match store.current()? {
            Some(record) => print_json(&record)?,
            None => println!("No model deployed"),
        },
        ModelCommand::History => {
            let current = store.current_pointer()?.map(|p| p.version_id);
            let versions: Vec<VersionEntry> = store
                .history()?
                .into_iter()
                .map(|record| VersionEntry {
                    is_current: Some(record.version_id) == current,
                    readable: store.is_readable(&record),
                    record,
                })
                .collect();
            print_json(&versions)?;
        }
        ModelCommand::Backups => print_json(&store.backups()?)?,
        ModelCommand::Rollback { version_id } => {
            let record = orchestrator.rollback(version_id).await?;
            print_json(&record)?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn serve(state: AppState, port: u16, cancel: CancellationToken) -> Result<()> {
    let app = harvest_pipeline::build_router(state);

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("Failed to bind to port {}", port))?;
    info!("Listening on http://127.0.0.1:{}", port);
    info!("Health check: http://127.0.0.1:{}/health", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

fn daily_options(args: DailyArgs) -> DailyOptions {
    DailyOptions {
        as_of: args.date.unwrap_or_else(harvest_common::time::today),
        entities: args.entities.map(|ids| {
            ids.into_iter()
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .collect::<BTreeSet<_>>()
        }),
        retry_failed: args.retry_failed,
    }
}

fn weekly_options(args: WeeklyArgs) -> WeeklyOptions {
    WeeklyOptions {
        force: args.force,
        dry_run: args.dry_run,
    }
}

fn exit_code(clean: bool) -> ExitCode {
    if clean {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// `--verbose` wins, then RUST_LOG, then the config file level, then info
fn init_tracing(verbose: bool, configured_level: Option<&str>) {
    let filter = if verbose {
        EnvFilter::new("info,harvest_pipeline=debug,harvest_common=debug,tower_http=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(configured_level.unwrap_or("info")))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Cancel the running invocation on Ctrl+C
fn spawn_ctrl_c_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                warn!("Received Ctrl+C, cancelling");
                cancel.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to install Ctrl+C handler"),
        }
    });
}
