//! DataForge command-line entry point.
//!
//! Exit codes: 0 normal shutdown, 1 fatal initialization failure,
//! 2 configuration error.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dataforge_engine::DataForge;

mod config;

use config::AppConfig;

#[derive(Debug, Parser)]
#[command(
    name = "dataforge",
    version,
    about = "Local data-integration engine: versioned stores, pipelines, scheduling and rollback"
)]
struct Cli {
    /// Data directory (default: $DATAFORGE_DATA_DIR or ./dataforge-data)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Cron timezone, an IANA name (default: $DATAFORGE_TIMEZONE or UTC)
    #[arg(long, global = true)]
    timezone: Option<String>,

    /// Log level filter (default: $DATAFORGE_LOG_LEVEL or info)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the engine: scheduler, event pump and webhook dispatcher
    Serve,
    /// Validate configuration and report store statistics, then exit
    Check,
    /// List orphaned store files no data-source config references
    Orphans,
}

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    if config.log_json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    let cli = Cli::parse();

    let config = match AppConfig::resolve(
        cli.data_dir.clone(),
        cli.timezone.clone(),
        cli.log_level.clone(),
        cli.log_json,
    ) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {}", error);
            return ExitCode::from(2);
        }
    };
    if let Err(error) = config.validate() {
        eprintln!("configuration error: {}", error);
        return ExitCode::from(2);
    }

    init_logging(&config);

    let forge = match DataForge::open(config.engine_settings()) {
        Ok(forge) => forge,
        Err(error) => {
            error!(%error, "initialization failed");
            return ExitCode::from(1);
        }
    };

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(forge).await,
        Command::Check => check(forge),
        Command::Orphans => orphans(forge),
    }
}

async fn serve(forge: DataForge) -> ExitCode {
    if let Err(error) = forge.start().await {
        error!(%error, "startup failed");
        return ExitCode::from(1);
    }
    info!("dataforge serving; press ctrl-c to stop");

    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(%error, "could not listen for shutdown signal");
        let _ = forge.shutdown();
        return ExitCode::from(1);
    }

    info!("shutdown signal received");
    match forge.shutdown() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "shutdown failed");
            ExitCode::from(1)
        }
    }
}

fn check(forge: DataForge) -> ExitCode {
    match forge.list_projects() {
        Ok(projects) => {
            println!("projects: {}", projects.len());
            for project in projects {
                match forge.list_data_sources(&project.id) {
                    Ok(sources) => {
                        println!("  {} ({} sources)", project.name, sources.len());
                        for source in sources {
                            match forge.stats(&project.id, &source.id) {
                                Ok(stats) => println!(
                                    "    {}: {} versions, {} records, {} bytes",
                                    source.name,
                                    stats.total_versions,
                                    stats.total_records,
                                    stats.data_size_bytes
                                ),
                                Err(error) => {
                                    println!("    {}: unreadable ({})", source.name, error)
                                }
                            }
                        }
                    }
                    Err(error) => println!("  {}: unreadable ({})", project.name, error),
                }
            }
            let _ = forge.shutdown();
            ExitCode::SUCCESS
        }
        Err(error) => {
            error!(%error, "check failed");
            ExitCode::from(1)
        }
    }
}

fn orphans(forge: DataForge) -> ExitCode {
    match forge.orphan_stores() {
        Ok(orphans) if orphans.is_empty() => {
            println!("no orphaned store files");
            let _ = forge.shutdown();
            ExitCode::SUCCESS
        }
        Ok(orphans) => {
            for path in orphans {
                println!("{}", path.display());
            }
            let _ = forge.shutdown();
            ExitCode::SUCCESS
        }
        Err(error) => {
            error!(%error, "orphan sweep failed");
            ExitCode::from(1)
        }
    }
}
