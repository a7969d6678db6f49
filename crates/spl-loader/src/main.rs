//! SPL Loader - Main entry point

use anyhow::Context;
use clap::Parser;
use spl_common::logging::{init_logging, LogConfig, LogFormat, LogLevel};
use spl_loader::config::Settings;
use spl_loader::pipeline::Pipeline;
use spl_loader::{storage, Cli, Commands};
use std::process;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let guard = match log_config(&cli).and_then(|config| init_logging(&config)) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {:#}", e);
            None
        },
    };

    let result = execute(cli.command).await;

    if let Err(e) = result {
        error!(error = %e, "Command failed");
        eprintln!("Error: {:#}", e);
        drop(guard);
        process::exit(1);
    }
}

/// Environment first, then the command-line flags on top
fn log_config(cli: &Cli) -> anyhow::Result<LogConfig> {
    let mut config = LogConfig::builder()
        .log_file_prefix("spl-loader")
        .build()
        .merge_env()?;

    if let Some(level) = &cli.log_level {
        config.level = level.parse::<LogLevel>()?;
    }
    if let Some(format) = &cli.log_format {
        config.format = format.parse::<LogFormat>()?;
    }
    Ok(config)
}

async fn execute(command: Commands) -> anyhow::Result<()> {
    let settings = Settings::load().context("Invalid configuration")?;
    let backend = storage::connect(&settings.database)
        .await
        .context("Could not connect to the database")?;

    let pipeline = Pipeline::new(settings, backend.clone());
    let result = run(&pipeline, command).await;
    backend.close().await;
    result
}

async fn run(pipeline: &Pipeline, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Init => {
            pipeline.init().await?;
            info!("Database schema initialized successfully");
        },
        Commands::FullLoad { source } => {
            let report = pipeline.run_full_load(source.as_deref()).await?;
            info!(
                run_id = report.run_id,
                records = report.records_loaded,
                documents = report.documents,
                quarantined = report.quarantined,
                "Full load complete"
            );
        },
        Commands::DeltaLoad => {
            let report = pipeline.run_delta_load().await?;
            info!(
                run_id = report.run_id,
                records = report.records_loaded,
                archives = report.archives.len(),
                "Delta load complete"
            );
        },
        Commands::RestoreSchema => {
            let restored = pipeline.restore_schema().await?;
            println!("Restored {} index/constraint definition(s)", restored);
        },
        Commands::Status { limit } => {
            let status = pipeline.status(limit).await?;
            println!("Processed archives: {}", status.processed_archives);
            if status.deferred_schema_objects > 0 {
                println!(
                    "WARNING: {} index/constraint definition(s) are dropped; run `spl-loader restore-schema`",
                    status.deferred_schema_objects
                );
            }
            println!();
            println!(
                "{:>6}  {:<6}  {:<25}  {:<25}  {:<8}  {:>10}",
                "RUN", "MODE", "STARTED", "ENDED", "STATUS", "RECORDS"
            );
            for run in status.recent_runs {
                println!(
                    "{:>6}  {:<6}  {:<25}  {:<25}  {:<8}  {:>10}",
                    run.run_id,
                    run.mode,
                    run.start_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
                    run.end_time
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    run.status.to_string(),
                    run.records_loaded
                );
                if let Some(error_log) = run.error_log {
                    println!("        error: {}", error_log);
                }
            }
        },
    }
    Ok(())
}
