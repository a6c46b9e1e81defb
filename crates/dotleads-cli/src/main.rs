use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use dotleads_core::{format_date, parse_target_date};
use dotleads_sync::{pipeline_from_config, run_scheduled, RunMode, SyncConfig};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "dotleads")]
#[command(about = "Pull newly registered FMCSA carriers into the daily leads sheet")]
struct Cli {
    /// Log at debug level unless DOTLEADS_LOG is set.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once.
    Run {
        /// Registration date to pull (YYYY-MM-DD). Defaults to yesterday.
        #[arg(long, value_parser = parse_date_arg)]
        date: Option<NaiveDate>,
    },
    /// Run on startup and then on SCHEDULE_CRON until Ctrl-C.
    Schedule,
    /// Serve the HTTP trigger.
    Serve {
        #[arg(long, env = "DOTLEADS_WEB_PORT", default_value_t = dotleads_web::DEFAULT_PORT)]
        port: u16,
    },
}

fn parse_date_arg(raw: &str) -> Result<NaiveDate, String> {
    parse_target_date(raw).map_err(|_| format!("invalid date '{raw}', expected YYYY-MM-DD"))
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = load_env_file(dotenvy::dotenv()) {
        eprintln!("error: {err:#}");
        return ExitCode::FAILURE;
    }
    let cli = Cli::parse();

    if let Err(err) = init_tracing(cli.verbose) {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    match dispatch(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(command: Option<Commands>) -> Result<()> {
    let config = SyncConfig::from_env().context("loading configuration")?;
    let command = command.unwrap_or(match config.run_mode {
        RunMode::Once => Commands::Run { date: None },
        RunMode::Schedule => Commands::Schedule,
    });

    match command {
        Commands::Run { date } => {
            let pipeline = pipeline_from_config(&config).await?;
            let summary = pipeline.run_with_failure_notice(date).await?;
            println!(
                "run complete: date={} fetched={} unique={} new={} existing={} report_sent={}",
                format_date(summary.target_date),
                summary.fetched,
                summary.unique,
                summary.new_records,
                summary.existing_count,
                summary.report_sent
            );
        }
        Commands::Schedule => {
            let pipeline = pipeline_from_config(&config).await?;
            run_scheduled(Arc::new(pipeline), &config.schedule).await?;
        }
        Commands::Serve { port } => {
            let pipeline = pipeline_from_config(&config).await?;
            info!(port, "starting http trigger");
            dotleads_web::serve(Arc::new(pipeline), port).await?;
        }
    }

    Ok(())
}

/// A missing `.env` is fine; an unreadable or malformed one is not.
fn load_env_file<T>(loaded: dotenvy::Result<T>) -> Result<()> {
    match loaded {
        Ok(_) => Ok(()),
        Err(err) if err.not_found() => Ok(()),
        Err(err) => Err(err).context("failed to load .env file"),
    }
}

fn init_tracing(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_env("DOTLEADS_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))?;

    Ok(())
}
