//! CLI for mirroring a photo directory tree into Google Photos albums.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use gphotos_sync::client::GooglePhotosClient;
use gphotos_sync::clock::SystemClock;
use gphotos_sync::progress::ConsoleReporter;
use gphotos_sync::retry::DEFAULT_RETRY_BUDGET;
use gphotos_sync::{RunConfig, Runner};

/// Uploads a directory tree to Google Photos, one album per directory
#[derive(Parser, Debug)]
#[command(name = "gphotos-sync")]
#[command(version, about, long_about = None)]
struct Args {
    /// Source directory to upload
    #[arg(short = 'r', long)]
    root: PathBuf,

    /// Ignore previously recorded uploads and re-upload everything
    #[arg(long)]
    no_resume: bool,

    /// OAuth access token for the Google Photos Library API
    #[arg(long, env = "GPHOTOS_ACCESS_TOKEN")]
    access_token: Option<String>,

    /// Store the resolved access token in the config file for later runs
    #[arg(long)]
    save_token: bool,

    /// Maximum number of files uploading at once (defaults to CPU count)
    #[arg(short = 'p', long)]
    parallelism: Option<usize>,

    /// Maximum API requests per second
    #[arg(long, default_value_t = 10)]
    requests_per_sec: u32,

    /// Consecutive transient retries before the run gives up
    #[arg(long, default_value_t = DEFAULT_RETRY_BUDGET)]
    retry_budget: u32,

    /// Override the upload-state file location
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Overall run deadline in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let file_config = config::load();

    let access_token = args
        .access_token
        .or(file_config.auth.access_token)
        .context(
            "an access token is required: pass --access-token, set GPHOTOS_ACCESS_TOKEN, \
             or add it to the config file",
        )?;

    if args.save_token {
        config::save(&config::Config {
            auth: config::AuthConfig {
                access_token: Some(access_token.clone()),
            },
        })?;
        eprintln!("access token saved to {}", config::config_path().display());
    }

    let client = GooglePhotosClient::new(&access_token)?;

    let mut run_config = RunConfig::new(&args.root);
    run_config.resume = !args.no_resume;
    if let Some(parallelism) = args.parallelism {
        run_config.parallelism = parallelism.max(1);
    }
    run_config.requests_per_sec = args.requests_per_sec;
    run_config.retry_budget = args.retry_budget;
    run_config.state_path = args.state_file;
    run_config.deadline = args.timeout_secs.map(Duration::from_secs);

    let runner = Runner::new(
        Arc::new(client),
        Arc::new(ConsoleReporter::new()),
        Arc::new(SystemClock),
        run_config,
    );

    let cancel = runner.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("cancelling, waiting for in-flight uploads...");
            cancel.cancel();
        }
    });

    let summary = runner.run().await?;
    println!(
        "Done: {} uploaded, {} skipped, {} rejected",
        summary.uploaded, summary.skipped, summary.rejected
    );
    Ok(())
}
