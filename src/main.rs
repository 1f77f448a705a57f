// src/main.rs

use anyhow::{Context, Result};
use clap::Parser;
use odm_engine::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const SAMPLE_URLS: [&str; 3] = [
    "http://example.com/file1.zip",
    "http://example.com/file2.zip",
    "http://example.com/file3.zip",
];

/// Runs a batch of simulated downloads on a bounded worker pool.
#[derive(Debug, Parser)]
#[command(name = "odm", version)]
struct Args {
    /// URLs to download. Defaults to three sample URLs.
    urls: Vec<String>,

    /// JSON config file; command line flags override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of concurrent downloads.
    #[arg(short, long)]
    workers: Option<usize>,

    /// Milliseconds between two progress steps.
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Probability that a progress step fails.
    #[arg(long)]
    failure_rate: Option<f64>,

    /// Seed for reproducible runs.
    #[arg(long)]
    seed: Option<u64>,

    /// Cancel the n-th submitted download (0-based).
    #[arg(long)]
    cancel: Option<usize>,

    /// Delay before the cancellation is sent, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    cancel_after_ms: u64,

    /// Stop everything still running after this many milliseconds.
    #[arg(long)]
    deadline_ms: Option<u64>,
}

/// Prints every event, like the console client of a download manager.
struct ConsoleObserver;

impl DownloadObserver for ConsoleObserver {
    fn on_progress(&self, id: TaskId, percent: u8) {
        println!("Download {id} is {percent}% complete.");
    }

    fn on_complete(&self, id: TaskId) {
        println!("Download {id} completed successfully.");
    }

    fn on_error(&self, id: TaskId, message: &str) {
        println!("Download {id} failed with error: {message}");
    }

    fn on_cancel(&self, id: TaskId) {
        println!("Download {id} was canceled.");
    }
}

impl Args {
    async fn manager_config(&self) -> Result<ManagerConfig> {
        let mut config = match &self.config {
            Some(path) => ManagerConfig::load(path)
                .await
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => ManagerConfig::default(),
        };
        if let Some(workers) = self.workers {
            config.max_concurrent_downloads = workers;
        }
        if let Some(interval) = self.interval_ms {
            config.tick_interval_ms = interval;
        }
        if let Some(rate) = self.failure_rate {
            config.failure_rate = rate;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let config = args.manager_config().await?;
    let manager = Arc::new(DownloadManager::new(config)?);

    let urls: Vec<String> = if args.urls.is_empty() {
        SAMPLE_URLS.iter().map(|url| url.to_string()).collect()
    } else {
        args.urls.clone()
    };

    let observer: Arc<dyn DownloadObserver> = Arc::new(ConsoleObserver);
    let mut ids = Vec::with_capacity(urls.len());
    for url in &urls {
        let id = manager.submit(url.as_str(), observer.clone())?;
        println!("Queued {url} as {id}");
        ids.push(id);
    }

    if let Some(index) = args.cancel {
        let id = *ids
            .get(index)
            .with_context(|| {
                format!("--cancel {index}: only {} downloads were submitted", ids.len())
            })?;
        let manager = manager.clone();
        let delay = Duration::from_millis(args.cancel_after_ms);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match manager.cancel(id) {
                CancelOutcome::Canceled => println!("Cancel requested for {id}"),
                CancelOutcome::AlreadyTerminal(status) => {
                    println!("{id} already finished ({status})")
                }
                CancelOutcome::NotFound => println!("{id} not found"),
            }
        });
    }

    match args.deadline_ms {
        Some(deadline) => {
            let drained =
                tokio::time::timeout(Duration::from_millis(deadline), manager.shutdown()).await;
            if drained.is_err() {
                let canceled = manager.shutdown_now().await;
                println!("Deadline reached, canceled {canceled} downloads");
            }
        }
        None => manager.shutdown().await,
    }

    println!();
    for snapshot in manager.snapshots() {
        println!(
            "{:<8} {:<12} {:>3}%  {}",
            snapshot.id.to_string(),
            snapshot.status.to_string(),
            snapshot.progress,
            snapshot.url
        );
    }
    Ok(())
}
