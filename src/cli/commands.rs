//! CLI command definitions and handlers

use clap::Subcommand;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::client::StreetViewClient;
use crate::core::config::FetcherConfig;
use crate::core::key_pool::KeyPool;
use crate::core::models::{BatchOutcome, Heading};
use crate::core::storage::LocalImageStore;

/// Commands for the Street View fetcher
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download imagery for every location in a batch file
    Download {
        /// JSON or YAML list of {id, lat, lng, group}
        #[arg(short, long)]
        input: PathBuf,

        /// Re-download items that already have a stored record
        #[arg(long)]
        no_skip_existing: bool,
    },

    /// Fetch imagery for a single coordinate
    Fetch {
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,

        #[arg(long, allow_hyphen_values = true)]
        lng: f64,

        /// Single heading in degrees (default: all four)
        #[arg(long)]
        heading: Option<u16>,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },

    /// Show configured key status
    Keys,

    /// Start HTTP admin server
    Server {
        /// Bind address (default: 0.0.0.0)
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Listen port (default: 8000)
        #[arg(short, long, default_value_t = 8000)]
        port: u16,
    },
}

fn build_store(config: &FetcherConfig) -> LocalImageStore {
    let store = LocalImageStore::new(config.storage_root.clone());
    match &config.storage_base_url {
        Some(base_url) => store.with_base_url(base_url.clone()),
        None => store,
    }
}

fn build_client(config: FetcherConfig) -> anyhow::Result<StreetViewClient> {
    config.validate()?;
    let key_pool = KeyPool::from_config(&config);
    Ok(StreetViewClient::new(config, key_pool)?)
}

/// Handle batch download command
pub async fn handle_download(
    config: FetcherConfig,
    input: PathBuf,
    skip_existing: bool,
) -> anyhow::Result<()> {
    use crate::processors::batch::{load_batch_items, BatchOptions, BatchOrchestrator};
    use indicatif::{ProgressBar, ProgressStyle};
    use std::time::Instant;
    use tokio_util::sync::CancellationToken;
    use tracing::info;

    let start_time = Instant::now();

    let items = load_batch_items(&input)?;
    if items.is_empty() {
        anyhow::bail!("No locations found in {}", input.display());
    }

    info!("Starting batch download");
    info!("Input: {}", input.display());
    info!("Storage: {}", config.storage_root.display());
    info!("Skip existing: {}", skip_existing);

    let store = Arc::new(build_store(&config));
    let client = build_client(config)?;
    let orchestrator = BatchOrchestrator::new(client, store, BatchOptions { skip_existing });

    // Stop between items on Ctrl-C
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nCancelling after the current location...");
            ctrl_c.cancel();
        }
    });

    // Create progress bar
    let pb = ProgressBar::new(items.len() as u64);
    pb.set_style(ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
        .progress_chars("=>-"));

    let report = orchestrator
        .run(&items, &cancel, |progress| {
            pb.set_position((progress.processed + progress.skipped) as u64);
            pb.set_message(format!(
                "images: {} failed: {} skipped: {}",
                progress.succeeded, progress.failed, progress.skipped
            ));
        })
        .await;

    pb.finish_with_message(report.outcome.to_string());

    let duration = start_time.elapsed();
    let progress = report.progress;

    match report.outcome {
        BatchOutcome::Completed => println!("\n✅ Download completed!"),
        BatchOutcome::Halted => {
            println!("\n⚠️  All API keys exhausted, batch halted.");
            println!(
                "   Completed {} of {} locations; {} remain.",
                progress.processed,
                progress.total,
                report.remaining()
            );
            println!("   Wait for the daily reset or add keys, then rerun to resume.");
        }
        BatchOutcome::Cancelled => println!("\n⏹  Download cancelled."),
    }
    println!("   Processed: {}", progress.processed);
    println!("   Images: {}", progress.succeeded);
    println!("   Failed: {}", progress.failed);
    println!("   Skipped: {}", progress.skipped);
    println!("   Time: {:?}", duration);

    Ok(())
}

fn image_file_name(lat: f64, lng: f64, heading: Heading) -> String {
    format!("{:.6}_{:.6}_{}.jpg", lat, lng, heading)
}

async fn write_image(output: &Path, lat: f64, lng: f64, heading: Heading, bytes: &[u8]) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(output).await?;
    let path = output.join(image_file_name(lat, lng, heading));
    tokio::fs::write(&path, bytes).await?;
    println!("   {} ({} bytes)", path.display(), bytes.len());
    Ok(())
}

/// Handle ad hoc fetch command
pub async fn handle_fetch(
    config: FetcherConfig,
    lat: f64,
    lng: f64,
    heading: Option<u16>,
    output: PathBuf,
) -> anyhow::Result<()> {
    let client = build_client(config)?;

    match heading {
        Some(degrees) => {
            let image = client.fetch_heading(lat, lng, Heading(degrees)).await?;
            println!("✅ Captured {}", image.capture_date.as_deref().unwrap_or("unknown date"));
            write_image(&output, lat, lng, image.heading, &image.bytes).await?;
        }
        None => {
            let result = client.fetch_location(lat, lng).await?;
            println!(
                "✅ {} of 4 headings, captured {}",
                result.images.len(),
                result.metadata.capture_date.as_deref().unwrap_or("unknown date")
            );
            for image in &result.images {
                write_image(&output, lat, lng, image.heading, &image.bytes).await?;
            }
            for failure in &result.failures {
                eprintln!("   heading {} failed: {}", failure.heading, failure.error);
            }
        }
    }

    Ok(())
}

/// Handle key status command
pub async fn handle_keys(config: FetcherConfig) -> anyhow::Result<()> {
    config.validate()?;
    let pool = KeyPool::from_config(&config);
    let status = pool.status().await;

    println!("🔑 {} keys, {} available", status.total_keys, status.available_keys);
    println!(
        "   per-minute ceiling: {}, daily ceiling: {}",
        config.requests_per_minute, config.daily_limit
    );
    for key in &status.keys {
        println!(
            "   {}  today: {}/{}  blocked: {}  exhausted: {}",
            key.prefix, key.requests_today, key.daily_limit, key.is_temporarily_blocked, key.daily_limit_reached
        );
    }

    Ok(())
}

/// Handle server command
pub async fn handle_server(config: FetcherConfig, host: String, port: u16) -> anyhow::Result<()> {
    use crate::server::api::run_server;
    use tracing::info;

    info!("Starting HTTP server on {}:{}", host, port);
    println!("🚀 Server starting on http://{}:{}", host, port);
    println!("🔑 Key status: http://{}:{}/admin/keys", host, port);

    run_server(config, host, port).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_file_name() {
        assert_eq!(
            image_file_name(51.5, -0.125, Heading::SOUTH),
            "51.500000_-0.125000_180.jpg"
        );
    }

    #[test]
    fn test_build_client_requires_keys() {
        assert!(build_client(FetcherConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_handle_download_rejects_empty_input() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("items.json");
        std::fs::write(&input, "[]").unwrap();

        let config = FetcherConfig {
            api_keys: vec!["k1".to_string()],
            storage_root: dir.path().join("out"),
            ..Default::default()
        };
        assert!(handle_download(config, input, true).await.is_err());
    }
}
