//! Main entry point for the Street View fetcher CLI

#![forbid(unsafe_code)]

use clap::Parser;
use dotenvy::dotenv;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use streetview_fetcher::cli::commands::{self, Commands};
use streetview_fetcher::FetcherConfig;

/// Multi-key rate-limited Street View imagery fetcher
#[derive(Parser, Debug)]
#[command(name = "streetview-fetcher", version, about, long_about = None)]
struct Args {
    /// Comma separated API keys (defaults to STREETVIEW_API_KEYS env var)
    #[arg(long)]
    api_keys: Option<String>,

    /// JSON or YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Requests per minute per key
    #[arg(long)]
    rpm: Option<u32>,

    /// Requests per day per key
    #[arg(long)]
    daily_limit: Option<u32>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{}={}", env!("CARGO_PKG_NAME").replace('-', "_"), log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Override config with CLI args if provided
    if let Some(api_keys) = &args.api_keys {
        std::env::set_var("STREETVIEW_API_KEYS", api_keys);
    }

    let Some(command) = args.command else {
        println!("Please specify a command. Use --help for more information.");
        return Ok(());
    };

    let mut config = FetcherConfig::load(args.config.as_deref())?;
    if let Some(rpm) = args.rpm {
        config.requests_per_minute = rpm;
    }
    if let Some(daily_limit) = args.daily_limit {
        config.daily_limit = daily_limit;
    }

    // Execute command
    match command {
        Commands::Download {
            input,
            no_skip_existing,
        } => {
            commands::handle_download(config, input, !no_skip_existing).await?;
        }
        Commands::Fetch {
            lat,
            lng,
            heading,
            output,
        } => {
            commands::handle_fetch(config, lat, lng, heading, output).await?;
        }
        Commands::Keys => {
            commands::handle_keys(config).await?;
        }
        Commands::Server { host, port } => {
            commands::handle_server(config, host, port).await?;
        }
    }

    Ok(())
}
