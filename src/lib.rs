//! Street View Fetcher - multi-key rate-limited imagery download library
//!
//! This library shares a pool of upstream API keys between any number of
//! fetch clients and batch jobs, with per-key rate tracking, failover on
//! denial and resumable sequential batch downloads.

#![forbid(unsafe_code)]

pub mod core;
pub mod processors;
pub mod server;
pub mod cli;

// Re-export key types for convenience
pub use crate::core::{
    client::StreetViewClient,
    config::FetcherConfig,
    errors::FetchError,
    key_pool::KeyPool,
    models::{BatchItem, BatchOutcome, BatchProgress, BatchReport, Heading, PoolStatus},
    storage::{ImageStore, LocalImageStore},
};

pub use crate::processors::batch::{BatchOptions, BatchOrchestrator};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
