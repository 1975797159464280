//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::core::models::KeyLimits;

const DEFAULT_METADATA_ENDPOINT: &str = "https://maps.googleapis.com/maps/api/streetview/metadata";
const DEFAULT_IMAGE_ENDPOINT: &str = "https://maps.googleapis.com/maps/api/streetview";

/// Configuration for the key pool, fetch client and storage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    pub api_keys: Vec<String>,
    pub requests_per_minute: u32,
    pub daily_limit: u32,
    pub request_delay_ms: u64,
    pub timeout_ms: u64,
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    pub denial_status: u16,
    pub metadata_endpoint: String,
    pub image_endpoint: String,
    pub image_size: String,
    pub pitch: i32,
    pub fov: u32,
    pub storage_root: PathBuf,
    pub storage_base_url: Option<String>,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            api_keys: vec![],
            requests_per_minute: 500,
            daily_limit: 25_000,
            request_delay_ms: 10,
            timeout_ms: 30_000,
            failure_threshold: 5,
            cooldown_secs: 60,
            denial_status: 403,
            metadata_endpoint: DEFAULT_METADATA_ENDPOINT.to_string(),
            image_endpoint: DEFAULT_IMAGE_ENDPOINT.to_string(),
            image_size: "640x640".to_string(),
            pitch: 0,
            fov: 90,
            storage_root: PathBuf::from("./imagery"),
            storage_base_url: None,
        }
    }
}

/// Split a comma separated credential list, dropping blanks and duplicates
pub fn parse_key_list(raw: &str) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for key in raw.split(',').map(str::trim).filter(|k| !k.is_empty()) {
        if !keys.iter().any(|k| k == key) {
            keys.push(key.to_string());
        }
    }
    keys
}

/// Read the configured credentials from the environment
pub fn load_keys_from_env() -> Vec<String> {
    if let Ok(raw) = std::env::var("STREETVIEW_API_KEYS") {
        let keys = parse_key_list(&raw);
        if !keys.is_empty() {
            return keys;
        }
    }

    std::env::var("STREETVIEW_API_KEY")
        .map(|k| parse_key_list(&k))
        .unwrap_or_default()
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{} is invalid: {}", name, e)),
        Err(_) => Ok(default),
    }
}

impl FetcherConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let api_keys = load_keys_from_env();
        if api_keys.is_empty() {
            return Err(anyhow::anyhow!(
                "STREETVIEW_API_KEYS or STREETVIEW_API_KEY environment variable is required"
            ));
        }

        let config = Self {
            api_keys,
            requests_per_minute: env_or("STREETVIEW_RPM", defaults.requests_per_minute)?,
            daily_limit: env_or("STREETVIEW_DAILY_LIMIT", defaults.daily_limit)?,
            request_delay_ms: env_or("STREETVIEW_REQUEST_DELAY_MS", defaults.request_delay_ms)?,
            timeout_ms: env_or("STREETVIEW_TIMEOUT_MS", defaults.timeout_ms)?,
            failure_threshold: env_or("STREETVIEW_FAILURE_THRESHOLD", defaults.failure_threshold)?,
            cooldown_secs: env_or("STREETVIEW_COOLDOWN_SECS", defaults.cooldown_secs)?,
            metadata_endpoint: std::env::var("STREETVIEW_METADATA_URL")
                .unwrap_or(defaults.metadata_endpoint),
            image_endpoint: std::env::var("STREETVIEW_IMAGE_URL").unwrap_or(defaults.image_endpoint),
            storage_root: std::env::var("IMAGERY_STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_root),
            storage_base_url: std::env::var("IMAGERY_BASE_URL").ok(),
            ..defaults
        };

        info!("Loaded {} API keys from environment", config.api_keys.len());
        Ok(config)
    }

    /// Load from a JSON or YAML file, picked by extension
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            _ => serde_json::from_str(&content)?,
        };
        Ok(config)
    }

    /// Load a file, falling back to the environment for credentials
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let mut config = Self::from_file(path)?;
                if config.api_keys.is_empty() {
                    config.api_keys = load_keys_from_env();
                }
                Ok(config)
            }
            None => Self::from_env(),
        }
    }

    /// Save configuration to file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_keys.is_empty() {
            return Err(anyhow::anyhow!("At least one API key is required"));
        }

        if self.metadata_endpoint.is_empty() || self.image_endpoint.is_empty() {
            return Err(anyhow::anyhow!("API endpoints are required"));
        }

        if self.requests_per_minute == 0 {
            return Err(anyhow::anyhow!("requests_per_minute must be greater than 0"));
        }

        if self.daily_limit == 0 {
            return Err(anyhow::anyhow!("daily_limit must be greater than 0"));
        }

        if self.failure_threshold == 0 {
            return Err(anyhow::anyhow!("failure_threshold must be greater than 0"));
        }

        if self.request_delay_ms == 0 {
            warn!("request_delay_ms is 0, requests will not be paced");
        }

        Ok(())
    }

    /// Per-key thresholds for the pool
    pub fn key_limits(&self) -> KeyLimits {
        KeyLimits {
            requests_per_minute: self.requests_per_minute,
            daily_limit: self.daily_limit,
            failure_threshold: self.failure_threshold,
            cooldown: chrono::Duration::seconds(self.cooldown_secs as i64),
            denial_status: self.denial_status,
        }
    }
}
