//! Byte storage keyed by logical path

use std::future::Future;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::core::errors::{FetchError, Result};

/// Put/get of raw bytes under a path string
pub trait ImageStore: Send + Sync {
    /// Store bytes and return a URL they can be retrieved from
    fn put(&self, path: &str, bytes: Vec<u8>) -> impl Future<Output = Result<String>> + Send;

    fn get(&self, path: &str) -> impl Future<Output = Result<Vec<u8>>> + Send;

    fn exists(&self, path: &str) -> impl Future<Output = bool> + Send;
}

/// Filesystem-backed store rooted at a directory
#[derive(Debug, Clone)]
pub struct LocalImageStore {
    root: PathBuf,
    base_url: Option<String>,
}

impl LocalImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            base_url: None,
        }
    }

    /// Serve stored files from `base_url` instead of `file://` URLs
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into().trim_end_matches('/').to_string());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));

        if path.is_empty() || !safe {
            return Err(FetchError::StorageError {
                path: path.to_string(),
                message: "path must be relative and must not traverse".to_string(),
            });
        }

        Ok(self.root.join(relative))
    }

    fn url_for(&self, path: &str, full: &Path) -> String {
        match &self.base_url {
            Some(base) => format!("{}/{}", base, path),
            None => format!("file://{}", full.display()),
        }
    }
}

impl ImageStore for LocalImageStore {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<String> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, &bytes).await?;
        debug!("Stored {} bytes at {}", bytes.len(), full.display());
        Ok(self.url_for(path, &full))
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(path)?;
        tokio::fs::read(&full)
            .await
            .map_err(|e| FetchError::StorageError {
                path: path.to_string(),
                message: e.to_string(),
            })
    }

    async fn exists(&self, path: &str) -> bool {
        match self.resolve(path) {
            Ok(full) => tokio::fs::try_exists(full).await.unwrap_or(false),
            Err(_) => false,
        }
    }
}
