//! Sequential batch download over many coordinates

use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::client::StreetViewClient;
use crate::core::errors::{FetchError, Result};
use crate::core::models::{
    BatchItem, BatchOutcome, BatchProgress, BatchReport, ItemRecord, LocationImages, StoredImage,
};
use crate::core::storage::{ImageStore, LocalImageStore};
use crate::core::transport::{ImageryTransport, ReqwestTransport};

/// Batch behaviour switches
#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    /// Skip items whose metadata record is already stored
    pub skip_existing: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            skip_existing: true,
        }
    }
}

/// Load batch items from a JSON or YAML list
pub fn load_batch_items<P: AsRef<Path>>(path: P) -> Result<Vec<BatchItem>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| FetchError::StorageError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let items = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
        _ => serde_json::from_str(&content)?,
    };
    Ok(items)
}

/// Drives a batch through the fetch client one item at a time.
///
/// Items are never fetched concurrently within a batch; several orchestrators
/// may share one key pool.
pub struct BatchOrchestrator<T = ReqwestTransport, S = LocalImageStore> {
    client: StreetViewClient<T>,
    store: Arc<S>,
    options: BatchOptions,
}

impl<T: ImageryTransport, S: ImageStore> BatchOrchestrator<T, S> {
    pub fn new(client: StreetViewClient<T>, store: Arc<S>, options: BatchOptions) -> Self {
        Self {
            client,
            store,
            options,
        }
    }

    /// Process `items` in order, reporting cumulative progress after each.
    ///
    /// Stops early on key exhaustion (`Halted`) or cancellation (`Cancelled`);
    /// neither marks the remaining items as failed.
    pub async fn run<F>(
        &self,
        items: &[BatchItem],
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> BatchReport
    where
        F: FnMut(&BatchProgress),
    {
        let mut progress = BatchProgress {
            total: items.len(),
            ..Default::default()
        };
        let mut outcome = BatchOutcome::Completed;

        info!("Starting batch of {} items", items.len());

        for item in items {
            if cancel.is_cancelled() {
                info!("Batch cancelled after {} items", progress.processed);
                outcome = BatchOutcome::Cancelled;
                break;
            }

            if self.options.skip_existing && self.store.exists(&item.metadata_path()).await {
                debug!("Skipping {}: already downloaded", item.id);
                progress.skipped += 1;
                on_progress(&progress);
                continue;
            }

            match self.client.fetch_location(item.lat, item.lng).await {
                Ok(images) => {
                    let halted = images.exhausted();
                    self.persist(item, images, &mut progress, !halted).await;
                    if halted {
                        outcome = BatchOutcome::Halted;
                        break;
                    }
                }
                Err(e) if e.is_exhaustion() => {
                    outcome = BatchOutcome::Halted;
                    break;
                }
                Err(FetchError::NoImageryAvailable) => {
                    debug!("No imagery for {}", item.id);
                    progress.failed += 1;
                    self.write_record(item, &LocationImages::default(), Vec::new()).await;
                }
                Err(e) => {
                    warn!("Item {} failed: {}", item.id, e);
                    progress.failed += 1;
                }
            }

            progress.processed += 1;
            on_progress(&progress);
        }

        if outcome == BatchOutcome::Halted {
            warn!(
                "All API keys exhausted: batch halted after {} of {} items; resume once keys recover",
                progress.processed, progress.total
            );
        }

        info!(
            "Batch {}: {} processed, {} images, {} failed, {} skipped",
            outcome, progress.processed, progress.succeeded, progress.failed, progress.skipped
        );

        BatchReport { outcome, progress }
    }

    /// Store fetched images; the item record is only written when complete
    async fn persist(
        &self,
        item: &BatchItem,
        images: LocationImages,
        progress: &mut BatchProgress,
        complete: bool,
    ) {
        progress.failed += images.failed_headings();

        let mut stored = Vec::with_capacity(images.images.len());
        let mut store_failures = 0;
        for image in &images.images {
            match self.store.put(&item.image_path(image.heading), image.bytes.clone()).await {
                Ok(url) => stored.push(StoredImage {
                    heading: image.heading,
                    url,
                }),
                Err(e) => {
                    error!("Failed to store {} heading {}: {}", item.id, image.heading, e);
                    store_failures += 1;
                }
            }
        }
        progress.succeeded += stored.len();
        progress.failed += store_failures;

        if complete && images.failures.is_empty() && store_failures == 0 {
            self.write_record(item, &images, stored).await;
        }
    }

    async fn write_record(&self, item: &BatchItem, images: &LocationImages, stored: Vec<StoredImage>) {
        let record = ItemRecord {
            id: item.id.clone(),
            lat: item.lat,
            lng: item.lng,
            pano_id: images.metadata.pano_id.clone(),
            capture_date: images.metadata.capture_date.clone(),
            images: stored,
            failed_headings: images.failures.iter().map(|f| f.heading).collect(),
        };

        let bytes = match serde_json::to_vec_pretty(&record) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode record for {}: {}", item.id, e);
                return;
            }
        };

        if let Err(e) = self.store.put(&item.metadata_path(), bytes).await {
            error!("Failed to store record for {}: {}", item.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::client::tests::{happy_upstream, jpeg, metadata_ok, test_config, METADATA_URL};
    use crate::core::key_pool::KeyPool;
    use crate::core::models::{Heading, KeyLimits};
    use crate::core::transport::scripted::{param, ScriptedTransport};
    use crate::core::transport::TransportResponse;

    fn items(n: usize) -> Vec<BatchItem> {
        (0..n)
            .map(|i| BatchItem::new(format!("item-{}", i), 51.0 + i as f64, -0.1).with_group("camden"))
            .collect()
    }

    fn orchestrator(
        pool: KeyPool,
        transport: ScriptedTransport,
        root: &Path,
    ) -> (BatchOrchestrator<ScriptedTransport>, Arc<LocalImageStore>) {
        let config = test_config(&["k1"]);
        let client = StreetViewClient::with_transport(config, pool, transport);
        let store = Arc::new(LocalImageStore::new(root));
        (
            BatchOrchestrator::new(client, store.clone(), BatchOptions::default()),
            store,
        )
    }

    #[tokio::test]
    async fn test_full_batch_stores_images_and_records() {
        let dir = tempfile::tempdir().unwrap();
        let pool = KeyPool::new(vec!["k1".into(), "k2".into()], KeyLimits::default());
        let (orchestrator, store) = orchestrator(pool, happy_upstream(), dir.path());

        let mut reports = Vec::new();
        let report = orchestrator
            .run(&items(2), &CancellationToken::new(), |p| reports.push(*p))
            .await;

        assert_eq!(report.outcome, BatchOutcome::Completed);
        assert_eq!(report.progress.processed, 2);
        assert_eq!(report.progress.succeeded, 8);
        assert_eq!(report.progress.failed, 0);
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].succeeded, 4);

        let item = &items(2)[1];
        assert_eq!(store.get(&item.image_path(Heading::WEST)).await.unwrap(), b"jpeg-270".to_vec());
        let record: ItemRecord =
            serde_json::from_slice(&store.get(&item.metadata_path()).await.unwrap()).unwrap();
        assert_eq!(record.images.len(), 4);
        assert_eq!(record.pano_id.as_deref(), Some("PANO1"));
    }

    #[tokio::test]
    async fn test_halts_when_keys_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        // One metadata call plus four images uses the whole daily budget
        let pool = KeyPool::new(
            vec!["k1".into()],
            KeyLimits {
                daily_limit: 5,
                ..Default::default()
            },
        );
        let transport = happy_upstream();
        let (orchestrator, _) = orchestrator(pool, transport.clone(), dir.path());

        let report = orchestrator.run(&items(3), &CancellationToken::new(), |_| {}).await;

        assert_eq!(report.outcome, BatchOutcome::Halted);
        assert_eq!(report.progress.processed, 1);
        assert_eq!(report.progress.failed, 0);
        assert_eq!(report.remaining(), 2);
        assert_eq!(transport.calls().len(), 5);
    }

    #[tokio::test]
    async fn test_halts_mid_item_keeping_downloaded_images() {
        let dir = tempfile::tempdir().unwrap();
        // Metadata plus two headings, then the key is spent
        let pool = KeyPool::new(
            vec!["k1".into()],
            KeyLimits {
                daily_limit: 3,
                ..Default::default()
            },
        );
        let transport = happy_upstream();
        let (orchestrator, store) = orchestrator(pool, transport.clone(), dir.path());

        let batch = items(2);
        let mut updates = 0;
        let report = orchestrator
            .run(&batch, &CancellationToken::new(), |_| updates += 1)
            .await;

        assert_eq!(report.outcome, BatchOutcome::Halted);
        assert_eq!(report.progress.succeeded, 2);
        assert_eq!(report.progress.processed, 0);
        assert_eq!(report.progress.failed, 0);
        assert_eq!(report.remaining(), 2);
        assert_eq!(updates, 0);
        assert_eq!(transport.calls().len(), 3);

        let item = &batch[0];
        assert!(store.exists(&item.image_path(Heading::NORTH)).await);
        assert!(store.exists(&item.image_path(Heading::EAST)).await);
        assert!(!store.exists(&item.image_path(Heading::SOUTH)).await);
        assert!(!store.exists(&item.metadata_path()).await);
    }

    #[tokio::test]
    async fn test_failed_headings_count_individually() {
        let dir = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new(|url, query| {
            if url == METADATA_URL {
                return Ok(metadata_ok());
            }
            match param(query, "heading") {
                Some("90") | Some("270") => Ok(TransportResponse::new(500, "")),
                Some(h) => Ok(jpeg(h)),
                None => Ok(TransportResponse::new(400, "")),
            }
        });
        let pool = KeyPool::new(vec!["k1".into()], KeyLimits::default());
        let (orchestrator, store) = orchestrator(pool, transport, dir.path());

        let batch = items(1);
        let report = orchestrator.run(&batch, &CancellationToken::new(), |_| {}).await;

        assert_eq!(report.progress.processed, 1);
        assert_eq!(report.progress.succeeded, 2);
        assert_eq!(report.progress.failed, 2);
        // Incomplete items stay eligible for a later resume
        assert!(!store.exists(&batch[0].metadata_path()).await);
    }

    #[tokio::test]
    async fn test_no_imagery_counts_failure_and_continues() {
        let dir = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport::new(|url, query| {
            if url == METADATA_URL {
                if param(query, "location").map_or(false, |l| l.starts_with("51,")) {
                    return Ok(TransportResponse::new(200, r#"{"status":"ZERO_RESULTS"}"#));
                }
                return Ok(metadata_ok());
            }
            Ok(jpeg(param(query, "heading").unwrap_or("?")))
        });
        let pool = KeyPool::new(vec!["k1".into()], KeyLimits::default());
        let (orchestrator, _) = orchestrator(pool, transport, dir.path());

        let report = orchestrator.run(&items(2), &CancellationToken::new(), |_| {}).await;

        assert_eq!(report.outcome, BatchOutcome::Completed);
        assert_eq!(report.progress.processed, 2);
        assert_eq!(report.progress.failed, 1);
        assert_eq!(report.progress.succeeded, 4);
    }

    #[tokio::test]
    async fn test_cancellation_between_items() {
        let dir = tempfile::tempdir().unwrap();
        let pool = KeyPool::new(vec!["k1".into()], KeyLimits::default());
        let (orchestrator, _) = orchestrator(pool, happy_upstream(), dir.path());

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let report = orchestrator
            .run(&items(3), &cancel, move |_| token.cancel())
            .await;

        assert_eq!(report.outcome, BatchOutcome::Cancelled);
        assert_eq!(report.progress.processed, 1);
    }

    #[tokio::test]
    async fn test_skips_items_already_stored() {
        let dir = tempfile::tempdir().unwrap();
        let pool = KeyPool::new(vec!["k1".into()], KeyLimits::default());
        let transport = happy_upstream();
        let (orchestrator, store) = orchestrator(pool, transport.clone(), dir.path());

        let batch = items(2);
        store.put(&batch[0].metadata_path(), b"{}".to_vec()).await.unwrap();

        let report = orchestrator.run(&batch, &CancellationToken::new(), |_| {}).await;

        assert_eq!(report.progress.skipped, 1);
        assert_eq!(report.progress.processed, 1);
        assert_eq!(report.remaining(), 0);
        assert_eq!(transport.calls().len(), 5);
    }

    #[test]
    fn test_load_batch_items_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.yaml");
        std::fs::write(
            &path,
            "- id: a\n  lat: 51.5\n  lng: -0.12\n  group: camden\n- id: b\n  lat: 52.0\n  lng: -1.0\n",
        )
        .unwrap();

        let items = load_batch_items(&path).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].group.as_deref(), Some("camden"));
        assert!(items[1].group.is_none());
    }
}
