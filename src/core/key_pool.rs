//! Multi-key usage tracking and round-robin selection

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::clock::{Clock, SystemClock};
use crate::core::config::FetcherConfig;
use crate::core::models::{key_prefix, KeyLimits, KeyRecord, PoolStatus};

#[derive(Debug, Default)]
struct PoolState {
    records: Vec<KeyRecord>,
    cursor: usize,
}

impl PoolState {
    fn reset_if_new_day(&mut self, now: chrono::DateTime<chrono::Utc>) {
        let today = now.date_naive();
        let mut rolled = 0;
        for record in &mut self.records {
            if record.reset_if_new_day(today) {
                rolled += 1;
            }
        }
        if rolled > 0 {
            info!("Daily counters reset for {} keys ({})", rolled, today);
        }
    }

    fn find_mut(&mut self, key: &str) -> Option<&mut KeyRecord> {
        self.records.iter_mut().find(|r| r.key() == key)
    }
}

/// Shared pool of API credentials.
///
/// Cloning yields another handle to the same pool; construct one per process
/// and hand it to every client and orchestrator.
#[derive(Debug, Clone)]
pub struct KeyPool {
    state: Arc<Mutex<PoolState>>,
    limits: Arc<KeyLimits>,
    clock: Arc<dyn Clock>,
}

impl KeyPool {
    /// Create a pool over the given credentials
    pub fn new(keys: Vec<String>, limits: KeyLimits) -> Self {
        Self::with_clock(keys, limits, Arc::new(SystemClock))
    }

    /// Create a pool reading time from `clock`
    pub fn with_clock(keys: Vec<String>, limits: KeyLimits, clock: Arc<dyn Clock>) -> Self {
        let today = clock.now().date_naive();
        let mut seen = HashSet::new();
        let records = keys
            .into_iter()
            .filter(|k| seen.insert(k.clone()))
            .map(|k| KeyRecord::new(k, today))
            .collect::<Vec<_>>();

        info!("Key pool initialised with {} keys", records.len());

        Self {
            state: Arc::new(Mutex::new(PoolState { records, cursor: 0 })),
            limits: Arc::new(limits),
            clock,
        }
    }

    /// Create from configuration
    pub fn from_config(config: &FetcherConfig) -> Self {
        Self::new(config.api_keys.clone(), config.key_limits())
    }

    pub fn limits(&self) -> &KeyLimits {
        &self.limits
    }

    /// Pick the next eligible key in round-robin order.
    ///
    /// Returns `None` when every key is exhausted, blocked or at its
    /// per-minute ceiling.
    pub async fn get_key(&self) -> Option<String> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.reset_if_new_day(now);

        let total = state.records.len();
        for _ in 0..total {
            let idx = state.cursor % total;
            state.cursor = (idx + 1) % total;

            let record = &mut state.records[idx];
            if record.check_eligible(now, &self.limits) {
                record.reserve(now);
                debug!("Selected key {}", record.prefix());
                return Some(record.key().to_string());
            }
        }

        warn!("No eligible API key among {} configured", total);
        None
    }

    /// Account for a completed request made with `key`
    pub async fn record_request(&self, key: &str, success: bool, status_code: u16) {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.reset_if_new_day(now);

        let Some(record) = state.find_mut(key) else {
            // Key was removed by a reload while the request was in flight
            debug!("Ignoring result for untracked key {}", key_prefix(key));
            return;
        };

        let was_exhausted = record.daily_limit_reached;
        record.record(now, success, status_code, &self.limits);

        if status_code == self.limits.denial_status {
            warn!(
                "Key {} denied (HTTP {}), {} consecutive failures",
                record.prefix(),
                status_code,
                record.consecutive_failures
            );
        } else {
            debug!(
                "Key {} recorded HTTP {} ({} today)",
                record.prefix(),
                status_code,
                record.requests_today
            );
        }

        if record.daily_limit_reached && !was_exhausted {
            warn!(
                "Key {} marked exhausted for today after {} requests",
                record.prefix(),
                record.requests_today
            );
        }
    }

    /// Clear failure state on the first key starting with `prefix`
    pub async fn force_reset(&self, prefix: &str) -> bool {
        if prefix.is_empty() {
            return false;
        }

        let mut state = self.state.lock().await;
        match state.records.iter_mut().find(|r| r.key().starts_with(prefix)) {
            Some(record) => {
                record.force_reset();
                info!("Key {} force reset", record.prefix());
                true
            }
            None => {
                info!("Force reset: no key matches prefix {}", key_prefix(prefix));
                false
            }
        }
    }

    /// Replace the tracked key set, preserving state for retained keys
    pub async fn reload(&self, new_keys: Vec<String>) {
        let today = self.clock.now().date_naive();
        let mut state = self.state.lock().await;

        let mut previous = std::mem::take(&mut state.records);
        let mut seen = HashSet::new();
        let mut added = 0;

        for key in new_keys {
            if !seen.insert(key.clone()) {
                continue;
            }
            match previous.iter().position(|r| r.key() == key) {
                Some(pos) => state.records.push(previous.swap_remove(pos)),
                None => {
                    state.records.push(KeyRecord::new(key, today));
                    added += 1;
                }
            }
        }

        let total = state.records.len();
        state.cursor = if total == 0 { 0 } else { state.cursor % total };

        info!(
            "Key pool reloaded: {} keys ({} added, {} removed)",
            total,
            added,
            previous.len()
        );
    }

    /// Current pool status with credentials redacted
    pub async fn status(&self) -> PoolStatus {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.reset_if_new_day(now);

        let keys = state
            .records
            .iter()
            .map(|r| r.summary(now, &self.limits))
            .collect::<Vec<_>>();

        PoolStatus {
            total_keys: keys.len(),
            available_keys: keys.iter().filter(|k| k.available).count(),
            keys,
        }
    }

    /// Number of tracked keys
    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use chrono::{Duration, TimeZone, Utc};

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn pool_with(names: &[&str], limits: KeyLimits) -> (KeyPool, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 3, 10, 0, 0).unwrap(),
        ));
        let pool = KeyPool::with_clock(keys(names), limits, clock.clone());
        (pool, clock)
    }

    async fn exhaust(pool: &KeyPool, key: &str) {
        for _ in 0..pool.limits().failure_threshold {
            pool.record_request(key, false, 403).await;
        }
    }

    #[tokio::test]
    async fn test_round_robin_fairness() {
        let (pool, _) = pool_with(&["k1", "k2", "k3"], KeyLimits::default());

        let mut picked = Vec::new();
        for _ in 0..3 {
            picked.push(pool.get_key().await.unwrap());
        }
        assert_eq!(picked, keys(&["k1", "k2", "k3"]));

        // Rotation continues in the same order
        assert_eq!(pool.get_key().await.unwrap(), "k1");
    }

    #[tokio::test]
    async fn test_daily_rollover_restores_exhausted_key() {
        let (pool, clock) = pool_with(&["k1"], KeyLimits::default());
        pool.record_request("k1", true, 200).await;
        exhaust(&pool, "k1").await;
        assert!(pool.get_key().await.is_none());

        clock.advance(Duration::days(1));
        assert_eq!(pool.get_key().await.as_deref(), Some("k1"));

        let status = pool.status().await;
        assert_eq!(status.keys[0].requests_today, 0);
        assert!(!status.keys[0].daily_limit_reached);
    }

    #[tokio::test]
    async fn test_all_exhausted_returns_none() {
        let (pool, _) = pool_with(&["k1", "k2", "k3"], KeyLimits::default());
        for k in ["k1", "k2", "k3"] {
            exhaust(&pool, k).await;
        }

        for _ in 0..10 {
            assert!(pool.get_key().await.is_none());
        }
        assert_eq!(pool.status().await.available_keys, 0);
    }

    #[tokio::test]
    async fn test_empty_pool_returns_none() {
        let (pool, _) = pool_with(&[], KeyLimits::default());
        assert!(pool.get_key().await.is_none());
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn test_consecutive_failure_threshold() {
        let (pool, clock) = pool_with(&["k1"], KeyLimits::default());

        for _ in 0..4 {
            pool.record_request("k1", false, 403).await;
        }
        let status = pool.status().await;
        assert!(status.keys[0].is_temporarily_blocked);
        assert!(!status.keys[0].daily_limit_reached);
        assert!(pool.get_key().await.is_none());

        clock.advance(Duration::seconds(60));
        let key = pool.get_key().await;
        assert_eq!(key.as_deref(), Some("k1"));

        pool.record_request("k1", false, 403).await;
        let status = pool.status().await;
        assert!(status.keys[0].daily_limit_reached);

        clock.advance(Duration::seconds(120));
        assert!(pool.get_key().await.is_none());
    }

    #[tokio::test]
    async fn test_success_resets_failure_streak() {
        let (pool, _) = pool_with(&["k1"], KeyLimits::default());
        for _ in 0..3 {
            pool.record_request("k1", false, 403).await;
        }
        assert_eq!(pool.status().await.keys[0].consecutive_failures, 3);

        pool.record_request("k1", true, 200).await;
        assert_eq!(pool.status().await.keys[0].consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_per_minute_ceiling() {
        let limits = KeyLimits {
            requests_per_minute: 3,
            ..Default::default()
        };
        let (pool, clock) = pool_with(&["k1"], limits);

        for _ in 0..3 {
            pool.record_request("k1", true, 200).await;
            clock.advance(Duration::seconds(5));
        }
        // Last request was at +10s
        assert!(pool.get_key().await.is_none());

        clock.advance(Duration::seconds(54));
        assert!(pool.get_key().await.is_none());

        clock.advance(Duration::seconds(1));
        assert_eq!(pool.get_key().await.as_deref(), Some("k1"));
    }

    #[tokio::test]
    async fn test_concurrent_selection_respects_ceiling() {
        let limits = KeyLimits {
            requests_per_minute: 2,
            ..Default::default()
        };
        let (pool, _) = pool_with(&["k1", "k2"], limits);

        let handles = (0..8)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.get_key().await })
            })
            .collect::<Vec<_>>();

        let mut selected = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                selected += 1;
            }
        }
        assert_eq!(selected, 4);
    }

    #[tokio::test]
    async fn test_unrecorded_selection_frees_slot_after_minute() {
        let limits = KeyLimits {
            requests_per_minute: 1,
            ..Default::default()
        };
        let (pool, clock) = pool_with(&["k1"], limits);

        // Selected but never recorded
        assert_eq!(pool.get_key().await.as_deref(), Some("k1"));
        assert!(pool.get_key().await.is_none());

        clock.advance(Duration::seconds(59));
        assert!(pool.get_key().await.is_none());

        clock.advance(Duration::seconds(1));
        assert_eq!(pool.get_key().await.as_deref(), Some("k1"));
    }

    #[tokio::test]
    async fn test_force_reset() {
        let (pool, _) = pool_with(&["AbCdEfGh12345", "other-key"], KeyLimits::default());
        exhaust(&pool, "AbCdEfGh12345").await;
        exhaust(&pool, "other-key").await;
        assert!(pool.get_key().await.is_none());

        assert!(!pool.force_reset("zzzz").await);
        assert!(pool.get_key().await.is_none());

        assert!(pool.force_reset("AbCdEfGh").await);
        assert_eq!(pool.get_key().await.as_deref(), Some("AbCdEfGh12345"));
        assert!(!pool.force_reset("").await);
    }

    #[tokio::test]
    async fn test_reload_preserves_retained_state() {
        let (pool, _) = pool_with(&["k1", "k2"], KeyLimits::default());
        pool.record_request("k1", true, 200).await;
        pool.record_request("k1", true, 200).await;

        pool.reload(keys(&["k1", "k3", "k3"])).await;

        let status = pool.status().await;
        assert_eq!(status.total_keys, 2);
        assert_eq!(status.keys[0].prefix, "k...");
        assert_eq!(status.keys[0].requests_today, 2);
        assert_eq!(status.keys[1].prefix, "k...");
        assert_eq!(status.keys[1].requests_today, 0);

        // Results for a removed key are ignored
        pool.record_request("k2", true, 200).await;
        assert_eq!(pool.len().await, 2);
    }

    #[tokio::test]
    async fn test_status_never_exposes_full_key() {
        let (pool, _) = pool_with(&["SECRETSECRETSECRET"], KeyLimits::default());
        let json = serde_json::to_string(&pool.status().await).unwrap();
        assert!(!json.contains("SECRETSECRETSECRET"));
        assert!(json.contains("SECRETSE..."));
    }
}
