//! Core data models for keys, imagery and batches

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::core::errors::FetchError;

/// Length of the rolling per-minute window
pub const MINUTE_WINDOW_SECS: i64 = 60;

/// Number of leading characters of a credential that may be shown
pub const KEY_PREFIX_LEN: usize = 8;

/// Redact a credential down to its displayable prefix.
///
/// Short credentials show at most half their characters.
pub fn key_prefix(key: &str) -> String {
    let shown = KEY_PREFIX_LEN.min(key.chars().count() / 2);
    let prefix: String = key.chars().take(shown).collect();
    format!("{}...", prefix)
}

/// Compass bearing of a directional capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Heading(pub u16);

impl Heading {
    pub const NORTH: Heading = Heading(0);
    pub const EAST: Heading = Heading(90);
    pub const SOUTH: Heading = Heading(180);
    pub const WEST: Heading = Heading(270);

    /// The four headings covering 360 degrees at a coordinate
    pub const STANDARD: [Heading; 4] = [Self::NORTH, Self::EAST, Self::SOUTH, Self::WEST];

    pub fn degrees(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for Heading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-key thresholds applied by the pool
#[derive(Debug, Clone)]
pub struct KeyLimits {
    pub requests_per_minute: u32,
    pub daily_limit: u32,
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub denial_status: u16,
}

impl Default for KeyLimits {
    fn default() -> Self {
        Self {
            requests_per_minute: 500,
            daily_limit: 25_000,
            failure_threshold: 5,
            cooldown: Duration::seconds(60),
            denial_status: 403,
        }
    }
}

/// Usage state of one configured credential
#[derive(Debug, Clone)]
pub struct KeyRecord {
    key: String,
    pub requests_today: u32,
    pub requests_this_minute: u32,
    pub last_request_time: Option<DateTime<Utc>>,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub is_temporarily_blocked: bool,
    pub daily_limit_reached: bool,
    pub consecutive_failures: u32,
    pub last_reset_date: NaiveDate,
    /// Selection times of requests handed out but not yet recorded
    reservations: VecDeque<DateTime<Utc>>,
}

impl KeyRecord {
    pub fn new(key: impl Into<String>, today: NaiveDate) -> Self {
        Self {
            key: key.into(),
            requests_today: 0,
            requests_this_minute: 0,
            last_request_time: None,
            last_failure_time: None,
            is_temporarily_blocked: false,
            daily_limit_reached: false,
            consecutive_failures: 0,
            last_reset_date: today,
            reservations: VecDeque::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn prefix(&self) -> String {
        key_prefix(&self.key)
    }

    /// Zero the daily state when the UTC date has moved on
    pub fn reset_if_new_day(&mut self, today: NaiveDate) -> bool {
        if today <= self.last_reset_date {
            return false;
        }
        self.requests_today = 0;
        self.daily_limit_reached = false;
        self.is_temporarily_blocked = false;
        self.consecutive_failures = 0;
        self.last_reset_date = today;
        true
    }

    /// Clear admin-resettable failure state
    pub fn force_reset(&mut self) {
        self.is_temporarily_blocked = false;
        self.daily_limit_reached = false;
        self.consecutive_failures = 0;
    }

    /// Requests selected but not yet recorded
    pub fn in_flight(&self) -> u32 {
        self.reservations.len() as u32
    }

    /// Hold a per-minute slot for a request about to be sent
    pub fn reserve(&mut self, now: DateTime<Utc>) {
        self.reservations.push_back(now);
    }

    /// Drop reservations older than the minute window.
    ///
    /// A request abandoned before it was recorded gives its slot back here.
    fn expire_reservations(&mut self, now: DateTime<Utc>) {
        let window = Duration::seconds(MINUTE_WINDOW_SECS);
        while let Some(&reserved) = self.reservations.front() {
            if now - reserved < window {
                break;
            }
            self.reservations.pop_front();
        }
    }

    fn minute_window_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.last_request_time
            .map(|last| now - last >= Duration::seconds(MINUTE_WINDOW_SECS))
            .unwrap_or(true)
    }

    fn cooldown_elapsed(&self, now: DateTime<Utc>, cooldown: Duration) -> bool {
        self.last_failure_time
            .map(|last| now - last >= cooldown)
            .unwrap_or(true)
    }

    /// Eligibility check that also rolls the minute window and lifts expired blocks
    pub fn check_eligible(&mut self, now: DateTime<Utc>, limits: &KeyLimits) -> bool {
        if self.daily_limit_reached {
            return false;
        }

        if self.is_temporarily_blocked {
            if !self.cooldown_elapsed(now, limits.cooldown) {
                return false;
            }
            self.is_temporarily_blocked = false;
        }

        if self.minute_window_elapsed(now) {
            self.requests_this_minute = 0;
        }
        self.expire_reservations(now);

        self.requests_this_minute + self.in_flight() < limits.requests_per_minute
    }

    /// Read-only view of availability (not blocked, not exhausted)
    pub fn is_available(&self, now: DateTime<Utc>, limits: &KeyLimits) -> bool {
        !self.daily_limit_reached
            && (!self.is_temporarily_blocked || self.cooldown_elapsed(now, limits.cooldown))
    }

    /// Account for one completed request
    pub fn record(&mut self, now: DateTime<Utc>, success: bool, status_code: u16, limits: &KeyLimits) {
        if self.minute_window_elapsed(now) {
            self.requests_this_minute = 0;
        }
        self.reservations.pop_front();
        self.requests_today = self.requests_today.saturating_add(1);
        self.requests_this_minute = self.requests_this_minute.saturating_add(1);
        self.last_request_time = Some(now);

        if status_code == limits.denial_status {
            self.consecutive_failures += 1;
            self.last_failure_time = Some(now);
            if self.consecutive_failures >= limits.failure_threshold {
                self.daily_limit_reached = true;
            } else {
                self.is_temporarily_blocked = true;
            }
        } else if success && status_code == 200 {
            self.consecutive_failures = 0;
            if self.requests_today >= limits.daily_limit {
                self.daily_limit_reached = true;
            }
        }
    }

    pub fn summary(&self, now: DateTime<Utc>, limits: &KeyLimits) -> KeyStatus {
        KeyStatus {
            prefix: self.prefix(),
            requests_today: self.requests_today,
            requests_this_minute: self.requests_this_minute,
            daily_limit: limits.daily_limit,
            consecutive_failures: self.consecutive_failures,
            is_temporarily_blocked: self.is_temporarily_blocked,
            daily_limit_reached: self.daily_limit_reached,
            available: self.is_available(now, limits),
            last_request_time: self.last_request_time,
            last_failure_time: self.last_failure_time,
        }
    }
}

/// Externally visible per-key summary, never carrying the full credential
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyStatus {
    pub prefix: String,
    pub requests_today: u32,
    pub requests_this_minute: u32,
    pub daily_limit: u32,
    pub consecutive_failures: u32,
    pub is_temporarily_blocked: bool,
    pub daily_limit_reached: bool,
    pub available: bool,
    pub last_request_time: Option<DateTime<Utc>>,
    pub last_failure_time: Option<DateTime<Utc>>,
}

/// Pool-wide status report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatus {
    pub total_keys: usize,
    pub available_keys: usize,
    pub keys: Vec<KeyStatus>,
}

/// Metadata lookup result for a coordinate
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub pano_id: Option<String>,
    pub capture_date: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

/// One successfully downloaded directional image
#[derive(Debug, Clone)]
pub struct HeadingImage {
    pub heading: Heading,
    pub bytes: Vec<u8>,
    pub capture_date: Option<String>,
    pub pano_id: Option<String>,
}

/// A heading that could not be downloaded
#[derive(Debug)]
pub struct HeadingFailure {
    pub heading: Heading,
    pub error: FetchError,
}

/// Everything fetched for one coordinate
#[derive(Debug, Default)]
pub struct LocationImages {
    pub metadata: ImageMetadata,
    pub images: Vec<HeadingImage>,
    pub failures: Vec<HeadingFailure>,
}

impl LocationImages {
    /// Whether a heading was abandoned because the pool ran dry
    pub fn exhausted(&self) -> bool {
        self.failures.iter().any(|f| f.error.is_exhaustion())
    }

    /// Headings that failed for per-item reasons
    pub fn failed_headings(&self) -> usize {
        self.failures
            .iter()
            .filter(|f| f.error.counts_as_failure())
            .count()
    }
}

/// One coordinate to process in a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub id: String,
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub group: Option<String>,
}

impl BatchItem {
    pub fn new(id: impl Into<String>, lat: f64, lng: f64) -> Self {
        Self {
            id: id.into(),
            lat,
            lng,
            group: None,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Storage directory for this item's files
    pub fn storage_dir(&self) -> String {
        format!("{}/{}", self.group.as_deref().unwrap_or("ungrouped"), self.id)
    }

    pub fn image_path(&self, heading: Heading) -> String {
        format!("{}/{}.jpg", self.storage_dir(), heading)
    }

    pub fn metadata_path(&self) -> String {
        format!("{}/metadata.json", self.storage_dir())
    }
}

/// Cumulative batch counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// How a batch run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutcome {
    Completed,
    /// Stopped early because no key was eligible
    Halted,
    Cancelled,
}

impl fmt::Display for BatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchOutcome::Completed => write!(f, "completed"),
            BatchOutcome::Halted => write!(f, "halted"),
            BatchOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Final report of a batch run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub outcome: BatchOutcome,
    pub progress: BatchProgress,
}

impl BatchReport {
    /// Items neither processed nor skipped
    pub fn remaining(&self) -> usize {
        self.progress
            .total
            .saturating_sub(self.progress.processed + self.progress.skipped)
    }
}

/// Record written next to an item's images
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: String,
    pub lat: f64,
    pub lng: f64,
    pub pano_id: Option<String>,
    pub capture_date: Option<String>,
    pub images: Vec<StoredImage>,
    pub failed_headings: Vec<Heading>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredImage {
    pub heading: Heading,
    pub url: String,
}
