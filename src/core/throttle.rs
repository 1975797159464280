//! Courtesy pacing applied before every outbound request

use std::time::Duration;
use tokio::time::sleep;

/// Fixed delay inserted before each upstream call
#[derive(Debug, Clone, Copy)]
pub struct Throttle {
    delay: Duration,
}

impl Throttle {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn from_millis(ms: u64) -> Self {
        Self::new(Duration::from_millis(ms))
    }

    /// Throttle that never waits
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Suspend the caller for the configured delay
    pub async fn throttle(&self) {
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::from_millis(10)
    }
}
