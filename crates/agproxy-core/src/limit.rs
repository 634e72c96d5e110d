use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Enforces a minimum spacing between upstream requests, so retry bursts
/// cannot trip the upstream's burst throttling.
pub struct MinIntervalLimiter {
    min_interval: Duration,
    next_allowed: Mutex<Instant>,
}

impl MinIntervalLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_allowed: Mutex::new(Instant::now()),
        }
    }

    pub async fn wait(&self) {
        if self.min_interval.is_zero() {
            return;
        }
        let mut next_allowed = self.next_allowed.lock().await;
        let now = Instant::now();
        if now < *next_allowed {
            let wait = *next_allowed - now;
            tokio::time::sleep(wait).await;
        }
        *next_allowed = Instant::now() + self.min_interval;
    }
}
