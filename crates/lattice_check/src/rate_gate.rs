//! Token-bucket throttle for streaming reads.

use std::time::Duration;

use tokio::time::Instant;

/// Throttles bytes read per replica. Credits refill continuously at the
/// configured rate and accumulate up to one burst window. A caller may
/// overdraw the bucket; the debt is paid before `acquire` returns, so the
/// next request waits instead of the one that already read its data.
pub struct RateGate {
    rate: f64,
    burst: f64,
    allowance: f64,
    last: Instant,
}

impl RateGate {
    /// A gate refilling at `rate_limit` bytes/sec with a burst window of
    /// `window_seconds`. A zero rate disables throttling.
    pub fn new(rate_limit: usize, window_seconds: f64) -> Self {
        let rate = rate_limit as f64;
        let burst = rate * window_seconds;
        Self {
            rate,
            burst,
            allowance: burst,
            last: Instant::now(),
        }
    }

    /// Debit `bytes` and suspend until the bucket is no longer overdrawn.
    pub async fn acquire(&mut self, bytes: usize) {
        if self.rate <= 0.0 {
            return;
        }
        let now = Instant::now();
        let refill = now.duration_since(self.last).as_secs_f64() * self.rate;
        self.allowance = (self.allowance + refill).min(self.burst);
        self.last = now;
        self.allowance -= bytes as f64;
        if self.allowance < 0.0 {
            let wait = Duration::from_secs_f64(-self.allowance / self.rate);
            tokio::time::sleep(wait).await;
            self.last = Instant::now();
            self.allowance = 0.0;
        }
    }
}
