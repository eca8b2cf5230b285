use tokio::sync::Mutex;
use tokio::time::{self, Duration, Instant};

/// Minimum delay between two outbound requests.
///
/// The gate is a single lock held across the sleep, so every clone of an `Arc<RateLimiter>`
/// shares one global pace no matter how many workers call [`wait`](RateLimiter::wait).
#[derive(Debug)]
pub struct RateLimiter {
    delay: Duration,
    last: Mutex<Option<Instant>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DELAY)
    }
}

impl RateLimiter {
    pub const DEFAULT_DELAY: Duration = Duration::from_secs(1);

    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            last: Mutex::new(None),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Returns no sooner than `delay` after the previous call returned
    pub async fn wait(&self) {
        let mut last = self.last.lock().await;

        if let Some(prev) = *last {
            let ready_at = prev + self.delay;
            if ready_at > Instant::now() {
                tracing::trace!("rate limited for {:?}", ready_at - Instant::now());
                time::sleep_until(ready_at).await;
            }
        }

        *last = Some(Instant::now());
    }
}
