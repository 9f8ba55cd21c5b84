//! Global spacing of outbound calls to the live upstream API.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Serializes outbound calls so that consecutive requests are at least
/// `min_spacing` apart, no matter how many resolver calls are in flight.
/// The next free slot is reserved under the lock; only the sleep happens
/// outside it.
pub struct RateLimiter {
    min_spacing: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_spacing: Duration) -> Self {
        Self {
            min_spacing,
            next_slot: Mutex::new(None),
        }
    }

    /// Wait until this caller's reserved slot arrives.
    pub async fn acquire(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(at) if at > now => at,
                _ => now,
            };
            *next = Some(slot + self.min_spacing);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_sequential_calls_are_spaced() {
        let limiter = RateLimiter::new(Duration::from_millis(50));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_the_budget() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(40)));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // three callers need at least two full spacings between them
        assert!(start.elapsed() >= Duration::from_millis(80));
    }
}
