//! Bounded fixed-delay polling
//!
//! Every wait in the provisioning flow (propagation checks, authorization
//! polling, certificate download) goes through [`RetryPolicy::poll`] so the
//! attempt budget is enforced in one place. Sleeping is delegated to a
//! [`Sleeper`] so tests can run the loops without waiting on a real clock.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

/// Something that can wait for a duration
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeper backed by the tokio timer
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Fixed number of attempts with a fixed delay between them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of probes, including the first one
    pub attempts: u32,
    /// Delay between two consecutive probes
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// Run `probe` until it yields `Some`, at most `attempts` times.
    ///
    /// The probe receives the 1-based attempt number. There is no delay
    /// before the first probe and none after the last one, so a policy of
    /// `n` attempts sleeps exactly `n - 1` times when every probe misses.
    /// Returns `None` once the budget is spent.
    pub async fn poll<T, F, Fut>(&self, sleeper: &dyn Sleeper, mut probe: F) -> Option<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        for attempt in 1..=self.attempts {
            if let Some(value) = probe(attempt).await {
                return Some(value);
            }

            if attempt < self.attempts {
                trace!(attempt, delay_ms = self.delay.as_millis() as u64, "Probe missed, retrying");
                sleeper.sleep(self.delay).await;
            }
        }

        None
    }
}
