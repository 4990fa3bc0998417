// src/retry.rs
use std::{fmt, future::Future, sync::Arc, time::Duration};

/// Default max amount of times to retry a registry query.
pub const RETRY_TIMES: usize = 5;

/// Default wait before each retry attempt.
pub const RETRY_WAIT: Duration = Duration::from_millis(100);

/// Backoff strategy: the wait before retry number `retry` (0-based), or `None`
/// once the budget is spent.
pub trait Backoff: Send + Sync + fmt::Debug {
    fn delay(&self, retry: usize) -> Option<Duration>;
}

/// Same wait before every retry.
#[derive(Debug, Clone, Copy)]
pub struct ConstantBackoff {
    pub times: usize,
    pub wait: Duration,
}

impl Backoff for ConstantBackoff {
    fn delay(&self, retry: usize) -> Option<Duration> {
        (retry < self.times).then_some(self.wait)
    }
}

/// Wait doubles with every retry, starting at `initial`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub times: usize,
    pub initial: Duration,
}

impl Backoff for ExponentialBackoff {
    fn delay(&self, retry: usize) -> Option<Duration> {
        if retry >= self.times {
            return None;
        }
        let factor = 1u32.checked_shl(retry as u32).unwrap_or(u32::MAX);
        Some(self.initial.saturating_mul(factor))
    }
}

/// Re-runs a fallible async operation according to a `Backoff`.
///
/// Holds no per-run state, so one `Retrier` can drive any number of
/// concurrent `run` calls.
#[derive(Debug, Clone)]
pub struct Retrier {
    backoff: Arc<dyn Backoff>,
}

impl Default for Retrier {
    fn default() -> Self {
        Retrier::constant(RETRY_TIMES, RETRY_WAIT)
    }
}

impl Retrier {
    pub fn new<B: Backoff + 'static>(backoff: B) -> Self {
        Retrier { backoff: Arc::new(backoff) }
    }

    pub fn constant(times: usize, wait: Duration) -> Self {
        Retrier::new(ConstantBackoff { times, wait })
    }

    pub fn exponential(times: usize, initial: Duration) -> Self {
        Retrier::new(ExponentialBackoff { times, initial })
    }

    /// Single attempt, no retries.
    pub fn never() -> Self {
        Retrier::constant(0, Duration::ZERO)
    }

    /// Run `op` until it succeeds or the backoff is exhausted, returning the
    /// first success or the last error.
    pub async fn run<F, Fut, T, E>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut retry = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => match self.backoff.delay(retry) {
                    Some(wait) => {
                        log::debug!("attempt {} failed, retrying in {:?}: {}", retry + 1, wait, err);
                        retry += 1;
                        tokio::time::sleep(wait).await;
                    }
                    None => return Err(err),
                },
            }
        }
    }
}
