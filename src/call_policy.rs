//! Bounded store calls: one timeout per round trip, at most one retry.
//!
//! Semantics:
//! - Every attempt is wrapped in `tokio::time::timeout`. A timeout ends the call immediately;
//!   the caller is already late, so it is never retried.
//! - Backend errors may be retried once when `with_single_retry` is set. The delay before the
//!   retry goes through a [`Sleeper`] so tests run without real waits.
//! - The operation closure is invoked at most `max_attempts` times.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use gems_ratelimit::CallPolicy;
//!
//! let policy = CallPolicy::new(Duration::from_millis(250))
//!     .unwrap()
//!     .with_single_retry(Duration::from_millis(20));
//! assert_eq!(policy.max_attempts(), 2);
//! ```

use crate::error::{LimitError, StoreFailure};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Default per-call store timeout.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(500);

/// Abstraction for sleeping between attempts.
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Production sleeper using tokio runtime
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Test sleeper that returns immediately and remembers what it was asked to wait.
#[derive(Debug, Clone, Default)]
pub struct InstantSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl InstantSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Durations requested so far.
    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Sleeper for InstantSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(duration);
        Box::pin(async {})
    }
}

/// Timeout and retry rules applied to every store round trip.
#[derive(Clone)]
pub struct CallPolicy {
    timeout: Duration,
    max_attempts: usize,
    retry_delay: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for CallPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallPolicy")
            .field("timeout", &self.timeout)
            .field("max_attempts", &self.max_attempts)
            .field("retry_delay", &self.retry_delay)
            .field("sleeper", &"<sleeper>")
            .finish()
    }
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_STORE_TIMEOUT,
            max_attempts: 1,
            retry_delay: Duration::ZERO,
            sleeper: Arc::new(TokioSleeper),
        }
    }
}

impl CallPolicy {
    /// Single attempt bounded by `timeout`. Zero or unbounded timeouts are rejected.
    pub fn new(timeout: Duration) -> Result<Self, LimitError> {
        if timeout.is_zero() || timeout == Duration::MAX {
            return Err(LimitError::InvalidTimeout(timeout));
        }
        Ok(Self { timeout, ..Self::default() })
    }

    /// Allow one retry after `delay` when the backend reports an error.
    ///
    /// The retry sends the same admission member. If the first write landed and only its reply
    /// was lost, the store recognises the member and admits the caller, even when that entry
    /// took the last free slot.
    pub fn with_single_retry(mut self, delay: Duration) -> Self {
        self.max_attempts = 2;
        self.retry_delay = delay;
        self
    }

    /// Provide a custom sleeper implementation.
    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Total attempts (initial + retries); either 1 or 2.
    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Run `operation` under the policy.
    pub async fn execute<T, E, Fut, Op>(&self, mut operation: Op) -> Result<T, StoreFailure<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnMut() -> Fut,
    {
        let mut attempt = 1;
        loop {
            let start = Instant::now();
            match tokio::time::timeout(self.timeout, operation()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(error)) => {
                    if attempt >= self.max_attempts {
                        return Err(StoreFailure::Backend { attempts: attempt, error });
                    }
                }
                Err(_) => {
                    return Err(StoreFailure::Timeout {
                        elapsed: start.elapsed(),
                        timeout: self.timeout,
                    });
                }
            }
            tracing::debug!(attempt, delay = ?self.retry_delay, "retrying store call");
            self.sleeper.sleep(self.retry_delay).await;
            attempt += 1;
        }
    }
}
