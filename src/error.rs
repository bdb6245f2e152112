//! Error types for the rate limiter.
//!
//! Two families live here:
//! - [`LimitError`]: caller mistakes (bad identifier, zero limit/window, bad config). These are
//!   the only errors a `check` ever returns.
//! - [`StoreFailure`]: a store round trip that failed or ran out of time. The limiter converts
//!   these into a fail-open result and never hands them to the caller.
use std::fmt;
use std::time::Duration;

/// Precondition and configuration errors surfaced to callers.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LimitError {
    /// The identifier was empty.
    #[error("rate limit identifier must not be empty")]
    EmptyIdentifier,
    /// `limit` was zero.
    #[error("rate limit must allow at least one action (got 0)")]
    ZeroLimit,
    /// `window_ms` was zero.
    #[error("rate limit window must be at least 1ms (got 0)")]
    ZeroWindow,
    /// Store call timeout was zero.
    #[error("store call timeout must be non-zero (got {0:?})")]
    InvalidTimeout(Duration),
    /// A configuration value could not be parsed.
    #[error("invalid rate limiter configuration: {0}")]
    Config(String),
}

impl LimitError {
    /// True for the argument checks `check` performs before touching the store.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::EmptyIdentifier | Self::ZeroLimit | Self::ZeroWindow)
    }
}

/// A store round trip that did not produce an answer.
#[derive(Debug, Clone)]
pub enum StoreFailure<E> {
    /// The call exceeded the configured timeout. Timeouts are never retried.
    Timeout { elapsed: Duration, timeout: Duration },
    /// The backend returned an error on every attempt.
    Backend { attempts: usize, error: E },
}

impl<E: fmt::Display> fmt::Display for StoreFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { elapsed, timeout } => {
                write!(f, "store call timed out after {:?} (limit: {:?})", elapsed, timeout)
            }
            Self::Backend { attempts, error } => {
                let plural = if *attempts == 1 { "" } else { "s" };
                write!(f, "store call failed after {} attempt{}: {}", attempts, plural, error)
            }
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for StoreFailure<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Backend { error, .. } => Some(error),
            Self::Timeout { .. } => None,
        }
    }
}

impl<E> StoreFailure<E> {
    /// Check if this failure is due to timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Number of attempts made before giving up.
    pub fn attempts(&self) -> usize {
        match self {
            Self::Timeout { .. } => 1,
            Self::Backend { attempts, .. } => *attempts,
        }
    }

    /// Borrow the backend error if present.
    pub fn backend_error(&self) -> Option<&E> {
        match self {
            Self::Backend { error, .. } => Some(error),
            Self::Timeout { .. } => None,
        }
    }

    /// Short machine-friendly label, used as a telemetry reason.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Backend { .. } => "backend",
        }
    }
}
