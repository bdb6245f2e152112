//! Telemetry for limiter decisions.
//!
//! Every `check` emits one [`LimiterEvent`] into a [`TelemetrySink`]. Sinks are plain
//! `tower::Service<LimiterEvent>` values, so they compose with standard tower combinators and
//! with the companion crates (e.g. `gems-ratelimit-prometheus`).
//!
//! Fail-open decisions are the interesting ones for error reporting: they are the only place
//! store outages become visible, since `check` itself never returns them.
//!
//! ```rust
//! use gems_ratelimit::telemetry::{LimiterEvent, MemorySink};
//! use tower::Service;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut sink = MemorySink::new();
//! let event = LimiterEvent::Rejected {
//!     identifier: "comment:user-42".into(),
//!     limit: 5,
//!     reset_seconds: 120,
//! };
//! sink.call(event.clone()).await.unwrap();
//! assert_eq!(sink.events(), vec![event]);
//! # }
//! ```

use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::future::{ready, Ready};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tower_service::Service;

/// A telemetry sink that consumes limiter events.
pub trait TelemetrySink:
    Service<LimiterEvent, Response = (), Error = Self::SinkError> + Clone + Send + Sync + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
///
/// Telemetry must never change a rate limit decision: a sink that is not ready or fails simply
/// loses the event.
pub async fn emit_best_effort<S>(sink: S, event: LimiterEvent)
where
    S: Service<LimiterEvent, Response = ()> + Send + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// Outcome of a single `check`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimiterEvent {
    /// The store recorded the action.
    Admitted { identifier: String, limit: u32, remaining: u32 },
    /// The window was full.
    Rejected { identifier: String, limit: u32, reset_seconds: u64 },
    /// No store configured; admitted without counting.
    PassThrough { identifier: String },
    /// The store failed or timed out; admitted without counting.
    FailedOpen {
        identifier: String,
        /// `"timeout"` or `"backend"`.
        kind: &'static str,
        /// Rendered store error.
        error: String,
    },
}

impl LimiterEvent {
    pub fn identifier(&self) -> &str {
        match self {
            Self::Admitted { identifier, .. }
            | Self::Rejected { identifier, .. }
            | Self::PassThrough { identifier }
            | Self::FailedOpen { identifier, .. } => identifier,
        }
    }

    /// Category tag in front of the first `:` (`"search:1.2.3.4"` -> `"search"`), or
    /// `"default"` for untagged identifiers.
    pub fn category(&self) -> &str {
        match self.identifier().split_once(':') {
            Some((tag, _)) if !tag.is_empty() => tag,
            _ => "default",
        }
    }

    /// Stable outcome label.
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Admitted { .. } => "admitted",
            Self::Rejected { .. } => "rejected",
            Self::PassThrough { .. } => "pass_through",
            Self::FailedOpen { .. } => "failed_open",
        }
    }
}

impl fmt::Display for LimiterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Admitted { identifier, limit, remaining } => {
                write!(f, "Admitted({}, remaining={}/{})", identifier, remaining, limit)
            }
            Self::Rejected { identifier, limit, reset_seconds } => {
                write!(f, "Rejected({}, limit={}, reset={}s)", identifier, limit, reset_seconds)
            }
            Self::PassThrough { identifier } => write!(f, "PassThrough({})", identifier),
            Self::FailedOpen { identifier, kind, error } => {
                write!(f, "FailedOpen({}, {}: {})", identifier, kind, error)
            }
        }
    }
}

/// A no-op telemetry sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<LimiterEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: LimiterEvent) -> Self::Future {
        ready(Ok(()))
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Logs events through `tracing`. Fail-open events are logged at WARN, the rest at DEBUG.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<LimiterEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LimiterEvent) -> Self::Future {
        match &event {
            LimiterEvent::FailedOpen { .. } => {
                tracing::warn!(event = %event, category = event.category(), "rate_limit_event")
            }
            _ => tracing::debug!(event = %event, category = event.category(), "rate_limit_event"),
        }
        ready(Ok(()))
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Stores events in memory, evicting the oldest beyond `capacity`.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<LimiterEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Creates a bounded memory sink (default cap: 10,000).
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    /// Creates a bounded memory sink with explicit capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns a snapshot of all events received so far.
    pub fn events(&self) -> Vec<LimiterEvent> {
        self.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Returns the number of evicted events.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<LimiterEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<LimiterEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LimiterEvent) -> Self::Future {
        let mut events = self.lock();
        if events.len() >= self.capacity {
            events.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        events.push_back(event);
        ready(Ok(()))
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admitted(id: &str) -> LimiterEvent {
        LimiterEvent::Admitted { identifier: id.into(), limit: 3, remaining: 2 }
    }

    #[test]
    fn category_from_prefix() {
        assert_eq!(admitted("search:203.0.113.5").category(), "search");
        assert_eq!(admitted("vote:user:9").category(), "vote");
        assert_eq!(admitted("203.0.113.5").category(), "default");
        assert_eq!(admitted(":odd").category(), "default");
    }

    #[test]
    fn display_and_outcome() {
        let e = LimiterEvent::FailedOpen {
            identifier: "api:x".into(),
            kind: "timeout",
            error: "store call timed out".into(),
        };
        assert_eq!(e.outcome(), "failed_open");
        assert!(e.to_string().contains("timeout"));
        assert_eq!(admitted("a").to_string(), "Admitted(a, remaining=2/3)");
        assert_eq!(LimiterEvent::PassThrough { identifier: "p".into() }.outcome(), "pass_through");
    }

    #[tokio::test]
    async fn memory_sink_evicts_oldest() {
        let sink = MemorySink::with_capacity(2);
        for id in ["a", "b", "c"] {
            emit_best_effort(sink.clone(), admitted(id)).await;
        }
        let ids: Vec<_> = sink.events().iter().map(|e| e.identifier().to_string()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(sink.evicted(), 1);
        sink.clear();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn null_and_log_sinks_accept_events() {
        emit_best_effort(NullSink, admitted("a")).await;
        emit_best_effort(LogSink, admitted("a")).await;
    }
}
