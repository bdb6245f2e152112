//! Prometheus metrics sink for `gems-ratelimit`.
//! Bring your own `prometheus::Registry`; one counter vector is registered and incremented per
//! limiter decision, labelled by identifier category (`search`, `comment`, ...) and outcome.
//!
//! Identifiers themselves are never used as labels: they carry client addresses and user ids.

use gems_ratelimit::telemetry::{LimiterEvent, TelemetrySink};
use prometheus::{IntCounterVec, Opts, Registry};
use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::Arc;
use std::task::{Context, Poll};

/// Name of the registered counter vector.
pub const EVENTS_TOTAL: &str = "gems_ratelimit_events_total";

#[derive(Clone, Debug)]
pub struct PrometheusSink {
    registry: Arc<Registry>,
    counter: IntCounterVec,
}

impl PrometheusSink {
    /// Create a sink and register counters into the provided registry.
    ///
    /// # Errors
    /// Returns an error if the metric cannot be registered (e.g. name conflict).
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self, prometheus::Error> {
        let registry = registry.into();
        let counter = IntCounterVec::new(
            Opts::new(EVENTS_TOTAL, "Rate limit decisions by category and outcome"),
            &["category", "outcome"],
        )?;
        registry.register(Box::new(counter.clone()))?;
        tracing::debug!(metric = EVENTS_TOTAL, "registered rate limit counters");
        Ok(Self { registry, counter })
    }

    /// Expose the registry for HTTP scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Current count for one label pair.
    pub fn count(&self, category: &str, outcome: &str) -> u64 {
        self.counter.with_label_values(&[category, outcome]).get()
    }
}

impl tower_service::Service<LimiterEvent> for PrometheusSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LimiterEvent) -> Self::Future {
        self.counter.with_label_values(&[event.category(), event.outcome()]).inc();
        ready(Ok(()))
    }
}

impl TelemetrySink for PrometheusSink {
    type SinkError = Infallible;
}
