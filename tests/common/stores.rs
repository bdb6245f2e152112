//! Store fakes for exercising the limiter's failure paths.
#![allow(dead_code)]

use async_trait::async_trait;
use gems_ratelimit::rate_limit::{Admission, WindowSnapshot, WindowStore, WindowUsage};
use gems_ratelimit::InMemoryWindowStore;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreDown;

impl fmt::Display for StoreDown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection refused")
    }
}

impl std::error::Error for StoreDown {}

/// Wraps an in-memory store and fails the first `failures` calls. Counts every call.
///
/// With `losing_replies` the first records reach the inner store and only the reply is lost.
#[derive(Clone, Default)]
pub struct FlakyStore {
    inner: InMemoryWindowStore,
    failures: Arc<AtomicUsize>,
    lost_replies: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
}

impl FlakyStore {
    pub fn failing(failures: usize) -> Self {
        Self { failures: Arc::new(AtomicUsize::new(failures)), ..Self::default() }
    }

    /// The first `lost` records are applied, then reported as failed.
    pub fn losing_replies(lost: usize) -> Self {
        Self { lost_replies: Arc::new(AtomicUsize::new(lost)), ..Self::default() }
    }

    /// Fails forever.
    pub fn down() -> Self {
        Self::failing(usize::MAX)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &InMemoryWindowStore {
        &self.inner
    }

    fn should_fail(&self) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        take_one(&self.failures)
    }
}

#[async_trait]
impl WindowStore for FlakyStore {
    type Error = StoreDown;

    async fn record(&self, key: &str, admission: &Admission) -> Result<WindowSnapshot, StoreDown> {
        if self.should_fail() {
            return Err(StoreDown);
        }
        let snapshot =
            self.inner.record(key, admission).await.unwrap_or_else(|never| match never {});
        if take_one(&self.lost_replies) {
            return Err(StoreDown);
        }
        Ok(snapshot)
    }

    async fn inspect(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> Result<WindowUsage, StoreDown> {
        if self.should_fail() {
            return Err(StoreDown);
        }
        Ok(self.inner.inspect(key, now_ms, window_ms).await.unwrap_or_else(|never| match never {}))
    }

    async fn clear(&self, key: &str) -> Result<(), StoreDown> {
        if self.should_fail() {
            return Err(StoreDown);
        }
        Ok(self.inner.clear(key).await.unwrap_or_else(|never| match never {}))
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
}

/// Never answers within any reasonable timeout.
#[derive(Clone, Default)]
pub struct HangingStore {
    calls: Arc<AtomicUsize>,
}

impl HangingStore {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WindowStore for HangingStore {
    type Error = StoreDown;

    async fn record(
        &self,
        _key: &str,
        _admission: &Admission,
    ) -> Result<WindowSnapshot, StoreDown> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(StoreDown)
    }

    async fn inspect(
        &self,
        _key: &str,
        _now_ms: u64,
        _window_ms: u64,
    ) -> Result<WindowUsage, StoreDown> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(StoreDown)
    }

    async fn clear(&self, _key: &str) -> Result<(), StoreDown> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(StoreDown)
    }
}
