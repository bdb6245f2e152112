use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Every this many `record` calls the in-memory store drops windows whose time-to-live has
/// elapsed.
pub const EXPIRED_SWEEP_INTERVAL: u64 = 256;

/// One atomic prune/count/append request.
///
/// The store must, as a single indivisible step:
/// 1. drop entries with timestamp `< now_ms - window_ms`,
/// 2. count the survivors,
/// 3. if `member` is already live, report it as admitted without appending;
/// 4. otherwise, if the count is below `limit`, insert `member` scored `now_ms` and set the
///    key's time-to-live to `window_ms`.
///
/// Step 3 makes a replayed admission (a retry after a lost reply) idempotent: the caller whose
/// entry already holds a slot is admitted, not rejected by its own entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub now_ms: u64,
    pub window_ms: u64,
    pub limit: u32,
    /// Unique per call; recording the same member twice must not add a second entry.
    pub member: String,
}

impl Admission {
    /// Entries scored strictly below this are expired.
    pub fn window_start(&self) -> u64 {
        self.now_ms.saturating_sub(self.window_ms)
    }
}

/// The store's answer to an [`Admission`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    /// Whether the member was appended, or was already live from an earlier attempt.
    pub admitted: bool,
    /// Live entries other than this member, before any append.
    pub prior_count: u32,
    /// Oldest live entry. Always set when the admission was refused.
    pub oldest_ms: Option<u64>,
}

/// Read-only view of a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowUsage {
    pub count: u32,
    pub oldest_ms: Option<u64>,
}

/// Abstract storage interface for sliding-window logs.
///
/// Backends shared between processes (e.g. Redis) must make [`WindowStore::record`] atomic on
/// the server side; otherwise concurrent callers can both see the last free slot.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Error type for storage operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Atomically prune, count and conditionally append.
    async fn record(&self, key: &str, admission: &Admission) -> Result<WindowSnapshot, Self::Error>;

    /// Count live entries in `[now_ms - window_ms, +inf)` without recording anything.
    async fn inspect(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> Result<WindowUsage, Self::Error>;

    /// Forget everything recorded under `key`.
    async fn clear(&self, key: &str) -> Result<(), Self::Error>;
}

#[async_trait]
impl<S> WindowStore for Arc<S>
where
    S: WindowStore + ?Sized,
{
    type Error = S::Error;

    async fn record(
        &self,
        key: &str,
        admission: &Admission,
    ) -> Result<WindowSnapshot, Self::Error> {
        (**self).record(key, admission).await
    }

    async fn inspect(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> Result<WindowUsage, Self::Error> {
        (**self).inspect(key, now_ms, window_ms).await
    }

    async fn clear(&self, key: &str) -> Result<(), Self::Error> {
        (**self).clear(key).await
    }
}

#[derive(Debug, Default)]
struct Window {
    // (timestamp, member); ordered by timestamp first.
    entries: BTreeSet<(u64, String)>,
    expires_at_ms: u64,
}

impl Window {
    fn prune(&mut self, window_start: u64) {
        self.entries = self.entries.split_off(&(window_start, String::new()));
    }

    fn oldest(&self) -> Option<u64> {
        self.entries.iter().next().map(|(ts, _)| *ts)
    }

    fn count(&self) -> u32 {
        u32::try_from(self.entries.len()).unwrap_or(u32::MAX)
    }
}

/// In-process window store.
///
/// One mutex guards every window, so `record` is atomic for all callers sharing this value.
/// Clones share state.
///
/// Windows whose time-to-live has elapsed are dropped lazily: by `inspect` for the key it
/// looks at, and by a sweep every [`EXPIRED_SWEEP_INTERVAL`] records.
#[derive(Default, Clone, Debug)]
pub struct InMemoryWindowStore {
    windows: Arc<Mutex<HashMap<String, Window>>>,
    records: Arc<AtomicU64>,
}

impl InMemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held, expired or not.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop windows whose time-to-live has elapsed. Returns how many were removed.
    pub fn purge_expired(&self, now_ms: u64) -> usize {
        purge(&mut self.lock(), now_ms)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Window>> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn purge(windows: &mut HashMap<String, Window>, now_ms: u64) -> usize {
    let before = windows.len();
    windows.retain(|_, w| w.expires_at_ms > now_ms);
    before - windows.len()
}

#[async_trait]
impl WindowStore for InMemoryWindowStore {
    type Error = std::convert::Infallible;

    async fn record(
        &self,
        key: &str,
        admission: &Admission,
    ) -> Result<WindowSnapshot, Self::Error> {
        let mut guard = self.lock();
        if self.records.fetch_add(1, Ordering::Relaxed) % EXPIRED_SWEEP_INTERVAL
            == EXPIRED_SWEEP_INTERVAL - 1
        {
            let removed = purge(&mut guard, admission.now_ms);
            if removed > 0 {
                tracing::debug!(
                    removed,
                    remaining = guard.len(),
                    "swept expired rate limit windows"
                );
            }
        }
        let window = guard.entry(key.to_string()).or_default();

        if window.expires_at_ms <= admission.now_ms {
            window.entries.clear();
        }
        window.prune(admission.window_start());

        if window.entries.contains(&(admission.now_ms, admission.member.clone())) {
            let prior_count = window.count().saturating_sub(1);
            return Ok(WindowSnapshot { admitted: true, prior_count, oldest_ms: window.oldest() });
        }

        let prior_count = window.count();
        if prior_count >= admission.limit {
            return Ok(WindowSnapshot { admitted: false, prior_count, oldest_ms: window.oldest() });
        }

        window.entries.insert((admission.now_ms, admission.member.clone()));
        window.expires_at_ms = admission.now_ms.saturating_add(admission.window_ms);
        Ok(WindowSnapshot { admitted: true, prior_count, oldest_ms: window.oldest() })
    }

    async fn inspect(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> Result<WindowUsage, Self::Error> {
        let mut guard = self.lock();
        if guard.get(key).is_some_and(|w| w.expires_at_ms <= now_ms) {
            guard.remove(key);
        }
        let Some(window) = guard.get(key) else {
            return Ok(WindowUsage::default());
        };
        let window_start = now_ms.saturating_sub(window_ms);
        let mut live = window.entries.range((window_start, String::new())..);
        let oldest_ms = live.next().map(|(ts, _)| *ts);
        let count = oldest_ms.map_or(0, |_| 1 + live.count());
        Ok(WindowUsage { count: u32::try_from(count).unwrap_or(u32::MAX), oldest_ms })
    }

    async fn clear(&self, key: &str) -> Result<(), Self::Error> {
        self.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admission(now_ms: u64, member: &str) -> Admission {
        Admission { now_ms, window_ms: 1_000, limit: 2, member: member.into() }
    }

    #[tokio::test]
    async fn appends_until_limit_then_refuses() {
        let store = InMemoryWindowStore::new();

        let first = store.record("k", &admission(10_000, "a")).await.unwrap();
        assert_eq!(
            first,
            WindowSnapshot { admitted: true, prior_count: 0, oldest_ms: Some(10_000) }
        );

        let second = store.record("k", &admission(10_100, "b")).await.unwrap();
        assert!(second.admitted);
        assert_eq!(second.prior_count, 1);

        let third = store.record("k", &admission(10_200, "c")).await.unwrap();
        assert_eq!(
            third,
            WindowSnapshot { admitted: false, prior_count: 2, oldest_ms: Some(10_000) }
        );
    }

    #[tokio::test]
    async fn prunes_entries_before_window_start() {
        let store = InMemoryWindowStore::new();
        store.record("k", &admission(10_000, "a")).await.unwrap();
        store.record("k", &admission(10_500, "b")).await.unwrap();

        // window_start = 10_400: "a" (10_000) is gone, "b" (10_500) survives.
        let snap = store.record("k", &admission(11_400, "c")).await.unwrap();
        assert!(snap.admitted);
        assert_eq!(snap.prior_count, 1);
        assert_eq!(snap.oldest_ms, Some(10_500));
    }

    #[tokio::test]
    async fn entry_exactly_at_window_start_still_counts() {
        let store = InMemoryWindowStore::new();
        store.record("k", &admission(10_000, "a")).await.unwrap();
        store.record("k", &admission(10_500, "b")).await.unwrap();
        let usage = store.inspect("k", 11_000, 1_000).await.unwrap();
        assert_eq!(usage, WindowUsage { count: 2, oldest_ms: Some(10_000) });
        let snap = store.record("k", &admission(11_000, "c")).await.unwrap();
        assert!(!snap.admitted);
        assert_eq!(snap.oldest_ms, Some(10_000));
    }

    #[tokio::test]
    async fn duplicate_member_does_not_double_count() {
        let store = InMemoryWindowStore::new();
        store.record("k", &admission(10_000, "same")).await.unwrap();
        let snap = store.record("k", &admission(10_000, "same")).await.unwrap();
        assert!(snap.admitted);
        assert_eq!(snap.prior_count, 0);
        let usage = store.inspect("k", 10_000, 1_000).await.unwrap();
        assert_eq!(usage.count, 1);
    }

    #[tokio::test]
    async fn inspect_is_read_only() {
        let store = InMemoryWindowStore::new();
        store.record("k", &admission(10_000, "a")).await.unwrap();
        let usage = store.inspect("k", 10_500, 1_000).await.unwrap();
        assert_eq!(usage, WindowUsage { count: 1, oldest_ms: Some(10_000) });
        assert_eq!(store.inspect("missing", 10_500, 1_000).await.unwrap(), WindowUsage::default());
        // entry falls out of a shorter window but is not removed by inspect
        assert_eq!(store.inspect("k", 10_900, 500).await.unwrap().count, 0);
        assert_eq!(store.len(), 1);
        assert_eq!(store.inspect("k", 10_900, 1_000).await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn inspect_drops_expired_window() {
        let store = InMemoryWindowStore::new();
        store.record("k", &admission(10_000, "a")).await.unwrap();
        assert_eq!(store.inspect("k", 11_000, 1_000).await.unwrap(), WindowUsage::default());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn replayed_member_holding_last_slot_is_admitted() {
        let store = InMemoryWindowStore::new();
        store.record("k", &admission(10_000, "a")).await.unwrap();
        let first = store.record("k", &admission(10_100, "b")).await.unwrap();
        assert_eq!(
            first,
            WindowSnapshot { admitted: true, prior_count: 1, oldest_ms: Some(10_000) }
        );

        // same admission again: the window is full, but only because of "b" itself
        let replay = store.record("k", &admission(10_100, "b")).await.unwrap();
        assert_eq!(replay, first);
        assert_eq!(store.inspect("k", 10_100, 1_000).await.unwrap().count, 2);

        let other = store.record("k", &admission(10_100, "c")).await.unwrap();
        assert!(!other.admitted);
    }

    #[tokio::test]
    async fn record_sweeps_expired_windows() {
        let store = InMemoryWindowStore::new();
        for i in 0..1_000 {
            store.record(&format!("ip-{}", i), &admission(10_000, "a")).await.unwrap();
        }
        assert_eq!(store.len(), 1_000);

        for n in 0..EXPIRED_SWEEP_INTERVAL {
            store.record("hot", &admission(3_600_000 + n, &format!("m{}", n))).await.unwrap();
        }
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn ttl_expires_whole_window() {
        let store = InMemoryWindowStore::new();
        store.record("a", &admission(10_000, "x")).await.unwrap();
        store.record("b", &admission(10_800, "y")).await.unwrap();
        assert_eq!(store.purge_expired(11_000), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.purge_expired(12_000), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn clear_removes_key() {
        let store = InMemoryWindowStore::new();
        store.record("k", &admission(10_000, "a")).await.unwrap();
        store.clear("k").await.unwrap();
        assert!(store.is_empty());
        store.clear("never-existed").await.unwrap();
    }

    #[test]
    fn window_start_saturates() {
        assert_eq!(admission(500, "a").window_start(), 0);
        assert_eq!(admission(1_500, "a").window_start(), 500);
    }
}
