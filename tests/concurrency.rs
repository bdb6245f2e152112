mod common;

use common::T0;
use gems_ratelimit::{InMemoryWindowStore, ManualClock, SlidingWindowLimiter};
use std::sync::Arc;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_checks_admit_exactly_limit() {
    let limiter = Arc::new(
        SlidingWindowLimiter::new(InMemoryWindowStore::new()).with_clock(ManualClock::new(T0)),
    );

    let mut handles = Vec::new();
    for _ in 0..200 {
        let limiter = limiter.clone();
        handles.push(tokio::spawn(async move {
            limiter.check("vote:burst", 30, 300_000).await.unwrap()
        }));
    }

    let mut allowed = 0;
    let mut remaining = Vec::new();
    for handle in handles {
        let result = handle.await.unwrap();
        if result.allowed {
            allowed += 1;
            remaining.push(result.remaining);
        }
    }
    assert_eq!(allowed, 30);
    remaining.sort_unstable();
    assert_eq!(remaining, (0..30).collect::<Vec<u32>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identifiers_are_independent() {
    let limiter = Arc::new(
        SlidingWindowLimiter::new(InMemoryWindowStore::new()).with_clock(ManualClock::new(T0)),
    );

    let mut handles = Vec::new();
    for user in 0..8 {
        for _ in 0..10 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                let id = format!("comment:user-{}", user);
                (user, limiter.check(&id, 5, 600_000).await.unwrap().allowed)
            }));
        }
    }

    let mut per_user = [0u32; 8];
    for handle in handles {
        let (user, allowed) = handle.await.unwrap();
        if allowed {
            per_user[user] += 1;
        }
    }
    assert!(per_user.iter().all(|&n| n == 5), "{:?}", per_user);
}
