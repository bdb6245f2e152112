#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # gems-ratelimit
//!
//! Sliding-window rate limiting for the Gems of India services: searches, comments, votes and
//! API calls are capped per identifier over a trailing window, with the window log kept in a
//! shared sorted-set store so every instance enforces the same quota.
//!
//! ## Features
//!
//! - **Sliding-window log** limiter with an atomic prune/count/append per check
//! - **Fail-open** on store outages and **pass-through** when no store is configured
//! - **Bounded store calls**: per-call timeout, at most one retry
//! - **Typed route table** (`search`, `api`, `comment`, `vote`) loaded from serde or env
//! - **Tower middleware** that turns rejections into `Retry-After`-ready errors
//! - **Telemetry sinks** for decisions, including fail-open events
//!
//! ## Quick Start
//!
//! ```rust
//! use gems_ratelimit::{InMemoryWindowStore, SlidingWindowLimiter};
//!
//! #[tokio::main]
//! async fn main() {
//!     let limiter = SlidingWindowLimiter::new(InMemoryWindowStore::new());
//!
//!     for expected in [2, 1, 0] {
//!         let result = limiter.check("search:203.0.113.5", 3, 60_000).await.unwrap();
//!         assert!(result.allowed);
//!         assert_eq!(result.remaining, expected);
//!     }
//!     let denied = limiter.check("search:203.0.113.5", 3, 60_000).await.unwrap();
//!     assert!(!denied.allowed);
//!     assert!(denied.reset_seconds > 0);
//! }
//! ```

pub mod call_policy;
pub mod clock;
pub mod config;
pub mod error;
pub mod prelude;
pub mod rate_limit;
pub mod telemetry;

// Re-exports
pub use call_policy::{CallPolicy, InstantSleeper, Sleeper, TokioSleeper};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{LimiterConfig, Route, RouteLimit, RouteTable};
pub use error::{LimitError, StoreFailure};
pub use rate_limit::{
    Enforcement, InMemoryWindowStore, Quota, RateLimitLayer, RateLimitResult, RateLimiter,
    SlidingWindowLimiter, ThrottleError, WindowStore,
};
