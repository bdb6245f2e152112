//! Limiter configuration.
//!
//! Two layers:
//! - [`RouteTable`]: the per-call-site quotas (`search`, `api`, `comment`, `vote`). Call sites
//!   resolve their quota here and pass it to the limiter; the limiter never reads the table on
//!   its own.
//! - [`LimiterConfig`]: deployment settings (store URL, key prefix, store timeout/retry) plus
//!   the route table. Loaded from serde (feature `serde`, on by default) or from the environment.
//!
//! An absent or empty store URL means "no shared store": the limiter runs in pass-through mode.

use crate::call_policy::{CallPolicy, DEFAULT_STORE_TIMEOUT};
use crate::error::LimitError;
use crate::rate_limit::Quota;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Call sites with their own quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Route {
    Search,
    Api,
    Comment,
    Vote,
}

impl Route {
    pub const ALL: [Route; 4] = [Route::Search, Route::Api, Route::Comment, Route::Vote];

    /// Tag placed in front of identifiers for this route.
    pub fn category(self) -> &'static str {
        match self {
            Route::Search => "search",
            Route::Api => "api",
            Route::Comment => "comment",
            Route::Vote => "vote",
        }
    }

    /// `"<category>:<subject>"`, e.g. `"search:203.0.113.5"`.
    pub fn identifier(self, subject: &str) -> String {
        format!("{}:{}", self.category(), subject)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.category())
    }
}

impl FromStr for Route {
    type Err = LimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Route::ALL
            .into_iter()
            .find(|r| r.category().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| LimitError::Config(format!("unknown route '{}'", s)))
    }
}

/// `actions` per trailing `window_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RouteLimit {
    pub actions: u32,
    pub window_ms: u64,
}

impl RouteLimit {
    pub const fn new(actions: u32, window_ms: u64) -> Self {
        Self { actions, window_ms }
    }

    pub fn quota(&self) -> Result<Quota, LimitError> {
        Quota::new(self.actions, self.window_ms)
    }
}

/// Per-route quotas. Routes missing from a deserialized table keep their defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RouteTable {
    pub search: RouteLimit,
    pub api: RouteLimit,
    pub comment: RouteLimit,
    pub vote: RouteLimit,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self {
            search: RouteLimit::new(15, 60_000),
            api: RouteLimit::new(10, 60_000),
            comment: RouteLimit::new(5, 600_000),
            vote: RouteLimit::new(30, 300_000),
        }
    }
}

impl RouteTable {
    pub fn get(&self, route: Route) -> RouteLimit {
        match route {
            Route::Search => self.search,
            Route::Api => self.api,
            Route::Comment => self.comment,
            Route::Vote => self.vote,
        }
    }

    pub fn set(&mut self, route: Route, limit: RouteLimit) {
        match route {
            Route::Search => self.search = limit,
            Route::Api => self.api = limit,
            Route::Comment => self.comment = limit,
            Route::Vote => self.vote = limit,
        }
    }

    /// Every route must have a positive quota.
    pub fn validate(&self) -> Result<(), LimitError> {
        for route in Route::ALL {
            self.get(route)
                .quota()
                .map_err(|e| LimitError::Config(format!("route '{}': {}", route, e)))?;
        }
        Ok(())
    }
}

/// Environment variable holding the shared store URL.
pub const ENV_STORE_URL: &str = "GEMS_RATELIMIT_STORE_URL";
/// Environment variable overriding the key prefix.
pub const ENV_KEY_PREFIX: &str = "GEMS_RATELIMIT_KEY_PREFIX";
/// Environment variable for the per-call store timeout in milliseconds.
pub const ENV_TIMEOUT_MS: &str = "GEMS_RATELIMIT_TIMEOUT_MS";
/// Environment variable enabling the single retry (`true`/`false`/`1`/`0`).
pub const ENV_RETRY_ONCE: &str = "GEMS_RATELIMIT_RETRY_ONCE";
/// Environment variable for the retry delay in milliseconds.
pub const ENV_RETRY_DELAY_MS: &str = "GEMS_RATELIMIT_RETRY_DELAY_MS";

/// Deployment settings for the limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LimiterConfig {
    /// Shared store URL (e.g. `redis://cache:6379`). `None` selects pass-through mode.
    pub store_url: Option<String>,
    pub key_prefix: String,
    pub store_timeout_ms: u64,
    pub retry_once: bool,
    pub retry_delay_ms: u64,
    pub routes: RouteTable,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            store_url: None,
            key_prefix: crate::rate_limit::sliding_window::DEFAULT_KEY_PREFIX.to_string(),
            store_timeout_ms: u64::try_from(DEFAULT_STORE_TIMEOUT.as_millis()).unwrap_or(500),
            retry_once: false,
            retry_delay_ms: 25,
            routes: RouteTable::default(),
        }
    }
}

impl LimiterConfig {
    /// Read settings from the process environment. Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, LimitError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`Self::from_env`] with an explicit lookup, for tests and layered config.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, LimitError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self {
            store_url: lookup(ENV_STORE_URL)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            ..Self::default()
        };
        if let Some(prefix) = lookup(ENV_KEY_PREFIX) {
            config.key_prefix = prefix.trim().to_string();
        }
        if let Some(raw) = lookup(ENV_TIMEOUT_MS) {
            config.store_timeout_ms = parse_number(ENV_TIMEOUT_MS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_RETRY_ONCE) {
            config.retry_once = parse_flag(ENV_RETRY_ONCE, &raw)?;
        }
        if let Some(raw) = lookup(ENV_RETRY_DELAY_MS) {
            config.retry_delay_ms = parse_number(ENV_RETRY_DELAY_MS, &raw)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LimitError> {
        if self.store_timeout_ms == 0 {
            return Err(LimitError::Config("store_timeout_ms must be > 0".into()));
        }
        self.routes.validate()
    }

    /// True when a store URL is configured.
    pub fn has_store(&self) -> bool {
        self.store_url.as_deref().is_some_and(|url| !url.trim().is_empty())
    }

    /// Timeout/retry rules for store calls.
    pub fn call_policy(&self) -> Result<CallPolicy, LimitError> {
        let policy = CallPolicy::new(Duration::from_millis(self.store_timeout_ms))?;
        Ok(if self.retry_once {
            policy.with_single_retry(Duration::from_millis(self.retry_delay_ms))
        } else {
            policy
        })
    }
}

fn parse_number(name: &str, raw: &str) -> Result<u64, LimitError> {
    raw.trim()
        .parse()
        .map_err(|e| LimitError::Config(format!("{}: '{}' is not a number ({})", name, raw, e)))
}

fn parse_flag(name: &str, raw: &str) -> Result<bool, LimitError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(LimitError::Config(format!("{}: '{}' is not a boolean", name, other))),
    }
}
