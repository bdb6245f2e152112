//! Redis window store for `gems-ratelimit`.
//!
//! Each identifier's window is a sorted set scored by admission time in milliseconds. The
//! prune/count/append step runs as one Lua script, so every process sharing the server sees a
//! consistent count. The key's expiry is reset to the window length on every append, which lets
//! Redis drop idle windows on its own.
//!
//! ```no_run
//! use gems_ratelimit::SlidingWindowLimiter;
//! use gems_ratelimit_redis::RedisWindowStore;
//!
//! # async fn run() -> Result<(), gems_ratelimit_redis::RedisStoreError> {
//! let store = RedisWindowStore::connect("redis://127.0.0.1:6379").await?;
//! let limiter = SlidingWindowLimiter::new(store);
//! let result = limiter.check("search:203.0.113.5", 15, 60_000).await.expect("valid quota");
//! println!("allowed={} remaining={}", result.allowed, result.remaining);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use gems_ratelimit::rate_limit::{Admission, WindowSnapshot, WindowStore, WindowUsage};
use redis::aio::ConnectionManager;
use redis::Script;
use std::sync::Arc;
use tracing::{debug, warn};

// KEYS[1] window key
// ARGV[1] now_ms, ARGV[2] window_ms, ARGV[3] limit, ARGV[4] member
// Returns {admitted (0|1), prior_count, oldest_ms or -1}. A member that is already live counts
// as admitted and is excluded from prior_count.
const RECORD_SCRIPT: &str = r"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', key, '-inf', '(' .. (now - window))
local count = redis.call('ZCARD', key)
local admitted = 0
if redis.call('ZSCORE', key, ARGV[4]) then
  -- written by an earlier attempt whose reply was lost
  count = count - 1
  admitted = 1
elseif count < limit then
  redis.call('ZADD', key, ARGV[1], ARGV[4])
  redis.call('PEXPIRE', key, ARGV[2])
  admitted = 1
end

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local oldest_ms = -1
if oldest[2] then
  oldest_ms = tonumber(oldest[2])
end
return {admitted, count, oldest_ms}
";

/// Errors from the Redis store.
#[derive(Debug, thiserror::Error)]
pub enum RedisStoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("unexpected reply from window script: {0}")]
    MalformedReply(String),
}

/// Sorted-set window store on a shared Redis server.
#[derive(Clone)]
pub struct RedisWindowStore {
    conn: ConnectionManager,
    record_script: Arc<Script>,
}

impl std::fmt::Debug for RedisWindowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisWindowStore").finish_non_exhaustive()
    }
}

impl RedisWindowStore {
    /// Open a managed connection to `url` and verify it with `PING`.
    pub async fn connect(url: &str) -> Result<Self, RedisStoreError> {
        let client = redis::Client::open(url).map_err(|e| {
            warn!(error = %e, "invalid rate limit store url");
            e
        })?;
        let manager = ConnectionManager::new(client).await?;

        let mut conn = manager.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!(reply = %pong, "connected to rate limit store");

        Ok(Self::from_manager(manager))
    }

    /// Reuse an existing connection manager.
    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self { conn, record_script: Arc::new(Script::new(RECORD_SCRIPT)) }
    }
}

/// Decode the script's `{admitted, prior_count, oldest_ms}` reply.
fn parse_snapshot(reply: &[i64]) -> Result<WindowSnapshot, RedisStoreError> {
    let [admitted, prior_count, oldest_ms] = reply else {
        return Err(RedisStoreError::MalformedReply(format!("{:?}", reply)));
    };
    let admitted = match *admitted {
        0 => false,
        1 => true,
        other => return Err(RedisStoreError::MalformedReply(format!("admitted={}", other))),
    };
    let prior_count = u32::try_from(*prior_count)
        .map_err(|_| RedisStoreError::MalformedReply(format!("count={}", prior_count)))?;
    let oldest_ms = u64::try_from(*oldest_ms).ok();
    Ok(WindowSnapshot { admitted, prior_count, oldest_ms })
}

/// Decode a `ZRANGEBYSCORE .. WITHSCORES LIMIT 0 1` reply (`[member, score]` or empty).
fn parse_oldest(reply: &[String]) -> Result<Option<u64>, RedisStoreError> {
    match reply {
        [] => Ok(None),
        [_member, score] => score
            .parse::<f64>()
            .map(|s| Some(s as u64))
            .map_err(|_| RedisStoreError::MalformedReply(format!("score={}", score))),
        other => Err(RedisStoreError::MalformedReply(format!("{:?}", other))),
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    type Error = RedisStoreError;

    async fn record(
        &self,
        key: &str,
        admission: &Admission,
    ) -> Result<WindowSnapshot, Self::Error> {
        let mut conn = self.conn.clone();
        let mut invocation = self.record_script.prepare_invoke();
        invocation
            .key(key)
            .arg(admission.now_ms)
            .arg(admission.window_ms)
            .arg(admission.limit)
            .arg(&admission.member);
        let reply: Vec<i64> = invocation.invoke_async(&mut conn).await?;
        parse_snapshot(&reply)
    }

    async fn inspect(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> Result<WindowUsage, Self::Error> {
        let mut conn = self.conn.clone();
        let window_start = now_ms.saturating_sub(window_ms);
        let mut pipe = redis::pipe();
        pipe.cmd("ZCOUNT")
            .arg(key)
            .arg(window_start)
            .arg("+inf")
            .cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(window_start)
            .arg("+inf")
            .arg("WITHSCORES")
            .arg("LIMIT")
            .arg(0)
            .arg(1);
        let (count, oldest): (u64, Vec<String>) = pipe.query_async(&mut conn).await?;
        Ok(WindowUsage {
            count: u32::try_from(count).unwrap_or(u32::MAX),
            oldest_ms: parse_oldest(&oldest)?,
        })
    }

    async fn clear(&self, key: &str) -> Result<(), Self::Error> {
        let mut conn = self.conn.clone();
        let removed: u64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        debug!(key = %key, removed, "cleared rate limit window");
        Ok(())
    }
}
