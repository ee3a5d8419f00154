//! Counter storage for fixed windows

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tracing::{debug, info};

use crate::error::Result;

/// Atomic per-`(owner, window_start)` counters
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment the counter, creating it if absent, and return the new value.
    ///
    /// `ttl_secs` bounds how long the counter outlives its window.
    async fn increment(&self, owner_id: &str, window_start: i64, ttl_secs: i64) -> Result<u64>;

    /// Current value without incrementing
    async fn peek(&self, owner_id: &str, window_start: i64) -> Result<u64>;
}

/// Process-local counters
///
/// Windows older than the current one are dropped the first time a call in
/// a newer window arrives.
#[derive(Default)]
pub struct MemoryCounterStore {
    counters: DashMap<(String, i64), AtomicU64>,
    newest_window: AtomicI64,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live counters across all owners and windows
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    fn reclaim_before(&self, window_start: i64) {
        let previous = self.newest_window.fetch_max(window_start, Ordering::AcqRel);
        if previous >= window_start {
            return;
        }

        let before = self.counters.len();
        self.counters.retain(|(_, start), _| *start >= window_start);
        let dropped = before.saturating_sub(self.counters.len());
        if dropped > 0 {
            debug!("Reclaimed {} expired rate-limit windows", dropped);
        }
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, owner_id: &str, window_start: i64, _ttl_secs: i64) -> Result<u64> {
        self.reclaim_before(window_start);

        let key = (owner_id.to_string(), window_start);
        if let Some(counter) = self.counters.get(&key) {
            return Ok(counter.fetch_add(1, Ordering::AcqRel) + 1);
        }

        let counter = self.counters.entry(key).or_insert_with(|| AtomicU64::new(0));
        Ok(counter.fetch_add(1, Ordering::AcqRel) + 1)
    }

    async fn peek(&self, owner_id: &str, window_start: i64) -> Result<u64> {
        Ok(self
            .counters
            .get(&(owner_id.to_string(), window_start))
            .map(|counter| counter.load(Ordering::Acquire))
            .unwrap_or(0))
    }
}

/// Counters shared between gateway instances through Redis.
///
/// Each window is one key, `ratelimit:{owner_id}:{window_start}`, incremented
/// and given an expiry in a single MULTI/EXEC so stale windows expire on
/// their own.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
}

impl RedisCounterStore {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;

        info!("Rate limiter connected to Redis at {}", redis_url);

        Ok(Self { conn })
    }

    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn counter_key(owner_id: &str, window_start: i64) -> String {
        format!("ratelimit:{}:{}", owner_id, window_start)
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, owner_id: &str, window_start: i64, ttl_secs: i64) -> Result<u64> {
        let mut conn = self.conn.clone();
        let key = Self::counter_key(owner_id, window_start);

        let (count,): (u64,) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(&key)
            .cmd("EXPIRE")
            .arg(&key)
            .arg(ttl_secs)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(count)
    }

    async fn peek(&self, owner_id: &str, window_start: i64) -> Result<u64> {
        let mut conn = self.conn.clone();
        let count: Option<u64> = conn.get(Self::counter_key(owner_id, window_start)).await?;
        Ok(count.unwrap_or(0))
    }
}
