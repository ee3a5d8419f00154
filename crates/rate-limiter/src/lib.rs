//! Rate Limiter
//!
//! Fixed-window request budget per owner. The window is truncated to the
//! hour by default; each call atomically increments the counter for
//! `(owner_id, window_start)` and is admitted iff the post-increment count is
//! within the owner's limit. Rejected attempts are not rolled back.
//!
//! Counters live behind [`CounterStore`]: [`MemoryCounterStore`] for a single
//! gateway process, [`RedisCounterStore`] when several gateways share a
//! budget.

pub mod config;
pub mod error;
pub mod limiter;
pub mod store;

pub use config::{FailureMode, PlanLimits, RateLimitConfig};
pub use error::{RateLimitError, Result};
pub use limiter::{window_start, RateDecision, RateLimiter};
pub use store::{CounterStore, MemoryCounterStore, RedisCounterStore};
