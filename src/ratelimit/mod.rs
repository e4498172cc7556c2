//! Rate limiting core: counter store, tier policies, and maintenance.

pub mod limiter;
pub mod store;
pub mod sweeper;

pub use limiter::{ConsumeResult, RateLimitPolicy, RateLimiter, Tier, TierLimiters};
pub use store::{CounterSnapshot, CounterStore, SqliteCounterStore};
pub use sweeper::spawn_purge_task;
