//! Durable counter storage for rate limiting.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::error::Result;

/// The outcome of a single counter increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Points consumed in the current window, including this call
    pub points: i64,
    /// When the current window (and any block) ends, epoch milliseconds
    pub expire_at_ms: i64,
}

/// Durable counter storage keyed by string, with atomic increment and expiry
/// awareness.
///
/// At most one live record exists per key. A record whose expiry has passed
/// is treated as absent: the next increment recreates it with a fresh window.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment the counter for `key`.
    ///
    /// If no live record exists the record is created with `points = 1` and
    /// an expiry one window from now; otherwise `points` is incremented and
    /// the expiry left unchanged. Concurrent callers on the same key never
    /// lose updates: after N calls complete the count is exactly N.
    async fn increment_and_get(&self, key: &str, window_duration_secs: u64)
        -> Result<CounterSnapshot>;

    /// Raise the expiry for `key` to `expire_at_ms`, never lowering it.
    ///
    /// Returns the resulting expiry.
    async fn extend_expiry(&self, key: &str, expire_at_ms: i64) -> Result<i64>;

    /// Delete all records whose expiry precedes `now_ms`. Returns the number
    /// of records removed.
    async fn purge_expired(&self, now_ms: i64) -> Result<u64>;

    /// Delete the record for `key` unconditionally.
    async fn reset(&self, key: &str) -> Result<()>;
}

const SCHEMA_TABLE: &str = "CREATE TABLE IF NOT EXISTS rate_limits (
    key    TEXT PRIMARY KEY,
    points INTEGER NOT NULL,
    expire INTEGER
)";

const SCHEMA_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_rate_limits_expire ON rate_limits (expire)";

/// Insert-or-increment in a single atomic statement, restarting the window
/// when the stored expiry has already passed. A NULL expiry never goes stale.
const INCREMENT_SQL: &str = "INSERT INTO rate_limits (key, points, expire)
VALUES (?1, 1, ?2)
ON CONFLICT(key) DO UPDATE SET
    points = CASE
        WHEN rate_limits.expire IS NOT NULL AND rate_limits.expire < ?3 THEN 1
        ELSE rate_limits.points + 1
    END,
    expire = CASE
        WHEN rate_limits.expire IS NOT NULL AND rate_limits.expire < ?3 THEN ?2
        ELSE rate_limits.expire
    END
RETURNING points, expire";

/// SQLite-backed counter store.
///
/// All three limiter tiers share one `rate_limits` table; tier key prefixes
/// keep their counters disjoint.
#[derive(Clone)]
pub struct SqliteCounterStore {
    pool: SqlitePool,
}

impl SqliteCounterStore {
    /// Open (creating if missing) the counter database and ensure its schema.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        // A :memory: database is private to its connection, so the pool must
        // hold exactly one open at all times or counters would shard.
        let is_memory =
            database_url.contains(":memory:") || database_url.contains("mode=memory");
        let (max_connections, min_connections) = if is_memory { (1, 1) } else { (5, 0) };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .connect_with(options)
            .await?;

        sqlx::query(SCHEMA_TABLE).execute(&pool).await?;
        sqlx::query(SCHEMA_INDEX).execute(&pool).await?;

        debug!(database_url, "Counter store schema ready");
        Ok(Self { pool })
    }

    /// Increment against an explicit clock instant.
    pub async fn increment_at(
        &self,
        key: &str,
        window_duration_secs: u64,
        now_ms: i64,
    ) -> Result<CounterSnapshot> {
        let fresh_expire = now_ms + (window_duration_secs as i64) * 1000;
        let row = sqlx::query(INCREMENT_SQL)
            .bind(key)
            .bind(fresh_expire)
            .bind(now_ms)
            .fetch_one(&self.pool)
            .await?;

        Ok(CounterSnapshot {
            points: row.try_get("points")?,
            expire_at_ms: row
                .try_get::<Option<i64>, _>("expire")?
                .unwrap_or(fresh_expire),
        })
    }
}

#[async_trait]
impl CounterStore for SqliteCounterStore {
    async fn increment_and_get(
        &self,
        key: &str,
        window_duration_secs: u64,
    ) -> Result<CounterSnapshot> {
        self.increment_at(key, window_duration_secs, Utc::now().timestamp_millis())
            .await
    }

    async fn extend_expiry(&self, key: &str, expire_at_ms: i64) -> Result<i64> {
        let row = sqlx::query(
            "UPDATE rate_limits
             SET expire = MAX(COALESCE(expire, 0), ?2)
             WHERE key = ?1
             RETURNING expire",
        )
        .bind(key)
        .bind(expire_at_ms)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row
                .try_get::<Option<i64>, _>("expire")?
                .unwrap_or(expire_at_ms)),
            // The record was purged between increment and block; nothing to extend
            None => Ok(expire_at_ms),
        }
    }

    async fn purge_expired(&self, now_ms: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM rate_limits WHERE expire IS NOT NULL AND expire < ?1")
            .bind(now_ms)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn reset(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM rate_limits WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
