//! Tier policies and the consume protocol.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, trace};

use crate::config::{RateLimitingConfig, TierLimits};
use crate::error::Result;

use super::store::CounterStore;

/// A named policy tier applied to a class of routes.
///
/// Authentication endpoints are wired to `Strict`, machine-readable API
/// routes to `Api`, everything else to `General`. The wiring itself is the
/// routing layer's decision, not the limiter's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// High ceiling, broad routes
    General,
    /// Low ceiling, authentication routes
    Strict,
    /// Medium ceiling, generic API routes
    Api,
}

impl Tier {
    /// Key prefix isolating this tier's counters in the shared store.
    pub fn key_prefix(&self) -> &'static str {
        match self {
            Tier::General => "general",
            Tier::Strict => "strict",
            Tier::Api => "api",
        }
    }

    /// Client-facing message when this tier's ceiling is hit.
    pub fn exceeded_message(&self) -> &'static str {
        match self {
            Tier::General => "Too many requests, please try again later",
            Tier::Strict => "Too many authentication attempts, please try again later",
            Tier::Api => "API rate limit exceeded, please try again later",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key_prefix())
    }
}

/// The fixed policy applied by one limiter instance.
///
/// Policies are immutable after startup; changing one means restarting the
/// process with new configuration.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    /// Maximum points consumable within one window
    pub points_limit: u64,
    /// Length of the counting window, in seconds
    pub window_duration_secs: u64,
    /// How long a violator stays blocked once the ceiling is exceeded, in seconds
    pub block_duration_secs: u64,
}

impl RateLimitPolicy {
    fn from_tier_limits(limits: &TierLimits, window_duration_secs: u64) -> Self {
        Self {
            points_limit: limits.points,
            window_duration_secs,
            block_duration_secs: limits.block_duration_secs,
        }
    }
}

/// The outcome of a single consume call.
///
/// An exceeded ceiling is a normal outcome carried in `allowed`, never an
/// error; the error channel is reserved for store failures.
#[derive(Debug, Clone, Copy)]
pub struct ConsumeResult {
    /// Whether the request may proceed
    pub allowed: bool,
    /// The tier's points ceiling
    pub limit: u64,
    /// Points still available in the current window
    pub remaining: u64,
    /// When the current window (or block) ends, epoch milliseconds
    pub reset_at_ms: i64,
    /// Seconds the caller should wait before retrying; set only on denial
    pub retry_after_secs: Option<u64>,
}

/// A rate limiter applying one fixed policy to the shared counter store.
pub struct RateLimiter {
    tier: Tier,
    policy: RateLimitPolicy,
    store: Arc<dyn CounterStore>,
}

impl RateLimiter {
    /// Create a limiter for `tier` with the given policy.
    pub fn new(tier: Tier, policy: RateLimitPolicy, store: Arc<dyn CounterStore>) -> Self {
        Self {
            tier,
            policy,
            store,
        }
    }

    /// The tier this limiter enforces.
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// The policy this limiter enforces.
    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Consume one point for `client_key` and decide whether the request may
    /// proceed.
    ///
    /// The store increment runs on its own task: a client that aborts while
    /// the decision is in flight has still reached the server, so its point
    /// stays spent.
    pub async fn consume(&self, client_key: &str) -> Result<ConsumeResult> {
        let full_key = format!("{}:{}", self.tier.key_prefix(), client_key);
        let window = self.policy.window_duration_secs;

        trace!(key = %full_key, tier = %self.tier, "Consuming rate limit point");

        let snapshot = {
            let store = Arc::clone(&self.store);
            let key = full_key.clone();
            tokio::spawn(async move { store.increment_and_get(&key, window).await }).await??
        };

        let now_ms = Utc::now().timestamp_millis();
        let limit = self.policy.points_limit as i64;

        if snapshot.points <= limit {
            return Ok(ConsumeResult {
                allowed: true,
                limit: self.policy.points_limit,
                remaining: (limit - snapshot.points) as u64,
                reset_at_ms: snapshot.expire_at_ms,
                retry_after_secs: None,
            });
        }

        // The first call past the ceiling starts the block: expiry is raised
        // to now + block duration, never lowered. Later offending calls wait
        // out the same block.
        let mut reset_at_ms = snapshot.expire_at_ms;
        if snapshot.points == limit + 1 && self.policy.block_duration_secs > 0 {
            let blocked_until = now_ms + (self.policy.block_duration_secs as i64) * 1000;
            reset_at_ms = self.store.extend_expiry(&full_key, blocked_until).await?;
            debug!(
                key = %full_key,
                tier = %self.tier,
                blocked_until,
                "Rate limit ceiling exceeded, block applied"
            );
        }

        let retry_after_secs = (((reset_at_ms - now_ms).max(0) as u64).div_ceil(1000)).max(1);

        Ok(ConsumeResult {
            allowed: false,
            limit: self.policy.points_limit,
            remaining: 0,
            reset_at_ms,
            retry_after_secs: Some(retry_after_secs),
        })
    }
}

/// The three standard limiter instances, sharing one counter store.
#[derive(Clone)]
pub struct TierLimiters {
    /// Broad application routes
    pub general: Arc<RateLimiter>,
    /// Authentication routes
    pub strict: Arc<RateLimiter>,
    /// Machine-readable API routes
    pub api: Arc<RateLimiter>,
}

impl TierLimiters {
    /// Build the standard tiers from validated configuration.
    pub fn from_config(config: &RateLimitingConfig, store: Arc<dyn CounterStore>) -> Self {
        let window = config.window_duration_secs;
        Self {
            general: Arc::new(RateLimiter::new(
                Tier::General,
                RateLimitPolicy::from_tier_limits(&config.general, window),
                Arc::clone(&store),
            )),
            strict: Arc::new(RateLimiter::new(
                Tier::Strict,
                RateLimitPolicy::from_tier_limits(&config.strict, window),
                Arc::clone(&store),
            )),
            api: Arc::new(RateLimiter::new(
                Tier::Api,
                RateLimitPolicy::from_tier_limits(&config.api, window),
                store,
            )),
        }
    }
}
