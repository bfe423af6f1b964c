//! Multi-tier sliding-window rate limiting over the credential store.
//!
//! Each tier keeps a window of attempt timestamps per key. When an attempt
//! would push the in-window count past the maximum it is denied and the key
//! is blocked for the tier's cool-down. Store trouble never locks users out:
//! any failure reaching the store, including an open breaker, allows the
//! attempt.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::fmt;
use uuid::Uuid;

use super::credentials::CredentialGateway;
use super::error::AuthError;
use super::store::HitRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateTier {
    Login,
    Refresh,
    Mfa,
    OAuthCallback,
}

impl RateTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateTier::Login => "login",
            RateTier::Refresh => "refresh",
            RateTier::Mfa => "mfa",
            RateTier::OAuthCallback => "oauth-callback",
        }
    }
}

impl fmt::Display for RateTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierPolicy {
    pub max_count: u64,
    pub window: Duration,
    pub cooldown: Duration,
}

impl TierPolicy {
    pub const fn new(max_count: u64, window: Duration, cooldown: Duration) -> Self {
        Self {
            max_count,
            window,
            cooldown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicies {
    pub login: TierPolicy,
    pub refresh: TierPolicy,
    pub mfa: TierPolicy,
    pub oauth_callback: TierPolicy,
}

impl Default for RateLimitPolicies {
    fn default() -> Self {
        Self {
            login: TierPolicy::new(5, Duration::minutes(15), Duration::minutes(5)),
            refresh: TierPolicy::new(10, Duration::minutes(1), Duration::minutes(1)),
            mfa: TierPolicy::new(3, Duration::minutes(5), Duration::minutes(15)),
            oauth_callback: TierPolicy::new(10, Duration::minutes(5), Duration::minutes(5)),
        }
    }
}

impl RateLimitPolicies {
    pub fn policy(&self, tier: RateTier) -> TierPolicy {
        match tier {
            RateTier::Login => self.login,
            RateTier::Refresh => self.refresh,
            RateTier::Mfa => self.mfa,
            RateTier::OAuthCallback => self.oauth_callback,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    /// Set when the decision was made without the store (fail-open).
    pub degraded: bool,
}

impl RateDecision {
    /// Whole seconds until `reset_at`, at least one.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.reset_at - now).num_milliseconds().max(0) as u64;
        millis.div_ceil(1000).max(1)
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    gateway: CredentialGateway,
    policies: RateLimitPolicies,
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

impl RateLimiter {
    pub fn new(gateway: CredentialGateway, policies: RateLimitPolicies) -> Self {
        Self { gateway, policies }
    }

    pub fn policies(&self) -> &RateLimitPolicies {
        &self.policies
    }

    /// Count one attempt (of weight `cost`) against `key` in `tier`.
    pub async fn consume(&self, tier: RateTier, key: &str, cost: u64) -> RateDecision {
        let policy = self.policies.policy(tier);
        let now = self.gateway.clock().now();
        let hit = HitRequest {
            now_ms: now.timestamp_millis(),
            window_ms: policy.window.num_milliseconds(),
            max_count: policy.max_count,
            cost: cost.max(1),
            cooldown_ms: policy.cooldown.num_milliseconds(),
            member: Uuid::new_v4().to_string(),
        };

        let outcome = match self
            .gateway
            .record_hit(&format!("{}:{}", tier, key), &hit)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(
                    tier = %tier,
                    error = %e,
                    "Rate limit store unavailable, allowing request"
                );
                return RateDecision {
                    allowed: true,
                    remaining: policy.max_count.saturating_sub(hit.cost),
                    reset_at: now + policy.window,
                    degraded: true,
                };
            }
        };

        let window_end = outcome
            .oldest_ms
            .and_then(from_millis)
            .map_or(now + policy.window, |oldest| oldest + policy.window);

        if outcome.allowed {
            return RateDecision {
                allowed: true,
                remaining: policy.max_count.saturating_sub(outcome.count),
                reset_at: window_end,
                degraded: false,
            };
        }

        let block_end = outcome.blocked_until_ms.and_then(from_millis);
        let reset_at = block_end.map_or(window_end, |b| b.max(window_end));

        tracing::info!(
            tier = %tier,
            count = outcome.count,
            reset_at = %reset_at,
            "Rate limit exceeded"
        );

        RateDecision {
            allowed: false,
            remaining: 0,
            reset_at,
            degraded: false,
        }
    }

    /// `consume` with a cost of one, mapping a denial to `RateLimited`.
    pub async fn check(&self, tier: RateTier, key: &str) -> Result<RateDecision, AuthError> {
        let decision = self.consume(tier, key, 1).await;
        if decision.allowed {
            return Ok(decision);
        }
        let now = self.gateway.clock().now();
        Err(AuthError::RateLimited {
            reset_at: decision.reset_at,
            retry_after_secs: decision.retry_after_secs(now),
        })
    }

    /// Whether the credential store breaker is currently short-circuiting.
    pub fn is_open(&self) -> bool {
        self.gateway.breaker_open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::audit::MemoryAuditSink;
    use crate::services::circuit_breaker::{BreakerConfig, CircuitBreaker};
    use crate::services::clock::{Clock, ManualClock};
    use crate::services::credentials::StoreResilience;
    use crate::services::store::InMemoryStore;
    use service_core::retry::RetryConfig;
    use std::sync::Arc;

    fn limiter() -> (Arc<ManualClock>, Arc<InMemoryStore>, RateLimiter) {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let store = Arc::new(InMemoryStore::new(clock.clone()));
        let gateway = CredentialGateway::new(
            store.clone(),
            Arc::new(CircuitBreaker::new(BreakerConfig::default(), clock.clone())),
            Arc::new(MemoryAuditSink::new()),
            clock.clone(),
            StoreResilience {
                call_timeout: std::time::Duration::from_millis(200),
                retry: RetryConfig::no_retry(),
            },
        );
        (
            clock,
            store,
            RateLimiter::new(gateway, RateLimitPolicies::default()),
        )
    }

    #[tokio::test]
    async fn window_never_exceeds_max() {
        let (clock, _, limiter) = limiter();
        for i in 0..5 {
            let d = limiter.consume(RateTier::Login, "a@x.io", 1).await;
            assert!(d.allowed, "attempt {i}");
            assert_eq!(d.remaining, 4 - i);
            clock.advance(Duration::seconds(10));
        }
        let denied = limiter.consume(RateTier::Login, "a@x.io", 1).await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
    }

    #[tokio::test]
    async fn reset_at_is_oldest_entry_expiry() {
        let (clock, _, limiter) = limiter();
        let first = clock.now();
        for _ in 0..5 {
            limiter.consume(RateTier::Login, "k", 1).await;
            clock.advance(Duration::seconds(1));
        }
        let denied = limiter.consume(RateTier::Login, "k", 1).await;
        assert_eq!(denied.reset_at, first + Duration::minutes(15));
    }

    #[tokio::test]
    async fn entries_slide_out_of_the_window() {
        let (clock, _, limiter) = limiter();
        let policy = limiter.policies().refresh;
        for _ in 0..policy.max_count {
            assert!(limiter.consume(RateTier::Refresh, "ip", 1).await.allowed);
        }
        assert!(!limiter.consume(RateTier::Refresh, "ip", 1).await.allowed);
        // Past both the window and the refresh cool-down.
        clock.advance(policy.window + Duration::seconds(1));
        assert!(limiter.consume(RateTier::Refresh, "ip", 1).await.allowed);
    }

    #[tokio::test]
    async fn block_outlasts_window_for_mfa() {
        let (clock, _, limiter) = limiter();
        for _ in 0..3 {
            limiter.consume(RateTier::Mfa, "sub", 1).await;
        }
        let denied = limiter.consume(RateTier::Mfa, "sub", 1).await;
        assert!(!denied.allowed);

        // Window (5 min) has passed but the 15 min block has not.
        clock.advance(Duration::minutes(6));
        let still = limiter.consume(RateTier::Mfa, "sub", 1).await;
        assert!(!still.allowed);
        assert_eq!(still.reset_at, denied.reset_at);

        clock.advance(Duration::minutes(10));
        assert!(limiter.consume(RateTier::Mfa, "sub", 1).await.allowed);
    }

    #[tokio::test]
    async fn cost_counts_as_multiple_entries() {
        let (_, _, limiter) = limiter();
        assert!(limiter.consume(RateTier::Login, "k", 4).await.allowed);
        assert!(!limiter.consume(RateTier::Login, "k", 2).await.allowed);
    }

    #[tokio::test]
    async fn keys_and_tiers_are_independent() {
        let (_, _, limiter) = limiter();
        for _ in 0..3 {
            limiter.consume(RateTier::Mfa, "a", 1).await;
        }
        assert!(!limiter.consume(RateTier::Mfa, "a", 1).await.allowed);
        assert!(limiter.consume(RateTier::Mfa, "b", 1).await.allowed);
        assert!(limiter.consume(RateTier::Login, "a", 1).await.allowed);
    }

    #[tokio::test]
    async fn store_outage_fails_open() {
        let (_, store, limiter) = limiter();
        store.set_unavailable(true);
        for _ in 0..20 {
            let d = limiter.consume(RateTier::Login, "k", 1).await;
            assert!(d.allowed);
            assert!(d.degraded);
        }
        assert!(limiter.is_open());
    }

    #[tokio::test]
    async fn check_maps_denial_to_rate_limited() {
        let (_, _, limiter) = limiter();
        for _ in 0..3 {
            limiter.check(RateTier::Mfa, "s").await.unwrap();
        }
        match limiter.check(RateTier::Mfa, "s").await {
            Err(AuthError::RateLimited {
                retry_after_secs, ..
            }) => assert_eq!(retry_after_secs, 15 * 60),
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }
}
