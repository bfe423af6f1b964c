//! Failure-triggered circuit breaker, one state per named dependency.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;

use super::clock::Clock;

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::seconds(30),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct BreakerState {
    consecutive_failures: u32,
    last_failure: Option<DateTime<Utc>>,
    open_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerTransition {
    Opened,
}

/// Snapshot for health reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub consecutive_failures: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub open: bool,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    states: DashMap<String, BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            states: DashMap::new(),
        }
    }

    /// True while the cool-down of an opened breaker has not elapsed.
    pub fn is_open(&self, dependency: &str) -> bool {
        let now = self.clock.now();
        self.states
            .get(dependency)
            .and_then(|s| s.open_until)
            .is_some_and(|until| now < until)
    }

    /// Count a failure; returns `Opened` on the call that trips the breaker.
    pub fn record_failure(&self, dependency: &str) -> Option<BreakerTransition> {
        let now = self.clock.now();
        let mut state = self.states.entry(dependency.to_string()).or_default();

        let already_open = state.open_until.is_some_and(|until| now < until);
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_failure = Some(now);

        if already_open || state.consecutive_failures < self.config.failure_threshold {
            return None;
        }

        state.open_until = Some(now + self.config.cooldown);
        tracing::warn!(
            dependency = %dependency,
            failures = state.consecutive_failures,
            cooldown_secs = self.config.cooldown.num_seconds(),
            "Circuit breaker opened"
        );
        Some(BreakerTransition::Opened)
    }

    /// Any success closes the breaker and resets the failure count.
    pub fn record_success(&self, dependency: &str) {
        if let Some(mut state) = self.states.get_mut(dependency) {
            if state.consecutive_failures > 0 || state.open_until.is_some() {
                if state.open_until.is_some() {
                    tracing::info!(dependency = %dependency, "Circuit breaker closed");
                }
                *state = BreakerState::default();
            }
        }
    }

    pub fn snapshot(&self, dependency: &str) -> BreakerSnapshot {
        let open = self.is_open(dependency);
        match self.states.get(dependency) {
            Some(s) => BreakerSnapshot {
                consecutive_failures: s.consecutive_failures,
                last_failure: s.last_failure,
                open,
            },
            None => BreakerSnapshot {
                consecutive_failures: 0,
                last_failure: None,
                open,
            },
        }
    }
}
