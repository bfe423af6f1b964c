//! Typed, guarded access to the credential store.
//!
//! Every call goes through the same pipeline: fail fast while the breaker is
//! open, bound the call with a timeout, retry idempotent operations with
//! backoff, then feed the outcome back into the breaker. Values are the
//! versioned records from [`crate::models::records`].

use service_core::retry::{retry_with_backoff, RetryConfig};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::audit::AuditSink;
use super::circuit_breaker::{BreakerSnapshot, BreakerTransition, CircuitBreaker};
use super::clock::Clock;
use super::store::{CredentialStore, HitOutcome, HitRequest, StoreError};
use crate::models::{AuditAction, AuditEvent, AuditOutcome, KeySpace, VersionedRecord};

pub const STORE_DEPENDENCY: &str = "credential-store";

#[derive(Debug, Clone)]
pub struct StoreResilience {
    pub call_timeout: Duration,
    /// Applied to reads and idempotent writes only.
    pub retry: RetryConfig,
}

impl Default for StoreResilience {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_millis(500),
            retry: RetryConfig::quick(),
        }
    }
}

/// Converts a record lifetime to a store TTL, never shorter than one second.
pub fn ttl_from(duration: chrono::Duration) -> Duration {
    duration
        .to_std()
        .unwrap_or(Duration::ZERO)
        .max(Duration::from_secs(1))
}

#[derive(Clone)]
pub struct CredentialGateway {
    store: Arc<dyn CredentialStore>,
    breaker: Arc<CircuitBreaker>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    resilience: StoreResilience,
}

impl CredentialGateway {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        breaker: Arc<CircuitBreaker>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        resilience: StoreResilience,
    ) -> Self {
        Self {
            store,
            breaker,
            audit,
            clock,
            resilience,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn breaker_open(&self) -> bool {
        self.breaker.is_open(STORE_DEPENDENCY)
    }

    pub fn breaker_snapshot(&self) -> BreakerSnapshot {
        self.breaker.snapshot(STORE_DEPENDENCY)
    }

    async fn guarded<T, F, Fut>(&self, operation: &str, retry: bool, f: F) -> Result<T, StoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        if self.breaker_open() {
            return Err(StoreError::CircuitOpen(STORE_DEPENDENCY.to_string()));
        }

        let timeout = self.resilience.call_timeout;
        let no_retry = RetryConfig::no_retry();
        let config = if retry {
            &self.resilience.retry
        } else {
            &no_retry
        };

        let result = retry_with_backoff(
            config,
            operation,
            |e: &StoreError| e.is_transient(),
            || {
                let call = f();
                async move {
                    tokio::time::timeout(timeout, call)
                        .await
                        .unwrap_or(Err(StoreError::Timeout(timeout)))
                }
            },
        )
        .await;

        match &result {
            Ok(_) => self.breaker.record_success(STORE_DEPENDENCY),
            Err(e) if e.is_transient() => {
                tracing::warn!(operation = %operation, error = %e, "Credential store call failed");
                if let Some(BreakerTransition::Opened) =
                    self.breaker.record_failure(STORE_DEPENDENCY)
                {
                    self.audit.record(
                        AuditEvent::system(
                            AuditAction::CircuitBreakerOpened,
                            AuditOutcome::failure(STORE_DEPENDENCY),
                            self.clock.now(),
                        )
                        .with_details(format!("opened after {}: {}", operation, e)),
                    );
                }
            }
            Err(_) => {}
        }

        result
    }

    fn decode<R: VersionedRecord>(key: &str, raw: &str) -> Result<R, StoreError> {
        R::decode(raw).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    fn encode<R: VersionedRecord>(key: &str, record: &R) -> Result<String, StoreError> {
        record.encode().map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    pub async fn put_record<R: VersionedRecord>(
        &self,
        space: KeySpace,
        id: &str,
        record: &R,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let key = space.key(id);
        let value = Self::encode(&key, record)?;
        self.guarded("put", true, || self.store.put(&key, &value, ttl))
            .await
    }

    /// Conditional write; `true` if this caller created the record.
    pub async fn claim<R: VersionedRecord>(
        &self,
        space: KeySpace,
        id: &str,
        record: &R,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let key = space.key(id);
        let value = Self::encode(&key, record)?;
        self.guarded("put_if_absent", false, || {
            self.store.put_if_absent(&key, &value, ttl)
        })
        .await
    }

    pub async fn get_record<R: VersionedRecord>(
        &self,
        space: KeySpace,
        id: &str,
    ) -> Result<Option<R>, StoreError> {
        let key = space.key(id);
        let raw = self.guarded("get", true, || self.store.get(&key)).await?;
        raw.map(|r| Self::decode(&key, &r)).transpose()
    }

    /// Single-use read: the record is gone after this call succeeds.
    pub async fn take_record<R: VersionedRecord>(
        &self,
        space: KeySpace,
        id: &str,
    ) -> Result<Option<R>, StoreError> {
        let key = space.key(id);
        let raw = self.guarded("take", false, || self.store.take(&key)).await?;
        raw.map(|r| Self::decode(&key, &r)).transpose()
    }

    pub async fn any_exists(&self, keys: &[(KeySpace, &str)]) -> Result<bool, StoreError> {
        let keys: Vec<String> = keys.iter().map(|(space, id)| space.key(id)).collect();
        self.guarded("exists", true, || self.store.exists_any(&keys))
            .await
    }

    pub async fn delete(&self, space: KeySpace, id: &str) -> Result<(), StoreError> {
        let key = space.key(id);
        self.guarded("delete", true, || self.store.delete(&key)).await
    }

    pub async fn set_add(
        &self,
        space: KeySpace,
        id: &str,
        members: &[String],
    ) -> Result<u64, StoreError> {
        let key = space.key(id);
        self.guarded("set_add", true, || self.store.set_add(&key, members))
            .await
    }

    pub async fn set_contains(
        &self,
        space: KeySpace,
        id: &str,
        member: &str,
    ) -> Result<bool, StoreError> {
        let key = space.key(id);
        self.guarded("set_contains", true, || {
            self.store.set_contains(&key, member)
        })
        .await
    }

    pub async fn set_remove(
        &self,
        space: KeySpace,
        id: &str,
        member: &str,
    ) -> Result<bool, StoreError> {
        let key = space.key(id);
        self.guarded("set_remove", true, || self.store.set_remove(&key, member))
            .await
    }

    pub async fn set_move(
        &self,
        from: KeySpace,
        to: KeySpace,
        id: &str,
        member: &str,
    ) -> Result<bool, StoreError> {
        let from_key = from.key(id);
        let to_key = to.key(id);
        self.guarded("set_move", false, || {
            self.store.set_move(&from_key, &to_key, member)
        })
        .await
    }

    pub async fn set_members(&self, space: KeySpace, id: &str) -> Result<Vec<String>, StoreError> {
        let key = space.key(id);
        self.guarded("set_members", true, || self.store.set_members(&key))
            .await
    }

    pub async fn set_len(&self, space: KeySpace, id: &str) -> Result<u64, StoreError> {
        let key = space.key(id);
        self.guarded("set_len", true, || self.store.set_len(&key))
            .await
    }

    pub async fn record_hit(&self, id: &str, hit: &HitRequest) -> Result<HitOutcome, StoreError> {
        let window_key = KeySpace::RateWindow.key(id);
        let block_key = KeySpace::RateBlock.key(id);
        self.guarded("record_hit", false, || {
            self.store.record_hit(&window_key, &block_key, hit)
        })
        .await
    }

    /// Direct check, bypassing the breaker so health reflects the store itself.
    pub async fn health_check(&self) -> Result<(), StoreError> {
        let timeout = self.resilience.call_timeout;
        tokio::time::timeout(timeout, self.store.health_check())
            .await
            .unwrap_or(Err(StoreError::Timeout(timeout)))
    }
}
