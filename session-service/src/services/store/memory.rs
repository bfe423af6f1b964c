use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{CredentialStore, HitOutcome, HitRequest, StoreError};
use crate::services::clock::Clock;

enum Value {
    Text(String),
    Set(BTreeSet<String>),
    Window(Vec<(i64, String)>),
}

struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

/// Process-local store with the same semantics as [`super::RedisStore`],
/// driven by an injected clock. Every operation runs under one lock, so
/// conditional writes are linearizable.
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
    unavailable: AtomicBool,
    calls: AtomicU64,
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Command(format!("WRONGTYPE operation against key {}", key))
}

fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(ttl).ok().map(|d| now + d)
}

fn live<'a>(
    map: &'a mut HashMap<String, Entry>,
    key: &str,
    now: DateTime<Utc>,
) -> Option<&'a mut Entry> {
    let expired = map
        .get(key)
        .and_then(|e| e.expires_at)
        .is_some_and(|at| at <= now);
    if expired {
        map.remove(key);
    }
    map.get_mut(key)
}

impl InMemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            unavailable: AtomicBool::new(false),
            calls: AtomicU64::new(0),
        }
    }

    /// Simulate an outage: every call fails with a connection error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of calls that reached the store, including failed ones.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("connection refused".to_string()));
        }
        Ok(self.entries.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn set_of<'a>(
        map: &'a mut HashMap<String, Entry>,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<&'a mut BTreeSet<String>>, StoreError> {
        match live(map, key, now) {
            None => Ok(None),
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(Some(set)),
            Some(_) => Err(wrong_type(key)),
        }
    }
}

#[async_trait]
impl CredentialStore for InMemoryStore {
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut map = self.lock()?;
        map.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: ttl.and_then(|t| expiry_after(now, t)),
            },
        );
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut map = self.lock()?;
        if live(&mut map, key, now).is_some() {
            return Ok(false);
        }
        map.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: ttl.and_then(|t| expiry_after(now, t)),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now();
        let mut map = self.lock()?;
        match live(&mut map, key, now) {
            None => Ok(None),
            Some(Entry {
                value: Value::Text(v),
                ..
            }) => Ok(Some(v.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn take(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now();
        let mut map = self.lock()?;
        if live(&mut map, key, now).is_none() {
            return Ok(None);
        }
        match map.remove(key) {
            Some(Entry {
                value: Value::Text(v),
                ..
            }) => Ok(Some(v)),
            Some(other) => {
                map.insert(key.to_string(), other);
                Err(wrong_type(key))
            }
            None => Ok(None),
        }
    }

    async fn exists_any(&self, keys: &[String]) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut map = self.lock()?;
        Ok(keys.iter().any(|k| live(&mut map, k, now).is_some()))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut map = self.lock()?;
        map.remove(key);
        Ok(())
    }

    async fn set_add(&self, key: &str, members: &[String]) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let mut map = self.lock()?;
        if live(&mut map, key, now).is_none() {
            map.insert(
                key.to_string(),
                Entry {
                    value: Value::Set(BTreeSet::new()),
                    expires_at: None,
                },
            );
        }
        let set = Self::set_of(&mut map, key, now)?.ok_or_else(|| wrong_type(key))?;
        let added = members.iter().filter(|m| set.insert((*m).clone())).count();
        Ok(added as u64)
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut map = self.lock()?;
        Ok(Self::set_of(&mut map, key, now)?.is_some_and(|s| s.contains(member)))
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut map = self.lock()?;
        Ok(Self::set_of(&mut map, key, now)?.is_some_and(|s| s.remove(member)))
    }

    async fn set_move(&self, from: &str, to: &str, member: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut map = self.lock()?;
        // Type-check the destination before touching the source.
        Self::set_of(&mut map, to, now)?;
        let removed = Self::set_of(&mut map, from, now)?.is_some_and(|s| s.remove(member));
        if !removed {
            return Ok(false);
        }
        let entry = map.entry(to.to_string()).or_insert_with(|| Entry {
            value: Value::Set(BTreeSet::new()),
            expires_at: None,
        });
        if let Value::Set(set) = &mut entry.value {
            set.insert(member.to_string());
        }
        Ok(true)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let now = self.clock.now();
        let mut map = self.lock()?;
        Ok(Self::set_of(&mut map, key, now)?
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_len(&self, key: &str) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let mut map = self.lock()?;
        Ok(Self::set_of(&mut map, key, now)?.map_or(0, |s| s.len() as u64))
    }

    async fn record_hit(
        &self,
        window_key: &str,
        block_key: &str,
        hit: &HitRequest,
    ) -> Result<HitOutcome, StoreError> {
        let now = self.clock.now();
        let mut map = self.lock()?;

        let blocked_until = match live(&mut map, block_key, now) {
            Some(Entry {
                value: Value::Text(v),
                ..
            }) => v.parse::<i64>().ok().filter(|until| *until > hit.now_ms),
            Some(_) => return Err(wrong_type(block_key)),
            None => None,
        };

        if live(&mut map, window_key, now).is_none() {
            map.insert(
                window_key.to_string(),
                Entry {
                    value: Value::Window(Vec::new()),
                    expires_at: None,
                },
            );
        }
        let entry = map
            .get_mut(window_key)
            .ok_or_else(|| wrong_type(window_key))?;
        let Value::Window(window) = &mut entry.value else {
            return Err(wrong_type(window_key));
        };

        let floor = hit.now_ms - hit.window_ms;
        window.retain(|(score, _)| *score >= floor);

        let mut allowed = false;
        let mut block = blocked_until;
        if blocked_until.is_none() {
            if window.len() as u64 + hit.cost <= hit.max_count {
                for n in 1..=hit.cost {
                    window.push((hit.now_ms, format!("{}:{}", hit.member, n)));
                }
                entry.expires_at = expiry_after(now, Duration::from_millis(hit.window_ms as u64));
                allowed = true;
            } else {
                block = Some(hit.now_ms + hit.cooldown_ms);
            }
        }

        let count = window.len() as u64;
        let oldest_ms = window.iter().map(|(score, _)| *score).min();
        if window.is_empty() {
            map.remove(window_key);
        }

        if !allowed && blocked_until.is_none() && hit.cooldown_ms > 0 {
            if let Some(until) = block {
                map.insert(
                    block_key.to_string(),
                    Entry {
                        value: Value::Text(until.to_string()),
                        expires_at: expiry_after(
                            now,
                            Duration::from_millis(hit.cooldown_ms as u64),
                        ),
                    },
                );
            }
        }

        Ok(HitOutcome {
            allowed,
            count,
            oldest_ms,
            blocked_until_ms: if allowed { None } else { block },
        })
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.lock().map(|_| ())
    }
}
