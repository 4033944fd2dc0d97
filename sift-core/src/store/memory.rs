use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::CoordinationStore;
use crate::error::{Result, SiftError};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Process-local store for tests and single-process deployments.
///
/// TTLs follow the tokio clock, so paused-time tests observe expiry
/// deterministically.
#[derive(Default)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.entries.try_lock().ok().map(|guard| guard.len());
        f.debug_struct("InMemoryStore").field("entries", &len).finish()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining TTL of a live key, `None` when absent or persistent.
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let guard = self.entries.lock().await;
        guard
            .get(key)
            .filter(|entry| entry.is_live(now))
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let guard = self.entries.lock().await;
        guard.values().filter(|entry| entry.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn purge_expired(entries: &mut HashMap<String, Entry>, now: Instant) {
    entries.retain(|_, entry| entry.is_live(now));
}

#[async_trait]
impl CoordinationStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let mut guard = self.entries.lock().await;
        purge_expired(&mut guard, now);
        match guard.get(key) {
            Some(Entry {
                value: Value::Str(raw),
                ..
            }) => Ok(Some(raw.clone())),
            Some(Entry {
                value: Value::Hash(_),
                ..
            }) => Err(SiftError::Store(format!(
                "WRONGTYPE key {key} holds a hash"
            ))),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let now = Instant::now();
        let mut guard = self.entries.lock().await;
        guard.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        let mut guard = self.entries.lock().await;
        purge_expired(&mut guard, now);
        Ok(guard.remove(key).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut guard = self.entries.lock().await;
        purge_expired(&mut guard, now);
        match guard.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        let guard = self.entries.lock().await;
        Ok(guard.get(key).is_some_and(|entry| entry.is_live(now)))
    }

    async fn hset_fields(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Option<Duration>,
    ) -> Result<()> {
        let now = Instant::now();
        let mut guard = self.entries.lock().await;
        purge_expired(&mut guard, now);
        let entry = guard.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        let Value::Hash(map) = &mut entry.value else {
            return Err(SiftError::Store(format!(
                "WRONGTYPE key {key} holds a string"
            )));
        };
        for (field, value) in fields {
            map.insert(field.clone(), value.clone());
        }
        if let Some(ttl) = ttl {
            entry.expires_at = Some(now + ttl);
        }
        Ok(())
    }

    async fn hset_existing(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let now = Instant::now();
        let mut guard = self.entries.lock().await;
        purge_expired(&mut guard, now);
        let Some(entry) = guard.get_mut(key) else {
            return Ok(false);
        };
        let Value::Hash(map) = &mut entry.value else {
            return Err(SiftError::Store(format!(
                "WRONGTYPE key {key} holds a string"
            )));
        };
        for (field, value) in fields {
            map.insert(field.clone(), value.clone());
        }
        if let Some(ttl) = ttl {
            entry.expires_at = Some(now + ttl);
        }
        Ok(true)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let now = Instant::now();
        let mut guard = self.entries.lock().await;
        purge_expired(&mut guard, now);
        match guard.get(key) {
            Some(Entry {
                value: Value::Hash(map),
                ..
            }) => Ok(map.clone()),
            Some(Entry {
                value: Value::Str(_),
                ..
            }) => Err(SiftError::Store(format!(
                "WRONGTYPE key {key} holds a string"
            ))),
            None => Ok(HashMap::new()),
        }
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut guard = self.entries.lock().await;
        purge_expired(&mut guard, now);
        Ok(guard
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}
