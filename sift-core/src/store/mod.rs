//! Shared coordination store.
//!
//! Every piece of sweep state (worker records, the batch ledger, cache
//! entries, job status and control signals) lives behind
//! [`CoordinationStore`]. Components never hold authoritative state in
//! process memory.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};

use crate::error::{Result, SiftError};

pub mod keys;
pub mod memory;
#[cfg(feature = "redis-backend")]
pub mod redis;

pub use keys::StoreKeys;
pub use memory::InMemoryStore;
#[cfg(feature = "redis-backend")]
pub use self::redis::RedisStore;

/// Key/value and hash operations with explicit TTLs.
///
/// Failures surface as [`SiftError::Store`]; callers must not swallow them.
#[async_trait]
pub trait CoordinationStore: Send + Sync + fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a string value, replacing any previous value and TTL.
    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<()>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Returns whether the key existed to receive the TTL.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Merge fields into a hash, then (re)apply `ttl` to the whole record.
    async fn hset_fields(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Option<Duration>,
    ) -> Result<()>;

    /// Like [`hset_fields`](Self::hset_fields) but only for a hash that
    /// already exists, checked and written as one step. Returns `false`
    /// without writing when the key is absent.
    async fn hset_existing(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Option<Duration>,
    ) -> Result<bool>;

    /// Empty map when the key is absent.
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    /// All live keys starting with `prefix`, in no particular order.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Read a JSON document stored under `key`.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn CoordinationStore,
    key: &str,
) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| SiftError::corrupt(key, e.to_string())),
        None => Ok(None),
    }
}

pub async fn set_json<T: Serialize + ?Sized>(
    store: &dyn CoordinationStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw, ttl).await
}

/// Typed access to the fields of a flat hash record.
pub(crate) struct HashFields<'a> {
    key: &'a str,
    fields: &'a HashMap<String, String>,
}

impl<'a> HashFields<'a> {
    pub(crate) fn new(key: &'a str, fields: &'a HashMap<String, String>) -> Self {
        Self { key, fields }
    }

    pub(crate) fn corrupt(&self, field: &str, reason: impl fmt::Display) -> SiftError {
        SiftError::corrupt(self.key, format!("{field}: {reason}"))
    }

    pub(crate) fn required(&self, field: &str) -> Result<&'a str> {
        self.fields
            .get(field)
            .map(String::as_str)
            .ok_or_else(|| self.corrupt(field, "missing"))
    }

    /// Absent and empty fields both read as `None`.
    pub(crate) fn optional(&self, field: &str) -> Option<&'a str> {
        self.fields
            .get(field)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    pub(crate) fn parse<T>(&self, field: &str) -> Result<T>
    where
        T: std::str::FromStr,
        T::Err: fmt::Display,
    {
        self.required(field)?
            .parse::<T>()
            .map_err(|e| self.corrupt(field, e))
    }

    pub(crate) fn parse_optional<T>(&self, field: &str) -> Result<Option<T>>
    where
        T: std::str::FromStr,
        T::Err: fmt::Display,
    {
        self.optional(field)
            .map(|raw| raw.parse::<T>().map_err(|e| self.corrupt(field, e)))
            .transpose()
    }

    pub(crate) fn timestamp(&self, field: &str) -> Result<chrono::DateTime<chrono::Utc>> {
        parse_timestamp(self.required(field)?).map_err(|e| self.corrupt(field, e))
    }

    pub(crate) fn timestamp_optional(
        &self,
        field: &str,
    ) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
        self.optional(field)
            .map(|raw| parse_timestamp(raw).map_err(|e| self.corrupt(field, e)))
            .transpose()
    }
}

fn parse_timestamp(
    raw: &str,
) -> std::result::Result<chrono::DateTime<chrono::Utc>, chrono::ParseError> {
    chrono::DateTime::parse_from_rfc3339(raw).map(|ts| ts.with_timezone(&chrono::Utc))
}
