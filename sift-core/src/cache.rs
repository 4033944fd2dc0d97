use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::fingerprint::{ContentFingerprinter, Fingerprint};
use crate::ports::ContentSource;
use crate::store::{self, CoordinationStore, StoreKeys};
use crate::types::{EntityId, SweepFilter};

/// Last analysis of one entity. Never expires; only `force_refresh`
/// bypasses it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub entity_id: EntityId,
    pub content_hash: String,
    pub item_count: usize,
    pub result_count: u64,
    pub last_analyzed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Unchanged,
    ForceRefresh,
    NoCache,
    NoContent,
    HashChanged,
    ItemCountChanged,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Unchanged => "unchanged",
            SkipReason::ForceRefresh => "force_refresh",
            SkipReason::NoCache => "no_cache",
            SkipReason::NoContent => "no_content",
            SkipReason::HashChanged => "hash_changed",
            SkipReason::ItemCountChanged => "item_count_changed",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`AnalysisCache::should_skip`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipDecision {
    pub skip: bool,
    pub reason: SkipReason,
    /// Freshly computed fingerprint, reused by the following `update`.
    pub fingerprint: Fingerprint,
    /// Findings recorded by the previous analysis, when one exists.
    pub cached_result_count: Option<u64>,
}

/// Content-addressed memo of per-entity analysis results.
#[derive(Clone)]
pub struct AnalysisCache {
    store: Arc<dyn CoordinationStore>,
    content: Arc<dyn ContentSource>,
    keys: StoreKeys,
    fingerprinter: ContentFingerprinter,
}

impl fmt::Debug for AnalysisCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisCache")
            .field("keys", &self.keys)
            .field("sample_limit", &self.fingerprinter.sample_limit())
            .finish()
    }
}

impl AnalysisCache {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        content: Arc<dyn ContentSource>,
        keys: StoreKeys,
        fingerprinter: ContentFingerprinter,
    ) -> Self {
        Self {
            store,
            content,
            keys,
            fingerprinter,
        }
    }

    pub async fn fingerprint(
        &self,
        entity: EntityId,
        filter: &SweepFilter,
    ) -> Result<Fingerprint> {
        let items = self
            .content
            .content(
                entity,
                filter.document_ids.as_ref(),
                Some(self.fingerprinter.sample_limit()),
            )
            .await?;
        Ok(self.fingerprinter.fingerprint(&items))
    }

    pub async fn get(&self, entity: EntityId) -> Result<Option<CacheEntry>> {
        store::get_json(self.store.as_ref(), &self.keys.cache_entry(entity))
            .await
    }

    pub async fn should_skip(
        &self,
        entity: EntityId,
        filter: &SweepFilter,
        force_refresh: bool,
    ) -> Result<SkipDecision> {
        let fingerprint = self.fingerprint(entity, filter).await?;
        let cached = self.get(entity).await?;
        let cached_result_count = cached.as_ref().map(|entry| entry.result_count);

        let reason = match (&cached, force_refresh) {
            (_, true) => SkipReason::ForceRefresh,
            (None, false) => SkipReason::NoCache,
            (Some(_), false) if fingerprint.is_empty() => SkipReason::NoContent,
            (Some(entry), false) if entry.content_hash != fingerprint.hash => {
                SkipReason::HashChanged
            }
            (Some(entry), false) if entry.item_count != fingerprint.item_count => {
                SkipReason::ItemCountChanged
            }
            (Some(_), false) => SkipReason::Unchanged,
        };

        let decision = SkipDecision {
            skip: reason == SkipReason::Unchanged,
            reason,
            fingerprint,
            cached_result_count,
        };
        debug!(
            target: "sift::cache",
            entity = %entity,
            skip = decision.skip,
            reason = %decision.reason,
            "cache decision"
        );
        Ok(decision)
    }

    /// Record a fresh analysis, replacing any previous entry.
    pub async fn update(
        &self,
        entity: EntityId,
        fingerprint: &Fingerprint,
        result_count: u64,
    ) -> Result<CacheEntry> {
        let entry = CacheEntry {
            entity_id: entity,
            content_hash: fingerprint.hash.clone(),
            item_count: fingerprint.item_count,
            result_count,
            last_analyzed_at: Utc::now(),
        };
        store::set_json(
            self.store.as_ref(),
            &self.keys.cache_entry(entity),
            &entry,
            None,
        )
        .await?;
        Ok(entry)
    }
}
