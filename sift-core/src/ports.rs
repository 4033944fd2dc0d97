//! Narrow interfaces to the collaborators a sweep consumes.

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{DocumentId, EntityId, SweepFilter};

/// One unit of content associated with an entity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: i64,
    pub document_id: DocumentId,
    pub text: String,
}

/// Opaque analyzer output. Only the count matters to the orchestrator.
pub type Finding = serde_json::Value;

/// Resolves the candidate entity set for a filter.
#[async_trait]
pub trait CandidateSource: Send + Sync + fmt::Debug {
    /// Candidate ids sorted ascending without duplicates.
    async fn candidate_ids(&self, filter: &SweepFilter)
    -> Result<Vec<EntityId>>;
}

#[async_trait]
pub trait ContentSource: Send + Sync + fmt::Debug {
    /// Content for `entity`, ordered by `(document_id, id)`, restricted to
    /// `documents` when given and truncated to `limit` when given.
    async fn content(
        &self,
        entity: EntityId,
        documents: Option<&BTreeSet<DocumentId>>,
        limit: Option<usize>,
    ) -> Result<Vec<ContentItem>>;
}

#[derive(Clone, Debug, Serialize)]
pub struct AnalysisRequest {
    pub entity_id: EntityId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_ids: Option<Vec<DocumentId>>,
    pub items: Vec<ContentItem>,
}

/// The slow, possibly failing per-entity analysis call.
#[async_trait]
pub trait Analyzer: Send + Sync + fmt::Debug {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<Vec<Finding>>;
}
