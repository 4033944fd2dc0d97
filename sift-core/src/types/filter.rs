use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::ids::{DocumentId, EntityId};

/// Restricts a sweep to a subset of the corpus.
///
/// `entity_ids` limits the candidates directly; `document_ids` limits both
/// the candidates (entities with content in those documents) and the content
/// each entity is fingerprinted and analyzed against.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_ids: Option<BTreeSet<EntityId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_ids: Option<BTreeSet<DocumentId>>,
}

impl SweepFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_entities(mut self, ids: impl IntoIterator<Item = EntityId>) -> Self {
        self.entity_ids = Some(ids.into_iter().collect());
        self
    }

    pub fn with_documents(mut self, ids: impl IntoIterator<Item = DocumentId>) -> Self {
        self.document_ids = Some(ids.into_iter().collect());
        self
    }

    pub fn is_unfiltered(&self) -> bool {
        self.entity_ids.is_none() && self.document_ids.is_none()
    }

    pub fn admits_entity(&self, id: EntityId) -> bool {
        self.entity_ids.as_ref().is_none_or(|ids| ids.contains(&id))
    }

    pub fn admits_document(&self, id: DocumentId) -> bool {
        self.document_ids.as_ref().is_none_or(|ids| ids.contains(&id))
    }

    /// Stable key identifying the candidate scope this filter selects. The
    /// ledger re-plans when the scope changes.
    pub fn scope_key(&self) -> String {
        if self.is_unfiltered() {
            return "all".to_string();
        }

        let mut hasher = Sha256::new();
        if let Some(ids) = &self.entity_ids {
            hasher.update(b"entities:");
            for id in ids {
                hasher.update(id.0.to_le_bytes());
            }
        }
        if let Some(ids) = &self.document_ids {
            hasher.update(b"documents:");
            for id in ids {
                hasher.update(id.0.to_le_bytes());
            }
        }
        let digest = hasher.finalize();
        format!("filtered:{}", hex::encode(&digest[..8]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_key_ignores_insertion_order() {
        let a = SweepFilter::all().with_entities([EntityId(3), EntityId(1)]);
        let b = SweepFilter::all().with_entities([EntityId(1), EntityId(3)]);
        assert_eq!(a.scope_key(), b.scope_key());
        assert_ne!(a.scope_key(), SweepFilter::all().scope_key());
    }

    #[test]
    fn entity_and_document_scopes_differ() {
        let entities = SweepFilter::all().with_entities([EntityId(7)]);
        let documents = SweepFilter::all().with_documents([DocumentId(7)]);
        assert_ne!(entities.scope_key(), documents.scope_key());
    }

    #[test]
    fn unfiltered_admits_everything() {
        let filter = SweepFilter::all();
        assert!(filter.admits_entity(EntityId(99)));
        assert!(filter.admits_document(DocumentId(12)));
        assert_eq!(filter.scope_key(), "all");
    }
}
