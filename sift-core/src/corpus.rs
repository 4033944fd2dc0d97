use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::error::{Result, SiftError};
use crate::ports::{CandidateSource, ContentItem, ContentSource};
use crate::types::{DocumentId, EntityId, SweepFilter};

#[derive(Debug, Deserialize)]
struct CorpusFile {
    entities: Vec<CorpusEntity>,
}

#[derive(Debug, Deserialize)]
struct CorpusEntity {
    id: EntityId,
    #[serde(default)]
    items: Vec<ContentItem>,
}

/// File-backed corpus serving both candidate ids and entity content.
///
/// ```json
/// { "entities": [ { "id": 1, "items": [ { "id": 1, "document_id": 3, "text": "..." } ] } ] }
/// ```
#[derive(Debug, Clone, Default)]
pub struct JsonCorpus {
    entities: BTreeMap<EntityId, Vec<ContentItem>>,
}

impl JsonCorpus {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await?;
        let corpus = Self::from_json(&raw)
            .map_err(|e| SiftError::Candidates(format!("{}: {e}", path.display())))?;
        info!(
            target: "sift::corpus",
            path = %path.display(),
            entities = corpus.entities.len(),
            "corpus loaded"
        );
        Ok(corpus)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let file: CorpusFile = serde_json::from_str(raw)?;
        let mut entities: BTreeMap<EntityId, Vec<ContentItem>> = BTreeMap::new();
        for entity in file.entities {
            entities.entry(entity.id).or_default().extend(entity.items);
        }
        for items in entities.values_mut() {
            items.sort_by_key(|item| (item.document_id, item.id));
        }
        Ok(Self { entities })
    }

    pub fn insert(&mut self, entity: EntityId, items: Vec<ContentItem>) {
        let mut items = items;
        items.sort_by_key(|item| (item.document_id, item.id));
        self.entities.insert(entity, items);
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[async_trait]
impl CandidateSource for JsonCorpus {
    async fn candidate_ids(&self, filter: &SweepFilter) -> Result<Vec<EntityId>> {
        Ok(self
            .entities
            .iter()
            .filter(|(id, _)| filter.admits_entity(**id))
            .filter(|(_, items)| {
                filter.document_ids.is_none()
                    || items.iter().any(|item| filter.admits_document(item.document_id))
            })
            .map(|(id, _)| *id)
            .collect())
    }
}

#[async_trait]
impl ContentSource for JsonCorpus {
    async fn content(
        &self,
        entity: EntityId,
        documents: Option<&BTreeSet<DocumentId>>,
        limit: Option<usize>,
    ) -> Result<Vec<ContentItem>> {
        let Some(items) = self.entities.get(&entity) else {
            return Ok(Vec::new());
        };
        let selected = items
            .iter()
            .filter(|item| documents.is_none_or(|docs| docs.contains(&item.document_id)))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "entities": [
            { "id": 3, "items": [ { "id": 2, "document_id": 20, "text": "late" },
                                  { "id": 1, "document_id": 10, "text": "early" } ] },
            { "id": 1, "items": [ { "id": 1, "document_id": 20, "text": "only" } ] },
            { "id": 2, "items": [] }
        ]
    }"#;

    #[tokio::test]
    async fn candidates_are_sorted_and_filtered() {
        let corpus = JsonCorpus::from_json(SAMPLE).unwrap();
        assert_eq!(
            corpus.candidate_ids(&SweepFilter::all()).await.unwrap(),
            vec![EntityId(1), EntityId(2), EntityId(3)]
        );

        let by_doc = SweepFilter::all().with_documents([DocumentId(10)]);
        assert_eq!(corpus.candidate_ids(&by_doc).await.unwrap(), vec![EntityId(3)]);

        let by_entity = SweepFilter::all().with_entities([EntityId(2), EntityId(9)]);
        assert_eq!(
            corpus.candidate_ids(&by_entity).await.unwrap(),
            vec![EntityId(2)]
        );
    }

    #[tokio::test]
    async fn content_is_ordered_and_bounded() {
        let corpus = JsonCorpus::from_json(SAMPLE).unwrap();
        let items = corpus.content(EntityId(3), None, None).await.unwrap();
        let texts: Vec<_> = items.iter().map(|i| i.text.as_str()).collect();
        assert_eq!(texts, vec!["early", "late"]);

        let first = corpus.content(EntityId(3), None, Some(1)).await.unwrap();
        assert_eq!(first.len(), 1);

        let docs = BTreeSet::from([DocumentId(20)]);
        let scoped = corpus.content(EntityId(3), Some(&docs), None).await.unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].text, "late");

        assert!(corpus.content(EntityId(99), None, None).await.unwrap().is_empty());
    }
}
