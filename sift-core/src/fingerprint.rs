use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ports::ContentItem;

/// Content hash of an entity's sampled items plus how many were sampled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub hash: String,
    pub item_count: usize,
}

impl Fingerprint {
    pub fn is_empty(&self) -> bool {
        self.item_count == 0
    }
}

/// Deterministic SHA-256 over an ordered, bounded content sample.
#[derive(Debug, Clone, Copy)]
pub struct ContentFingerprinter {
    sample_limit: usize,
}

impl Default for ContentFingerprinter {
    fn default() -> Self {
        Self::new(50)
    }
}

impl ContentFingerprinter {
    pub fn new(sample_limit: usize) -> Self {
        Self { sample_limit }
    }

    pub fn sample_limit(&self) -> usize {
        self.sample_limit
    }

    /// Items are ordered by `(document_id, id)` and only the first
    /// `sample_limit` contribute, so the hash does not depend on the order
    /// the source returned them in.
    #[must_use]
    pub fn fingerprint(&self, items: &[ContentItem]) -> Fingerprint {
        let mut ordered: Vec<&ContentItem> = items.iter().collect();
        ordered.sort_by_key(|item| (item.document_id, item.id));
        ordered.truncate(self.sample_limit);

        let mut hasher = Sha256::new();
        for item in &ordered {
            // Length-prefix the text so adjacent items cannot alias.
            hasher.update(item.document_id.0.to_le_bytes());
            hasher.update(item.id.to_le_bytes());
            hasher.update((item.text.len() as u64).to_le_bytes());
            hasher.update(item.text.as_bytes());
        }

        Fingerprint {
            hash: hex::encode(hasher.finalize()),
            item_count: ordered.len(),
        }
    }
}
