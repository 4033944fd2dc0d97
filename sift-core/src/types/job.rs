use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::filter::SweepFilter;
use super::ids::{EntityId, JobId};

/// Queue payload for one batch run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SweepJob {
    pub job_id: JobId,
    pub batch_number: u32,
    /// Entities to process, in ascending order.
    pub entity_ids: Vec<EntityId>,
    #[serde(default)]
    pub filter: SweepFilter,
    #[serde(default)]
    pub force_refresh: bool,
    #[serde(default)]
    pub auto_continue: bool,
    pub enqueued_at: DateTime<Utc>,
}

impl SweepJob {
    pub fn total(&self) -> usize {
        self.entity_ids.len()
    }
}

/// Options shared by every way of starting a batch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepRequest {
    #[serde(default)]
    pub filter: SweepFilter,
    #[serde(default)]
    pub force_refresh: bool,
    #[serde(default)]
    pub auto_continue: bool,
}

impl SweepRequest {
    pub fn new(filter: SweepFilter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    pub fn force_refresh(mut self, force: bool) -> Self {
        self.force_refresh = force;
        self
    }

    pub fn auto_continue(mut self, auto: bool) -> Self {
        self.auto_continue = auto;
        self
    }
}
