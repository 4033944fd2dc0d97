use crate::types::{EntityId, JobId, WorkerId};

/// Builds namespaced coordination-store keys.
#[derive(Debug, Clone)]
pub struct StoreKeys {
    prefix: String,
}

impl Default for StoreKeys {
    fn default() -> Self {
        Self::new("sift")
    }
}

impl StoreKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let prefix = prefix.trim_end_matches(':').to_string();
        Self { prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn worker(&self, id: &WorkerId) -> String {
        format!("{}:worker:{id}", self.prefix)
    }

    pub fn worker_prefix(&self) -> String {
        format!("{}:worker:", self.prefix)
    }

    pub fn ledger_meta(&self) -> String {
        format!("{}:ledger:meta", self.prefix)
    }

    pub fn batch(&self, batch_number: u32) -> String {
        format!("{}:ledger:batch:{batch_number}", self.prefix)
    }

    pub fn batch_prefix(&self) -> String {
        format!("{}:ledger:batch:", self.prefix)
    }

    pub fn cache_entry(&self, entity: EntityId) -> String {
        format!("{}:cache:entity:{entity}", self.prefix)
    }

    pub fn job_status(&self, job: JobId) -> String {
        format!("{}:job:{job}:status", self.prefix)
    }

    pub fn job_control(&self, job: JobId) -> String {
        format!("{}:job:{job}:control", self.prefix)
    }

    pub fn queue(&self, name: &str) -> String {
        format!("{}:queue:{name}", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_share_the_configured_namespace() {
        let keys = StoreKeys::new("tenant-a:");
        assert_eq!(keys.batch(3), "tenant-a:ledger:batch:3");
        assert!(keys.batch(3).starts_with(&keys.batch_prefix()));
        assert_eq!(keys.cache_entry(EntityId(42)), "tenant-a:cache:entity:42");
        assert_eq!(keys.queue("analysis"), "tenant-a:queue:analysis");
    }
}
