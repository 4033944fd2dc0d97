use std::collections::{HashMap, VecDeque};
use std::fmt;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::JobQueue;
use crate::error::Result;
use crate::types::SweepJob;

/// In-process queue for tests and single-process mode.
///
/// Keeps a log of every enqueued job so callers can assert on what was
/// scheduled.
#[derive(Default)]
pub struct InProcJobQueue {
    queues: Mutex<HashMap<String, VecDeque<SweepJob>>>,
    history: Mutex<Vec<(String, SweepJob)>>,
}

impl fmt::Debug for InProcJobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let depth = self
            .queues
            .try_lock()
            .ok()
            .map(|guard| guard.values().map(VecDeque::len).sum::<usize>());
        f.debug_struct("InProcJobQueue")
            .field("pending", &depth)
            .finish()
    }
}

impl InProcJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every job ever enqueued, oldest first.
    pub async fn enqueued(&self) -> Vec<SweepJob> {
        self.history
            .lock()
            .await
            .iter()
            .map(|(_, job)| job.clone())
            .collect()
    }
}

#[async_trait]
impl JobQueue for InProcJobQueue {
    async fn enqueue(&self, queue: &str, job: &SweepJob) -> Result<()> {
        self.queues
            .lock()
            .await
            .entry(queue.to_string())
            .or_default()
            .push_back(job.clone());
        self.history
            .lock()
            .await
            .push((queue.to_string(), job.clone()));
        Ok(())
    }

    async fn dequeue(&self, queues: &[String]) -> Result<Option<SweepJob>> {
        let mut guard = self.queues.lock().await;
        for name in queues {
            if let Some(job) =
                guard.get_mut(name).and_then(VecDeque::pop_front)
            {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    async fn depth(&self, queue: &str) -> Result<usize> {
        Ok(self
            .queues
            .lock()
            .await
            .get(queue)
            .map_or(0, VecDeque::len))
    }
}
