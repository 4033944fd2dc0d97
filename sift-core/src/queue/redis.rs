use std::fmt;

use async_trait::async_trait;
use redis::{AsyncCommands, aio::ConnectionManager};
use tracing::{debug, warn};

use super::JobQueue;
use crate::error::{Result, SiftError};
use crate::store::StoreKeys;
use crate::types::SweepJob;

/// Redis list per queue name: producers `LPUSH`, workers `RPOP`.
///
/// Workers poll rather than block so a single multiplexed connection can be
/// shared with the coordination store.
#[derive(Clone)]
pub struct RedisJobQueue {
    conn: ConnectionManager,
    keys: StoreKeys,
}

impl fmt::Debug for RedisJobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisJobQueue")
            .field("prefix", &self.keys.prefix())
            .finish()
    }
}

impl RedisJobQueue {
    pub fn new(conn: ConnectionManager, keys: StoreKeys) -> Self {
        Self { conn, keys }
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, queue: &str, job: &SweepJob) -> Result<()> {
        let payload = serde_json::to_string(job)?;
        let mut conn = self.conn.clone();
        let depth: i64 = conn.lpush(self.keys.queue(queue), payload).await?;
        debug!(
            target: "sift::queue",
            queue,
            job_id = %job.job_id,
            batch = job.batch_number,
            depth,
            "job enqueued"
        );
        Ok(())
    }

    async fn dequeue(&self, queues: &[String]) -> Result<Option<SweepJob>> {
        let mut conn = self.conn.clone();
        for name in queues {
            let key = self.keys.queue(name);
            let raw: Option<String> = conn.rpop(&key, None).await?;
            let Some(raw) = raw else { continue };
            match serde_json::from_str::<SweepJob>(&raw) {
                Ok(job) => return Ok(Some(job)),
                Err(err) => {
                    // Drop the payload; leaving it would wedge the queue.
                    warn!(
                        target: "sift::queue",
                        queue = %name,
                        error = %err,
                        "discarding undecodable job payload"
                    );
                    return Err(SiftError::corrupt(key, err.to_string()));
                }
            }
        }
        Ok(None)
    }

    async fn depth(&self, queue: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(self.keys.queue(queue)).await?;
        Ok(len)
    }
}
