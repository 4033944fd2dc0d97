use std::fmt;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::SiftConfig;
use crate::error::Result;
use crate::liveness::WorkerRecord;
use crate::orchestrator::{RunSummary, SweepOrchestrator};
use crate::types::SweepJob;

/// Long-running analyzer worker: registers itself, heartbeats and drains
/// its queues one job at a time.
pub struct QueueWorker {
    orchestrator: SweepOrchestrator,
    queues: Vec<String>,
    poll_interval: Duration,
    job_timeout: Duration,
}

impl fmt::Debug for QueueWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueWorker")
            .field("queues", &self.queues)
            .field("poll_interval", &self.poll_interval)
            .field("job_timeout", &self.job_timeout)
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub jobs_run: usize,
    pub jobs_failed: usize,
}

impl QueueWorker {
    pub fn new(
        orchestrator: SweepOrchestrator,
        queues: Vec<String>,
        config: &SiftConfig,
    ) -> Self {
        let queues = if queues.is_empty() {
            vec![config.queue.default_queue.clone()]
        } else {
            queues
        };
        Self {
            orchestrator,
            queues,
            poll_interval: config.queue.poll_interval(),
            job_timeout: config.sweep.job_timeout(),
        }
    }

    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    /// Serve until `shutdown` fires. The in-flight job observes the same
    /// token and settles as `stopped` before the worker deregisters.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<WorkerStats> {
        self.serve(shutdown, false).await
    }

    /// Process queued jobs until the queues are empty, then return. Jobs
    /// enqueued by auto-continue are picked up too.
    pub async fn drain(&self, shutdown: CancellationToken) -> Result<WorkerStats> {
        self.serve(shutdown, true).await
    }

    async fn serve(&self, shutdown: CancellationToken, until_idle: bool) -> Result<WorkerStats> {
        let registry = self.orchestrator.registry();
        let record = WorkerRecord::for_current_process(self.queues.iter().cloned());
        registry.register(&record).await?;

        let (activity, activity_rx) = watch::channel(None::<String>);
        let heartbeat_cancel = shutdown.child_token();
        let heartbeat =
            registry.spawn_heartbeat(record.clone(), activity_rx, heartbeat_cancel.clone());

        info!(
            target: "sift::worker",
            worker_id = %record.worker_id,
            queues = ?self.queues,
            "worker started"
        );

        let mut stats = WorkerStats::default();
        while !shutdown.is_cancelled() {
            match self.orchestrator.queue().dequeue(&self.queues).await {
                Ok(Some(job)) => {
                    activity.send_replace(Some(format!(
                        "batch {} (job {})",
                        job.batch_number, job.job_id
                    )));
                    let ok = self.execute(&job, &shutdown).await;
                    activity.send_replace(None);
                    stats.jobs_run += 1;
                    if !ok {
                        stats.jobs_failed += 1;
                    }
                    continue;
                }
                Ok(None) if until_idle => break,
                Ok(None) => {}
                Err(err) => {
                    warn!(target: "sift::worker", error = %err, "dequeue failed");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        heartbeat_cancel.cancel();
        if let Err(err) = heartbeat.await {
            warn!(target: "sift::worker", error = %err, "heartbeat task panicked");
        }
        registry.deregister(&record.worker_id).await?;

        info!(
            target: "sift::worker",
            worker_id = %record.worker_id,
            jobs_run = stats.jobs_run,
            jobs_failed = stats.jobs_failed,
            "worker stopped"
        );
        Ok(stats)
    }

    /// Run one job under the per-job timeout. Returns whether it finished
    /// without a worker-level failure.
    async fn execute(&self, job: &SweepJob, shutdown: &CancellationToken) -> bool {
        let run = self.orchestrator.run_batch(job, shutdown);
        match tokio::time::timeout(self.job_timeout, run).await {
            Ok(Ok(summary)) => {
                log_summary(&summary);
                true
            }
            Ok(Err(err)) => {
                error!(
                    target: "sift::worker",
                    job_id = %job.job_id,
                    batch = job.batch_number,
                    error = %err,
                    "job failed"
                );
                false
            }
            Err(_) => {
                let reason = format!(
                    "job exceeded worker timeout of {}",
                    humantime::format_duration(self.job_timeout)
                );
                warn!(target: "sift::worker", job_id = %job.job_id, reason = %reason, "abandoning job");
                if let Err(err) = self.orchestrator.abandon(job, &reason).await {
                    error!(target: "sift::worker", job_id = %job.job_id, error = %err, "could not settle abandoned job");
                }
                false
            }
        }
    }
}

fn log_summary(summary: &RunSummary) {
    info!(
        target: "sift::worker",
        job_id = %summary.job_id,
        batch = summary.batch_number,
        state = %summary.state,
        processed = summary.processed,
        found = summary.found,
        skipped = summary.skipped,
        next_job = ?summary.next_job,
        "job finished"
    );
}
