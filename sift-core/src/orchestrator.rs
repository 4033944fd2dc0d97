//! Sweep orchestrator.
//!
//! Drives one batch at a time: consults the analysis cache per entity,
//! checks the control plane before every item, takes cooldowns, enforces the
//! runtime ceiling and settles the batch in the ledger. With auto-continue
//! a completed batch enqueues the next pending one.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::AnalysisCache;
use crate::config::{SiftConfig, SweepConfig};
use crate::control::{
    ControlSignal, JobControlPlane, JobState, JobStatus, StatusUpdate,
};
use crate::error::{Result, SiftError};
use crate::fingerprint::ContentFingerprinter;
use crate::ledger::{BatchLedger, BatchOverview, BatchStart};
use crate::liveness::{ActiveWorker, TerminationReport, WorkerRegistry, WorkerSelector};
use crate::ports::{AnalysisRequest, Analyzer, CandidateSource, ContentSource};
use crate::queue::JobQueue;
use crate::store::{CoordinationStore, StoreKeys};
use crate::types::{EntityId, JobId, SweepFilter, SweepJob, SweepRequest};

/// Collaborators injected into the orchestrator.
#[derive(Clone)]
pub struct SweepDeps {
    pub store: Arc<dyn CoordinationStore>,
    pub queue: Arc<dyn JobQueue>,
    pub candidates: Arc<dyn CandidateSource>,
    pub content: Arc<dyn ContentSource>,
    pub analyzer: Arc<dyn Analyzer>,
}

impl fmt::Debug for SweepDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SweepDeps")
            .field("store", &self.store)
            .field("queue", &self.queue)
            .field("candidates", &self.candidates)
            .field("content", &self.content)
            .field("analyzer", &self.analyzer)
            .finish()
    }
}

/// Final accounting for one `run_batch` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub job_id: JobId,
    pub batch_number: u32,
    /// Terminal job state the run ended in.
    pub state: JobState,
    pub total: u64,
    pub processed: u64,
    pub found: u64,
    pub skipped: u64,
    pub error: Option<String>,
    /// Job enqueued by auto-continue, if any.
    pub next_job: Option<JobId>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    processed: u64,
    found: u64,
    skipped: u64,
}

impl Counters {
    fn update(&self) -> StatusUpdate {
        StatusUpdate::progress(self.processed, self.found, self.skipped)
    }
}

#[derive(Debug)]
enum Ending {
    Complete,
    Stopped,
    Timeout,
    Shutdown,
    Fatal(SiftError),
}

#[derive(Clone)]
pub struct SweepOrchestrator {
    sweep: SweepConfig,
    default_queue: String,
    ledger: BatchLedger,
    cache: AnalysisCache,
    control: JobControlPlane,
    registry: WorkerRegistry,
    content: Arc<dyn ContentSource>,
    analyzer: Arc<dyn Analyzer>,
    queue: Arc<dyn JobQueue>,
}

impl fmt::Debug for SweepOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SweepOrchestrator")
            .field("sweep", &self.sweep)
            .field("default_queue", &self.default_queue)
            .field("ledger", &self.ledger)
            .field("control", &self.control)
            .finish()
    }
}

impl SweepOrchestrator {
    pub fn new(deps: SweepDeps, config: &SiftConfig) -> Self {
        let keys = StoreKeys::new(config.store.key_prefix.clone());
        let ledger = BatchLedger::new(
            Arc::clone(&deps.store),
            keys.clone(),
            Arc::clone(&deps.candidates),
            Arc::clone(&deps.queue),
            config.queue.default_queue.clone(),
            config.sweep.batch_size,
        );
        let cache = AnalysisCache::new(
            Arc::clone(&deps.store),
            Arc::clone(&deps.content),
            keys.clone(),
            ContentFingerprinter::new(config.cache.sample_limit),
        );
        let control = JobControlPlane::new(
            Arc::clone(&deps.store),
            keys.clone(),
            config.status,
            &config.sweep,
        );
        let registry =
            WorkerRegistry::new(Arc::clone(&deps.store), keys, config.liveness.clone());

        Self {
            sweep: config.sweep.clone(),
            default_queue: config.queue.default_queue.clone(),
            ledger,
            cache,
            control,
            registry,
            content: deps.content,
            analyzer: deps.analyzer,
            queue: deps.queue,
        }
    }

    /// Replace the worker registry, e.g. to inject a process signaller.
    pub fn with_registry(mut self, registry: WorkerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn ledger(&self) -> &BatchLedger {
        &self.ledger
    }

    pub fn cache(&self) -> &AnalysisCache {
        &self.cache
    }

    pub fn control(&self) -> &JobControlPlane {
        &self.control
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub fn sweep_config(&self) -> &SweepConfig {
        &self.sweep
    }

    /// Start the next pending (else incomplete) batch for the filter.
    /// Batches that resolve to no entities are completed in passing. Returns
    /// `None` once nothing is left to run.
    pub async fn queue_batch_sweep(
        &self,
        request: &SweepRequest,
    ) -> Result<Option<JobId>> {
        self.ledger.refresh(&request.filter).await?;
        while let Some(batch) = self.ledger.next_pending().await? {
            if let Some(job_id) =
                self.start_planned_batch(batch.batch_number, request).await?
            {
                return Ok(Some(job_id));
            }
        }
        info!(target: "sift::sweep", "no pending batches left");
        Ok(None)
    }

    /// Start a specific batch. Returns `None` when the batch was empty and
    /// completed immediately.
    pub async fn start_batch(
        &self,
        batch_number: u32,
        request: &SweepRequest,
    ) -> Result<Option<JobId>> {
        self.ledger.refresh(&request.filter).await?;
        self.start_planned_batch(batch_number, request).await
    }

    async fn start_planned_batch(
        &self,
        batch_number: u32,
        request: &SweepRequest,
    ) -> Result<Option<JobId>> {
        self.ledger.ensure_scope(&request.filter).await?;
        let record = self
            .ledger
            .get(batch_number)
            .await?
            .ok_or_else(|| SiftError::NotFound(format!("batch {batch_number}")))?;
        if !record.status.can_start() {
            return Err(SiftError::invalid_transition(
                format!("batch {batch_number}"),
                record.status,
                "running",
            ));
        }

        let job_id = JobId::new();
        self.control
            .create(job_id, record.entity_count as u64, Some(batch_number))
            .await?;

        match self.ledger.start(batch_number, job_id, request).await {
            Ok(BatchStart::Empty) => {
                self.control
                    .report(job_id, StatusUpdate::state(JobState::Complete).with_total(0))
                    .await?;
                Ok(None)
            }
            Ok(BatchStart::Enqueued(job)) => {
                if job.total() != record.entity_count {
                    self.control
                        .report(job_id, StatusUpdate::default().with_total(job.total() as u64))
                        .await?;
                }
                info!(
                    target: "sift::sweep",
                    job_id = %job_id,
                    batch = batch_number,
                    entities = job.total(),
                    force_refresh = request.force_refresh,
                    auto_continue = request.auto_continue,
                    "batch queued"
                );
                Ok(Some(job_id))
            }
            Err(err) => {
                let failed = StatusUpdate::state(JobState::Failed).with_error(err.to_string());
                if let Err(report_err) = self.control.report(job_id, failed).await {
                    warn!(target: "sift::sweep", job_id = %job_id, error = %report_err, "could not record failed start");
                }
                Err(err)
            }
        }
    }

    pub async fn get_job_status(&self, job_id: JobId) -> Result<JobStatus> {
        self.control
            .get_status(job_id)
            .await?
            .ok_or_else(|| SiftError::NotFound(format!("job {job_id}")))
    }

    async fn signal(&self, job_id: JobId, signal: ControlSignal) -> Result<()> {
        let status = self.get_job_status(job_id).await?;
        if status.status.is_terminal() {
            return Err(SiftError::invalid_transition(
                format!("job {job_id}"),
                status.status,
                signal,
            ));
        }
        self.control.set_control(job_id, signal).await
    }

    pub async fn pause(&self, job_id: JobId) -> Result<()> {
        self.signal(job_id, ControlSignal::Pause).await
    }

    pub async fn resume(&self, job_id: JobId) -> Result<()> {
        self.signal(job_id, ControlSignal::Run).await
    }

    pub async fn stop(&self, job_id: JobId) -> Result<()> {
        self.signal(job_id, ControlSignal::Stop).await
    }

    pub async fn get_batch_overview(&self, filter: &SweepFilter) -> Result<BatchOverview> {
        self.ledger.overview(filter).await
    }

    pub async fn reset_batches(&self) -> Result<usize> {
        self.ledger.reset_all().await
    }

    pub async fn list_active_workers(&self) -> Result<Vec<ActiveWorker>> {
        self.registry.list_active_and_reap().await
    }

    /// Launch a worker for `queues`, or the default queue when empty.
    pub async fn start_worker(&self, queues: &[String]) -> Result<u32> {
        if queues.is_empty() {
            self.registry.spawn(&[self.default_queue.clone()]).await
        } else {
            self.registry.spawn(queues).await
        }
    }

    pub async fn stop_all_workers(
        &self,
        selector: &WorkerSelector,
    ) -> Result<TerminationReport> {
        self.registry.terminate_all(selector).await
    }

    /// Worker entry point: process `job` to a terminal state.
    ///
    /// Per-entity analyzer failures are logged and counted as zero findings.
    /// Any other failure ends the run as `failed` and leaves the batch
    /// `incomplete`; store failures are additionally returned as errors.
    pub async fn run_batch(
        &self,
        job: &SweepJob,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        let job_id = job.job_id;
        let total = job.total() as u64;

        if self.control.get_status(job_id).await?.is_none() {
            // Status expired while the job sat in the queue.
            self.control.create(job_id, total, Some(job.batch_number)).await?;
        }
        self.control
            .report(
                job_id,
                StatusUpdate::state(JobState::Initializing).with_total(total),
            )
            .await?;
        self.control
            .report(job_id, StatusUpdate::state(JobState::Running))
            .await?;

        info!(
            target: "sift::sweep",
            job_id = %job_id,
            batch = job.batch_number,
            total,
            force_refresh = job.force_refresh,
            "batch run started"
        );

        let mut counters = Counters::default();
        let ending = self.drive(job, cancel, &mut counters).await;
        self.settle(job, ending, counters).await
    }

    async fn drive(
        &self,
        job: &SweepJob,
        cancel: &CancellationToken,
        counters: &mut Counters,
    ) -> Ending {
        let job_id = job.job_id;
        let started = tokio::time::Instant::now();
        let max_runtime = self.sweep.max_runtime();
        let cooldown_every = self.sweep.cooldown_entities as u64;
        let last_index = job.entity_ids.len().saturating_sub(1);

        for (index, entity) in job.entity_ids.iter().copied().enumerate() {
            if cancel.is_cancelled() {
                return Ending::Shutdown;
            }

            match self.checkpoint(job_id, cancel).await {
                Ok(ControlSignal::Stop) => return Ending::Stopped,
                Ok(_) => {}
                Err(SiftError::Cancelled(_)) => return Ending::Shutdown,
                Err(err) => return Ending::Fatal(err),
            }

            if started.elapsed() > max_runtime {
                return Ending::Timeout;
            }

            if let Err(err) = self
                .control
                .report(job_id, StatusUpdate::default().with_current(Some(entity)))
                .await
            {
                return Ending::Fatal(err);
            }

            if let Err(err) = self.process_entity(job, entity, counters).await {
                error!(
                    target: "sift::sweep",
                    job_id = %job_id,
                    entity = %entity,
                    error = %err,
                    "batch-fatal failure"
                );
                return Ending::Fatal(err);
            }
            counters.processed += 1;

            if let Err(err) = self.control.report(job_id, counters.update()).await {
                return Ending::Fatal(err);
            }

            let due = cooldown_every > 0 && counters.processed % cooldown_every == 0;
            if due && index < last_index {
                debug!(
                    target: "sift::sweep",
                    job_id = %job_id,
                    processed = counters.processed,
                    "cooldown"
                );
                match self.control.cooldown(job_id, cancel).await {
                    Ok(ControlSignal::Stop) => return Ending::Stopped,
                    Ok(_) => {}
                    Err(SiftError::Cancelled(_)) => return Ending::Shutdown,
                    Err(err) => return Ending::Fatal(err),
                }
            }
        }

        Ending::Complete
    }

    /// Per-item control check. A pause blocks here until resumed or stopped.
    async fn checkpoint(
        &self,
        job_id: JobId,
        cancel: &CancellationToken,
    ) -> Result<ControlSignal> {
        match self.control.get_control(job_id).await? {
            ControlSignal::Pause => self.control.wait_while_paused(job_id, cancel).await,
            signal => Ok(signal),
        }
    }

    async fn process_entity(
        &self,
        job: &SweepJob,
        entity: EntityId,
        counters: &mut Counters,
    ) -> Result<()> {
        let decision = self
            .cache
            .should_skip(entity, &job.filter, job.force_refresh)
            .await?;

        if decision.skip {
            counters.skipped += 1;
            counters.found += decision.cached_result_count.unwrap_or(0);
            return Ok(());
        }

        let items = self
            .content
            .content(entity, job.filter.document_ids.as_ref(), None)
            .await?;
        let request = AnalysisRequest {
            entity_id: entity,
            document_ids: job
                .filter
                .document_ids
                .as_ref()
                .map(|ids| ids.iter().copied().collect()),
            items,
        };

        match self.analyzer.analyze(&request).await {
            Ok(findings) => {
                let count = findings.len() as u64;
                self.cache.update(entity, &decision.fingerprint, count).await?;
                counters.found += count;
                debug!(
                    target: "sift::sweep",
                    job_id = %job.job_id,
                    entity = %entity,
                    findings = count,
                    reason = %decision.reason,
                    "entity analyzed"
                );
            }
            Err(err) => {
                warn!(
                    target: "sift::sweep",
                    job_id = %job.job_id,
                    entity = %entity,
                    error = %err,
                    "analysis failed; counting zero findings"
                );
            }
        }
        Ok(())
    }

    async fn settle(
        &self,
        job: &SweepJob,
        ending: Ending,
        counters: Counters,
    ) -> Result<RunSummary> {
        let job_id = job.job_id;
        let batch = job.batch_number;

        let (state, error, fatal) = match ending {
            Ending::Complete => (JobState::Complete, None, None),
            Ending::Stopped => (JobState::Stopped, Some("stopped by operator".to_string()), None),
            Ending::Timeout => (
                JobState::Timeout,
                Some(format!(
                    "runtime ceiling of {} minutes reached",
                    self.sweep.max_runtime_mins
                )),
                None,
            ),
            Ending::Shutdown => (JobState::Stopped, Some("worker shutdown".to_string()), None),
            Ending::Fatal(err) => (JobState::Failed, Some(err.to_string()), Some(err)),
        };

        let ledger_result = match &error {
            None => self.ledger.complete(batch, counters.found).await.map(|_| ()),
            Some(reason) => self.ledger.fail(batch, reason.clone()).await.map(|_| ()),
        };
        if let Err(err) = ledger_result {
            if err.is_store() && fatal.is_none() {
                return Err(err);
            }
            warn!(target: "sift::sweep", job_id = %job_id, batch, error = %err, "could not settle batch");
        }

        let mut update = counters
            .update()
            .with_state(state)
            .with_current(None);
        if state == JobState::Failed
            && let Some(reason) = &error
        {
            update = update.with_error(reason.clone());
        }
        if let Err(err) = self.control.report(job_id, update).await {
            if fatal.is_none() {
                return Err(err);
            }
            warn!(target: "sift::sweep", job_id = %job_id, error = %err, "could not record final status");
        }
        if state != JobState::Complete
            && let Err(err) = self.control.clear_control(job_id).await
        {
            warn!(target: "sift::sweep", job_id = %job_id, error = %err, "could not clear control signal");
        }

        info!(
            target: "sift::sweep",
            job_id = %job_id,
            batch,
            state = %state,
            processed = counters.processed,
            found = counters.found,
            skipped = counters.skipped,
            "batch run finished"
        );

        if let Some(err) = fatal
            && err.is_store()
        {
            return Err(err);
        }

        let next_job = if state == JobState::Complete && job.auto_continue {
            let request = SweepRequest {
                filter: job.filter.clone(),
                force_refresh: job.force_refresh,
                auto_continue: true,
            };
            match self.queue_batch_sweep(&request).await {
                Ok(next) => next,
                Err(SiftError::ScopeMismatch { planned, requested }) => {
                    warn!(
                        target: "sift::sweep",
                        job_id = %job_id,
                        planned = %planned,
                        requested = %requested,
                        "ledger re-planned for another filter; auto-continue ends here"
                    );
                    None
                }
                Err(err) => return Err(err),
            }
        } else {
            None
        };

        Ok(RunSummary {
            job_id,
            batch_number: batch,
            state,
            total: job.total() as u64,
            processed: counters.processed,
            found: counters.found,
            skipped: counters.skipped,
            error,
            next_job,
        })
    }

    /// Settle a job whose run was abandoned from outside, e.g. by the
    /// worker's per-job timeout.
    pub async fn abandon(&self, job: &SweepJob, reason: &str) -> Result<()> {
        match self.ledger.fail(job.batch_number, reason).await {
            Ok(_) => {}
            Err(SiftError::InvalidTransition { .. }) => {}
            Err(err) => return Err(err),
        }
        let update = StatusUpdate::state(JobState::Timeout)
            .with_current(None)
            .with_error(reason);
        match self.control.report(job.job_id, update).await {
            Ok(_) | Err(SiftError::InvalidTransition { .. }) | Err(SiftError::NotFound(_)) => {
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}
