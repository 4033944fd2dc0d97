//! Batch ledger: partitions the candidate set into numbered batches and
//! tracks each batch through `pending -> running -> complete | incomplete`.
//!
//! The ledger is planned over the filtered, ascending candidate list, so a
//! batch's `entity_offset`/`entity_count` index directly into the list its
//! filter resolves to. The last batch also absorbs candidates added after
//! planning.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{Result, SiftError};
use crate::ports::CandidateSource;
use crate::queue::JobQueue;
use crate::store::{self, CoordinationStore, StoreKeys};
use crate::types::{EntityId, JobId, SweepFilter, SweepJob, SweepRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Complete,
    /// Failed, stopped or timed out; eligible to start again.
    Incomplete,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Running => "running",
            BatchStatus::Complete => "complete",
            BatchStatus::Incomplete => "incomplete",
        }
    }

    pub fn can_start(&self) -> bool {
        matches!(self, BatchStatus::Pending | BatchStatus::Incomplete)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    /// 1-based and stable for the lifetime of a plan.
    pub batch_number: u32,
    pub status: BatchStatus,
    pub entity_offset: usize,
    pub entity_count: usize,
    pub found: u64,
    pub job_id: Option<JobId>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl BatchRecord {
    fn pending(batch_number: u32, entity_offset: usize, entity_count: usize) -> Self {
        Self {
            batch_number,
            status: BatchStatus::Pending,
            entity_offset,
            entity_count,
            found: 0,
            job_id: None,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    fn reset(&mut self) {
        *self = Self::pending(self.batch_number, self.entity_offset, self.entity_count);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerMeta {
    pub total_items: usize,
    pub batch_size: usize,
    pub batch_count: u32,
    /// Canonical key of the filter the ledger was planned for.
    pub scope: String,
    pub planned_at: DateTime<Utc>,
}

/// Result of [`BatchLedger::start`].
#[derive(Debug, Clone, PartialEq)]
pub enum BatchStart {
    /// The batch resolved to no entities and was completed on the spot.
    Empty,
    Enqueued(SweepJob),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchOverview {
    pub total_entities: usize,
    pub batch_size: usize,
    pub batches: Vec<BatchRecord>,
    pub next_pending: Option<u32>,
    /// True when every batch is complete (vacuously so for an empty ledger).
    pub all_complete: bool,
}

pub fn batch_count(total_items: usize, batch_size: usize) -> u32 {
    if batch_size == 0 {
        return 0;
    }
    total_items.div_ceil(batch_size) as u32
}

/// Pure partitioning: contiguous, non-overlapping slices covering
/// `total_items`.
pub fn partition(total_items: usize, batch_size: usize) -> Vec<BatchRecord> {
    let count = batch_count(total_items, batch_size);
    (0..count)
        .map(|idx| {
            let offset = idx as usize * batch_size;
            let len = batch_size.min(total_items - offset);
            BatchRecord::pending(idx + 1, offset, len)
        })
        .collect()
}

/// Persistent batch partition plus per-batch lifecycle.
///
/// Every mutation goes through one in-process lock; only the orchestrator
/// writes to the ledger.
#[derive(Clone)]
pub struct BatchLedger {
    store: Arc<dyn CoordinationStore>,
    keys: StoreKeys,
    candidates: Arc<dyn CandidateSource>,
    queue: Arc<dyn JobQueue>,
    queue_name: String,
    batch_size: usize,
    writer: Arc<Mutex<()>>,
}

impl fmt::Debug for BatchLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchLedger")
            .field("keys", &self.keys)
            .field("queue_name", &self.queue_name)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

impl BatchLedger {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        keys: StoreKeys,
        candidates: Arc<dyn CandidateSource>,
        queue: Arc<dyn JobQueue>,
        queue_name: impl Into<String>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            keys,
            candidates,
            queue,
            queue_name: queue_name.into(),
            batch_size: batch_size.max(1),
            writer: Arc::new(Mutex::new(())),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub async fn meta(&self) -> Result<Option<LedgerMeta>> {
        store::get_json(self.store.as_ref(), &self.keys.ledger_meta()).await
    }

    /// Plan an unfiltered ledger of `total_items`.
    pub async fn plan(
        &self,
        total_items: usize,
        batch_size: usize,
    ) -> Result<Vec<BatchRecord>> {
        self.plan_scoped(total_items, batch_size, &SweepFilter::all().scope_key())
            .await
    }

    /// Idempotent: an existing ledger with the same scope, batch size and
    /// batch count is returned untouched. A ledger with a running batch is
    /// never replaced.
    pub async fn plan_scoped(
        &self,
        total_items: usize,
        batch_size: usize,
        scope: &str,
    ) -> Result<Vec<BatchRecord>> {
        let batch_size = batch_size.max(1);
        let _guard = self.writer.lock().await;

        let wanted = batch_count(total_items, batch_size);
        if let Some(meta) = self.meta().await? {
            let unchanged = meta.scope == scope
                && meta.batch_size == batch_size
                && meta.batch_count == wanted;
            if unchanged {
                return self.load_batches(&meta).await;
            }

            let existing = self.load_batches(&meta).await?;
            if existing.iter().any(|b| b.status == BatchStatus::Running) {
                warn!(
                    target: "sift::ledger",
                    old_scope = %meta.scope,
                    new_scope = %scope,
                    old_batches = meta.batch_count,
                    new_batches = wanted,
                    "ledger needs re-planning but a batch is running; keeping current plan"
                );
                return Ok(existing);
            }
        }

        self.replace_plan(total_items, batch_size, scope).await
    }

    /// Resolve the candidates for `filter` and make sure the ledger is
    /// planned for them.
    pub async fn refresh(
        &self,
        filter: &SweepFilter,
    ) -> Result<(Vec<EntityId>, Vec<BatchRecord>)> {
        let candidates = self.candidates.candidate_ids(filter).await?;
        let batches = self
            .plan_scoped(candidates.len(), self.batch_size, &filter.scope_key())
            .await?;
        Ok((candidates, batches))
    }

    /// The ledger's plan is only meaningful for the filter it was planned
    /// over; fail when `filter` resolves to a different candidate list.
    pub async fn ensure_scope(&self, filter: &SweepFilter) -> Result<LedgerMeta> {
        let meta = self
            .meta()
            .await?
            .ok_or_else(|| SiftError::NotFound("ledger has not been planned".to_string()))?;
        let requested = filter.scope_key();
        if meta.scope != requested {
            return Err(SiftError::ScopeMismatch {
                planned: meta.scope,
                requested,
            });
        }
        Ok(meta)
    }

    /// Meta goes first and comes back last, so an interrupted re-plan
    /// reads as "not planned" rather than pointing at missing batches.
    async fn replace_plan(
        &self,
        total_items: usize,
        batch_size: usize,
        scope: &str,
    ) -> Result<Vec<BatchRecord>> {
        self.store.delete(&self.keys.ledger_meta()).await?;
        for key in self
            .store
            .keys_with_prefix(&self.keys.batch_prefix())
            .await?
        {
            self.store.delete(&key).await?;
        }

        let batches = partition(total_items, batch_size);
        for batch in &batches {
            self.write(batch).await?;
        }

        let meta = LedgerMeta {
            total_items,
            batch_size,
            batch_count: batches.len() as u32,
            scope: scope.to_string(),
            planned_at: Utc::now(),
        };
        store::set_json(self.store.as_ref(), &self.keys.ledger_meta(), &meta, None)
            .await?;

        info!(
            target: "sift::ledger",
            total_items,
            batch_size,
            batches = meta.batch_count,
            scope,
            "ledger planned"
        );
        Ok(batches)
    }

    async fn write(&self, batch: &BatchRecord) -> Result<()> {
        store::set_json(
            self.store.as_ref(),
            &self.keys.batch(batch.batch_number),
            batch,
            None,
        )
        .await
    }

    async fn load_batches(&self, meta: &LedgerMeta) -> Result<Vec<BatchRecord>> {
        let mut out = Vec::with_capacity(meta.batch_count as usize);
        for number in 1..=meta.batch_count {
            let key = self.keys.batch(number);
            let record = store::get_json::<BatchRecord>(self.store.as_ref(), &key)
                .await?
                .ok_or_else(|| SiftError::corrupt(&key, "batch record missing"))?;
            out.push(record);
        }
        Ok(out)
    }

    pub async fn batches(&self) -> Result<Vec<BatchRecord>> {
        match self.meta().await? {
            Some(meta) => self.load_batches(&meta).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn get(&self, batch_number: u32) -> Result<Option<BatchRecord>> {
        store::get_json(self.store.as_ref(), &self.keys.batch(batch_number)).await
    }

    async fn require(&self, batch_number: u32) -> Result<BatchRecord> {
        self.get(batch_number)
            .await?
            .ok_or_else(|| SiftError::NotFound(format!("batch {batch_number}")))
    }

    /// Lowest-numbered pending batch, else the lowest incomplete one.
    pub async fn next_pending(&self) -> Result<Option<BatchRecord>> {
        let batches = self.batches().await?;
        let pending = batches
            .iter()
            .find(|b| b.status == BatchStatus::Pending)
            .or_else(|| batches.iter().find(|b| b.status == BatchStatus::Incomplete));
        Ok(pending.cloned())
    }

    /// Resolve the batch's entity slice, mark it running and enqueue it.
    /// An empty slice completes the batch immediately with zero found.
    ///
    /// Fails with [`SiftError::ScopeMismatch`] when the ledger was planned
    /// for another filter, e.g. because it was kept while a batch ran.
    pub async fn start(
        &self,
        batch_number: u32,
        job_id: JobId,
        request: &SweepRequest,
    ) -> Result<BatchStart> {
        let _guard = self.writer.lock().await;

        let meta = self.ensure_scope(&request.filter).await?;
        let mut record = self.require(batch_number).await?;
        if !record.status.can_start() {
            return Err(SiftError::invalid_transition(
                format!("batch {batch_number}"),
                record.status,
                BatchStatus::Running,
            ));
        }

        let last_batch = meta.batch_count == batch_number;
        let candidates = self.candidates.candidate_ids(&request.filter).await?;
        let slice = slice_for(&candidates, &record, last_batch);
        let now = Utc::now();

        if slice.is_empty() {
            record.status = BatchStatus::Complete;
            record.found = 0;
            record.job_id = None;
            record.started_at = Some(now);
            record.completed_at = Some(now);
            record.error = None;
            self.write(&record).await?;
            info!(target: "sift::ledger", batch = batch_number, "batch empty; marked complete");
            return Ok(BatchStart::Empty);
        }

        let job = SweepJob {
            job_id,
            batch_number,
            entity_ids: slice.to_vec(),
            filter: request.filter.clone(),
            force_refresh: request.force_refresh,
            auto_continue: request.auto_continue,
            enqueued_at: now,
        };

        record.status = BatchStatus::Running;
        record.found = 0;
        record.job_id = Some(job_id);
        record.started_at = Some(now);
        record.completed_at = None;
        record.error = None;
        self.write(&record).await?;

        if let Err(err) = self.queue.enqueue(&self.queue_name, &job).await {
            record.status = BatchStatus::Incomplete;
            record.error = Some(format!("enqueue failed: {err}"));
            record.completed_at = Some(Utc::now());
            self.write(&record).await?;
            return Err(err);
        }

        info!(
            target: "sift::ledger",
            batch = batch_number,
            job_id = %job_id,
            entities = job.entity_ids.len(),
            queue = %self.queue_name,
            "batch started"
        );
        Ok(BatchStart::Enqueued(job))
    }

    pub async fn complete(&self, batch_number: u32, found: u64) -> Result<BatchRecord> {
        let _guard = self.writer.lock().await;
        let mut record = self.require_running(batch_number, BatchStatus::Complete).await?;
        record.status = BatchStatus::Complete;
        record.found = found;
        record.completed_at = Some(Utc::now());
        record.error = None;
        self.write(&record).await?;
        info!(target: "sift::ledger", batch = batch_number, found, "batch complete");
        Ok(record)
    }

    pub async fn fail(
        &self,
        batch_number: u32,
        error: impl Into<String>,
    ) -> Result<BatchRecord> {
        let error = error.into();
        let _guard = self.writer.lock().await;
        let mut record = self
            .require_running(batch_number, BatchStatus::Incomplete)
            .await?;
        record.status = BatchStatus::Incomplete;
        record.completed_at = Some(Utc::now());
        record.error = Some(error.clone());
        self.write(&record).await?;
        warn!(target: "sift::ledger", batch = batch_number, error = %error, "batch incomplete");
        Ok(record)
    }

    async fn require_running(
        &self,
        batch_number: u32,
        to: BatchStatus,
    ) -> Result<BatchRecord> {
        let record = self.require(batch_number).await?;
        if record.status != BatchStatus::Running {
            return Err(SiftError::invalid_transition(
                format!("batch {batch_number}"),
                record.status,
                to,
            ));
        }
        Ok(record)
    }

    /// Return every batch to `pending` without changing the partitioning.
    pub async fn reset_all(&self) -> Result<usize> {
        let _guard = self.writer.lock().await;
        let mut batches = self.batches().await?;
        for batch in &mut batches {
            batch.reset();
            self.write(batch).await?;
        }
        info!(target: "sift::ledger", batches = batches.len(), "ledger reset");
        Ok(batches.len())
    }

    pub async fn overview(&self, filter: &SweepFilter) -> Result<BatchOverview> {
        let (candidates, batches) = self.refresh(filter).await?;
        let next_pending = batches
            .iter()
            .find(|b| b.status == BatchStatus::Pending)
            .or_else(|| batches.iter().find(|b| b.status == BatchStatus::Incomplete))
            .map(|b| b.batch_number);
        let all_complete = batches.iter().all(|b| b.status == BatchStatus::Complete);
        Ok(BatchOverview {
            total_entities: candidates.len(),
            batch_size: self.batch_size,
            batches,
            next_pending,
            all_complete,
        })
    }
}

fn slice_for<'a>(
    candidates: &'a [EntityId],
    record: &BatchRecord,
    last_batch: bool,
) -> &'a [EntityId] {
    let start = record.entity_offset.min(candidates.len());
    let end = if last_batch {
        candidates.len()
    } else {
        (record.entity_offset + record.entity_count).min(candidates.len())
    };
    &candidates[start..end]
}
