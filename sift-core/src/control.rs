//! Job control plane: per-run status records and cooperative control
//! signals.
//!
//! Status lives in the coordination store as a flat string hash whose TTL is
//! renewed on every update. Control signals are plain string keys written by
//! a supervisor and read by the worker at checkpoints.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{StatusConfig, SweepConfig};
use crate::error::{Result, SiftError};
use crate::store::{CoordinationStore, HashFields, StoreKeys};
use crate::types::{EntityId, JobId};

const TRANSITION_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Initializing,
    Running,
    Paused,
    Cooldown,
    Complete,
    Failed,
    Stopped,
    Timeout,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Initializing => "initializing",
            JobState::Running => "running",
            JobState::Paused => "paused",
            JobState::Cooldown => "cooldown",
            JobState::Complete => "complete",
            JobState::Failed => "failed",
            JobState::Stopped => "stopped",
            JobState::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Complete | JobState::Failed | JobState::Stopped | JobState::Timeout
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored state or signal name that this build does not know.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} {value:?}")]
pub struct UnknownName {
    kind: &'static str,
    value: String,
}

impl UnknownName {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

impl FromStr for JobState {
    type Err = UnknownName;

    fn from_str(s: &str) -> std::result::Result<Self, UnknownName> {
        Ok(match s {
            "queued" => JobState::Queued,
            "initializing" => JobState::Initializing,
            "running" => JobState::Running,
            "paused" => JobState::Paused,
            "cooldown" => JobState::Cooldown,
            "complete" => JobState::Complete,
            "failed" => JobState::Failed,
            "stopped" => JobState::Stopped,
            "timeout" => JobState::Timeout,
            other => return Err(UnknownName::new("job state", other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSignal {
    Run,
    Pause,
    Stop,
}

impl ControlSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlSignal::Run => "run",
            ControlSignal::Pause => "pause",
            ControlSignal::Stop => "stop",
        }
    }
}

impl fmt::Display for ControlSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlSignal {
    type Err = UnknownName;

    fn from_str(s: &str) -> std::result::Result<Self, UnknownName> {
        match s.trim() {
            "run" => Ok(ControlSignal::Run),
            "pause" => Ok(ControlSignal::Pause),
            "stop" => Ok(ControlSignal::Stop),
            other => Err(UnknownName::new("control signal", other)),
        }
    }
}

/// Progress record for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub status: JobState,
    pub batch_number: Option<u32>,
    pub total: u64,
    pub processed: u64,
    pub found: u64,
    pub skipped: u64,
    pub current_entity: Option<EntityId>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl JobStatus {
    fn to_fields(&self) -> Vec<(String, String)> {
        let opt = |value: Option<String>| value.unwrap_or_default();
        vec![
            ("job_id".into(), self.job_id.to_string()),
            ("status".into(), self.status.as_str().into()),
            ("batch_number".into(), opt(self.batch_number.map(|b| b.to_string()))),
            ("total".into(), self.total.to_string()),
            ("processed".into(), self.processed.to_string()),
            ("found".into(), self.found.to_string()),
            ("skipped".into(), self.skipped.to_string()),
            (
                "current_entity".into(),
                opt(self.current_entity.map(|e| e.to_string())),
            ),
            ("started_at".into(), self.started_at.to_rfc3339()),
            (
                "completed_at".into(),
                opt(self.completed_at.map(|t| t.to_rfc3339())),
            ),
            ("error".into(), opt(self.error.clone())),
            ("updated_at".into(), self.updated_at.to_rfc3339()),
        ]
    }

    fn from_fields(key: &str, fields: &HashMap<String, String>) -> Result<Self> {
        let record = HashFields::new(key, fields);
        Ok(Self {
            job_id: record.parse("job_id")?,
            status: record.parse("status")?,
            batch_number: record.parse_optional("batch_number")?,
            total: record.parse("total")?,
            processed: record.parse("processed")?,
            found: record.parse("found")?,
            skipped: record.parse("skipped")?,
            current_entity: record.parse_optional("current_entity")?,
            started_at: record.timestamp("started_at")?,
            completed_at: record.timestamp_optional("completed_at")?,
            error: record.optional("error").map(str::to_string),
            updated_at: record.timestamp("updated_at")?,
        })
    }
}

/// Partial update applied by [`JobControlPlane::report`]. Unset fields keep
/// their stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: Option<JobState>,
    pub total: Option<u64>,
    pub processed: Option<u64>,
    pub found: Option<u64>,
    pub skipped: Option<u64>,
    pub current_entity: Option<Option<EntityId>>,
    pub error: Option<String>,
}

impl StatusUpdate {
    pub fn state(status: JobState) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn progress(processed: u64, found: u64, skipped: u64) -> Self {
        Self {
            processed: Some(processed),
            found: Some(found),
            skipped: Some(skipped),
            ..Self::default()
        }
    }

    pub fn with_state(mut self, status: JobState) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_total(mut self, total: u64) -> Self {
        self.total = Some(total);
        self
    }

    pub fn with_current(mut self, entity: Option<EntityId>) -> Self {
        self.current_entity = Some(entity);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusTransition {
    pub job_id: JobId,
    pub from: JobState,
    pub to: JobState,
}

/// Status reporting and pause/resume/stop signalling for runs.
#[derive(Clone)]
pub struct JobControlPlane {
    store: Arc<dyn CoordinationStore>,
    keys: StoreKeys,
    status: StatusConfig,
    pause_poll: Duration,
    cooldown: Duration,
    transitions: broadcast::Sender<StatusTransition>,
}

impl fmt::Debug for JobControlPlane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobControlPlane")
            .field("keys", &self.keys)
            .field("status", &self.status)
            .field("pause_poll", &self.pause_poll)
            .field("cooldown", &self.cooldown)
            .field("subscriber_count", &self.transitions.receiver_count())
            .finish()
    }
}

impl JobControlPlane {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        keys: StoreKeys,
        status: StatusConfig,
        sweep: &SweepConfig,
    ) -> Self {
        let (transitions, _rx) = broadcast::channel(TRANSITION_CAPACITY);
        Self {
            store,
            keys,
            status,
            pause_poll: sweep.pause_poll(),
            cooldown: sweep.cooldown(),
            transitions,
        }
    }

    /// Status transitions reported through this instance.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusTransition> {
        self.transitions.subscribe()
    }

    pub async fn create(
        &self,
        job_id: JobId,
        total: u64,
        batch_number: Option<u32>,
    ) -> Result<JobStatus> {
        let now = Utc::now();
        let status = JobStatus {
            job_id,
            status: JobState::Queued,
            batch_number,
            total,
            processed: 0,
            found: 0,
            skipped: 0,
            current_entity: None,
            started_at: now,
            completed_at: None,
            error: None,
            updated_at: now,
        };
        self.write(&status).await?;
        debug!(target: "sift::control", job_id = %job_id, total, batch = ?batch_number, "status created");
        Ok(status)
    }

    async fn write(&self, status: &JobStatus) -> Result<()> {
        self.store
            .hset_fields(
                &self.keys.job_status(status.job_id),
                &status.to_fields(),
                Some(self.status.status_ttl()),
            )
            .await
    }

    pub async fn get_status(&self, job_id: JobId) -> Result<Option<JobStatus>> {
        let key = self.keys.job_status(job_id);
        let fields = self.store.hgetall(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        JobStatus::from_fields(&key, &fields).map(Some)
    }

    /// Apply `update` and renew the record's TTL. Leaving a terminal state
    /// is rejected.
    pub async fn report(&self, job_id: JobId, update: StatusUpdate) -> Result<JobStatus> {
        let mut status = self
            .get_status(job_id)
            .await?
            .ok_or_else(|| SiftError::NotFound(format!("status for job {job_id}")))?;
        let from = status.status;

        if let Some(to) = update.status
            && from.is_terminal()
            && to != from
        {
            return Err(SiftError::invalid_transition(format!("job {job_id}"), from, to));
        }

        let now = Utc::now();
        if let Some(to) = update.status {
            status.status = to;
            if to.is_terminal() && !from.is_terminal() {
                status.completed_at = Some(now);
            }
        }
        if let Some(total) = update.total {
            status.total = total;
        }
        if let Some(processed) = update.processed {
            status.processed = processed;
        }
        if let Some(found) = update.found {
            status.found = found;
        }
        if let Some(skipped) = update.skipped {
            status.skipped = skipped;
        }
        if let Some(current) = update.current_entity {
            status.current_entity = current;
        }
        if let Some(error) = update.error {
            status.error = Some(error);
        }
        status.updated_at = now;

        self.write(&status).await?;

        if status.status != from {
            info!(
                target: "sift::control",
                job_id = %job_id,
                from = %from,
                to = %status.status,
                "job state changed"
            );
            // No receivers is fine.
            let _ = self.transitions.send(StatusTransition {
                job_id,
                from,
                to: status.status,
            });
        }
        Ok(status)
    }

    pub async fn set_control(&self, job_id: JobId, signal: ControlSignal) -> Result<()> {
        self.store
            .set(
                &self.keys.job_control(job_id),
                signal.as_str(),
                Some(self.status.control_ttl()),
            )
            .await?;
        info!(target: "sift::control", job_id = %job_id, signal = %signal, "control signal set");
        Ok(())
    }

    /// Absent or expired signals read as `run`.
    pub async fn get_control(&self, job_id: JobId) -> Result<ControlSignal> {
        let key = self.keys.job_control(job_id);
        match self.store.get(&key).await? {
            Some(raw) => raw
                .parse()
                .map_err(|e: UnknownName| SiftError::corrupt(&key, e.to_string())),
            None => Ok(ControlSignal::Run),
        }
    }

    pub async fn clear_control(&self, job_id: JobId) -> Result<()> {
        self.store.delete(&self.keys.job_control(job_id)).await?;
        Ok(())
    }

    /// Report `paused` and poll the control signal until it is no longer
    /// `pause`. Reports `running` again on resume. Returns the signal that
    /// ended the pause; cancellation yields [`SiftError::Cancelled`].
    pub async fn wait_while_paused(
        &self,
        job_id: JobId,
        cancel: &CancellationToken,
    ) -> Result<ControlSignal> {
        let mut signal = self.get_control(job_id).await?;
        if signal != ControlSignal::Pause {
            return Ok(signal);
        }

        self.report(job_id, StatusUpdate::state(JobState::Paused)).await?;
        while signal == ControlSignal::Pause {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(SiftError::Cancelled(format!("job {job_id} cancelled while paused")));
                }
                _ = tokio::time::sleep(self.pause_poll) => {}
            }
            signal = self.get_control(job_id).await?;
        }

        if signal == ControlSignal::Run {
            self.report(job_id, StatusUpdate::state(JobState::Running)).await?;
        }
        Ok(signal)
    }

    /// Report `cooldown`, sleep for the configured cooldown and report
    /// `running` again. A `stop` observed during the sleep ends it early and
    /// is returned without reporting `running`.
    pub async fn cooldown(
        &self,
        job_id: JobId,
        cancel: &CancellationToken,
    ) -> Result<ControlSignal> {
        self.report(job_id, StatusUpdate::state(JobState::Cooldown)).await?;

        let deadline = tokio::time::Instant::now() + self.cooldown;
        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            let step = self.pause_poll.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(SiftError::Cancelled(format!("job {job_id} cancelled during cooldown")));
                }
                _ = tokio::time::sleep(step) => {}
            }
            if self.get_control(job_id).await? == ControlSignal::Stop {
                return Ok(ControlSignal::Stop);
            }
        }

        self.report(job_id, StatusUpdate::state(JobState::Running)).await?;
        Ok(ControlSignal::Run)
    }
}
