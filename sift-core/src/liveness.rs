//! Worker liveness registry.
//!
//! Each analyzer worker owns one hash record keyed by its [`WorkerId`]. The
//! record is refreshed on every heartbeat; any listing that finds a record
//! whose heartbeat is at least one staleness threshold old deletes it. A
//! store TTL of five thresholds, renewed by each heartbeat, removes records
//! of crashed workers even when nobody lists.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LivenessConfig;
use crate::error::{Result, SiftError};
use crate::store::{CoordinationStore, HashFields, StoreKeys};
use crate::types::WorkerId;

const FIELD_WORKER_ID: &str = "worker_id";
const FIELD_HOST: &str = "host";
const FIELD_PID: &str = "pid";
const FIELD_QUEUES: &str = "queues";
const FIELD_STARTED_AT: &str = "started_at";
const FIELD_LAST_HEARTBEAT: &str = "last_heartbeat";
const FIELD_CURRENT_ITEM: &str = "current_item";

/// One live analyzer process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: WorkerId,
    pub host: String,
    pub pid: u32,
    pub queues: BTreeSet<String>,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub current_item: Option<String>,
}

impl WorkerRecord {
    /// Record describing the calling process.
    pub fn for_current_process<I, S>(queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let host = local_hostname();
        let pid = std::process::id();
        let now = Utc::now();
        Self {
            worker_id: WorkerId::compose(&host, pid),
            host,
            pid,
            queues: queues.into_iter().map(Into::into).collect(),
            started_at: now,
            last_heartbeat: now,
            current_item: None,
        }
    }

    pub fn serves(&self, queue: &str) -> bool {
        self.queues.contains(queue)
    }

    pub fn activity(&self) -> String {
        match &self.current_item {
            Some(item) => format!("processing {item}"),
            None => "idle".to_string(),
        }
    }

    fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            (FIELD_WORKER_ID.into(), self.worker_id.to_string()),
            (FIELD_HOST.into(), self.host.clone()),
            (FIELD_PID.into(), self.pid.to_string()),
            (
                FIELD_QUEUES.into(),
                self.queues.iter().cloned().collect::<Vec<_>>().join(","),
            ),
            (FIELD_STARTED_AT.into(), self.started_at.to_rfc3339()),
            (FIELD_LAST_HEARTBEAT.into(), self.last_heartbeat.to_rfc3339()),
            (
                FIELD_CURRENT_ITEM.into(),
                self.current_item.clone().unwrap_or_default(),
            ),
        ]
    }

    fn from_fields(
        key: &str,
        fields: &HashMap<String, String>,
    ) -> Result<Self> {
        let record = HashFields::new(key, fields);
        let queues = record
            .required(FIELD_QUEUES)?
            .split(',')
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self {
            worker_id: WorkerId::from_raw(record.required(FIELD_WORKER_ID)?),
            host: record.required(FIELD_HOST)?.to_string(),
            pid: record.parse(FIELD_PID)?,
            queues,
            started_at: record.timestamp(FIELD_STARTED_AT)?,
            last_heartbeat: record.timestamp(FIELD_LAST_HEARTBEAT)?,
            current_item: record.optional(FIELD_CURRENT_ITEM).map(str::to_string),
        })
    }
}

/// A worker that passed the staleness check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveWorker {
    pub worker_id: WorkerId,
    pub host: String,
    pub pid: u32,
    pub queues: BTreeSet<String>,
    pub started_at: DateTime<Utc>,
    /// `idle` or `processing <item>`.
    pub activity: String,
    pub heartbeat_age: Duration,
    /// Heartbeat age formatted for display, e.g. `12s`.
    pub heartbeat_age_text: String,
}

/// Which registered workers `terminate_all` acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerSelector {
    All,
    Queue(String),
}

impl WorkerSelector {
    fn matches(&self, record: &WorkerRecord) -> bool {
        match self {
            WorkerSelector::All => true,
            WorkerSelector::Queue(queue) => record.serves(queue),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TerminationReport {
    /// Processes that exited after SIGTERM or SIGKILL.
    pub killed: usize,
    /// Processes that could not be signalled, including workers on other
    /// hosts. Their records are purged regardless.
    pub failed_pids: Vec<u32>,
    /// Records removed from the registry.
    pub purged: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// Exited within the grace period after SIGTERM.
    Exited,
    /// Still alive after the grace period and sent SIGKILL.
    Killed,
    /// No process with that pid.
    NotRunning,
}

/// Sends termination signals to local processes by pid.
#[async_trait]
pub trait ProcessSignaller: Send + Sync + fmt::Debug {
    async fn terminate(
        &self,
        pid: u32,
        grace: Duration,
    ) -> Result<TerminateOutcome>;
}

/// SIGTERM, wait for exit, then SIGKILL.
#[cfg(unix)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NixSignaller;

#[cfg(unix)]
#[async_trait]
impl ProcessSignaller for NixSignaller {
    async fn terminate(
        &self,
        pid: u32,
        grace: Duration,
    ) -> Result<TerminateOutcome> {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let target = i32::try_from(pid)
            .map(Pid::from_raw)
            .map_err(|_| SiftError::Process(format!("pid {pid} out of range")))?;

        match kill(target, Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Ok(TerminateOutcome::NotRunning),
            Err(err) => {
                return Err(SiftError::Process(format!(
                    "SIGTERM to {pid} failed: {err}"
                )));
            }
        }

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Err(Errno::ESRCH) = kill(target, None) {
                return Ok(TerminateOutcome::Exited);
            }
        }

        match kill(target, Signal::SIGKILL) {
            Ok(()) => Ok(TerminateOutcome::Killed),
            Err(Errno::ESRCH) => Ok(TerminateOutcome::Exited),
            Err(err) => Err(SiftError::Process(format!(
                "SIGKILL to {pid} failed: {err}"
            ))),
        }
    }
}

#[cfg(not(unix))]
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedSignaller;

#[cfg(not(unix))]
#[async_trait]
impl ProcessSignaller for UnsupportedSignaller {
    async fn terminate(
        &self,
        pid: u32,
        _grace: Duration,
    ) -> Result<TerminateOutcome> {
        Err(SiftError::Process(format!(
            "cannot signal {pid}: process control requires unix"
        )))
    }
}

pub fn default_signaller() -> Arc<dyn ProcessSignaller> {
    #[cfg(unix)]
    {
        Arc::new(NixSignaller)
    }
    #[cfg(not(unix))]
    {
        Arc::new(UnsupportedSignaller)
    }
}

pub fn local_hostname() -> String {
    #[cfg(unix)]
    {
        if let Ok(name) = nix::unistd::gethostname() {
            return name.to_string_lossy().into_owned();
        }
    }
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Tracks live worker processes through heartbeats.
#[derive(Clone)]
pub struct WorkerRegistry {
    store: Arc<dyn CoordinationStore>,
    keys: StoreKeys,
    config: LivenessConfig,
    signaller: Arc<dyn ProcessSignaller>,
    local_host: String,
}

impl fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("keys", &self.keys)
            .field("staleness_secs", &self.config.staleness_secs)
            .field("local_host", &self.local_host)
            .finish()
    }
}

impl WorkerRegistry {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        keys: StoreKeys,
        config: LivenessConfig,
    ) -> Self {
        Self {
            store,
            keys,
            config,
            signaller: default_signaller(),
            local_host: local_hostname(),
        }
    }

    pub fn with_signaller(mut self, signaller: Arc<dyn ProcessSignaller>) -> Self {
        self.signaller = signaller;
        self
    }

    /// Overrides the host name used to decide which pids are signallable.
    pub fn with_local_host(mut self, host: impl Into<String>) -> Self {
        self.local_host = host.into();
        self
    }

    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    pub async fn register(&self, record: &WorkerRecord) -> Result<()> {
        let key = self.keys.worker(&record.worker_id);
        self.store
            .hset_fields(&key, &record.to_fields(), Some(self.config.record_ttl()))
            .await?;
        info!(
            target: "sift::liveness",
            worker_id = %record.worker_id,
            pid = record.pid,
            queues = ?record.queues,
            "worker registered"
        );
        Ok(())
    }

    pub async fn heartbeat(
        &self,
        worker_id: &WorkerId,
        current_item: Option<&str>,
    ) -> Result<bool> {
        self.heartbeat_at(worker_id, current_item, Utc::now()).await
    }

    /// Refresh a worker's heartbeat as of `at`. Returns `false` when the
    /// record no longer exists (reaped or purged); the caller should
    /// register again.
    pub async fn heartbeat_at(
        &self,
        worker_id: &WorkerId,
        current_item: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let key = self.keys.worker(worker_id);
        let fields = vec![
            (FIELD_LAST_HEARTBEAT.to_string(), at.to_rfc3339()),
            (
                FIELD_CURRENT_ITEM.to_string(),
                current_item.unwrap_or_default().to_string(),
            ),
        ];
        let refreshed = self
            .store
            .hset_existing(&key, &fields, Some(self.config.record_ttl()))
            .await?;
        if !refreshed {
            return Ok(false);
        }
        debug!(
            target: "sift::liveness",
            worker_id = %worker_id,
            current_item = current_item.unwrap_or("idle"),
            "heartbeat"
        );
        Ok(true)
    }

    pub async fn deregister(&self, worker_id: &WorkerId) -> Result<bool> {
        let removed = self.store.delete(&self.keys.worker(worker_id)).await?;
        info!(target: "sift::liveness", worker_id = %worker_id, "worker deregistered");
        Ok(removed)
    }

    pub async fn list_active_and_reap(&self) -> Result<Vec<ActiveWorker>> {
        self.list_active_and_reap_at(Utc::now()).await
    }

    /// Active workers as of `now`. Deletes every record whose heartbeat is
    /// at least one staleness threshold old or cannot be decoded.
    pub async fn list_active_and_reap_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ActiveWorker>> {
        let (active, _) = self.sweep(now).await?;
        Ok(active
            .into_iter()
            .map(|(record, age)| ActiveWorker {
                activity: record.activity(),
                heartbeat_age: age,
                heartbeat_age_text: humantime::format_duration(
                    Duration::from_secs(age.as_secs()),
                )
                .to_string(),
                worker_id: record.worker_id,
                host: record.host,
                pid: record.pid,
                queues: record.queues,
                started_at: record.started_at,
            })
            .collect())
    }

    pub async fn reap_stale(&self) -> Result<usize> {
        self.reap_stale_at(Utc::now()).await
    }

    pub async fn reap_stale_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let (_, reaped) = self.sweep(now).await?;
        Ok(reaped)
    }

    async fn records(&self) -> Result<Vec<(String, Result<WorkerRecord>)>> {
        let mut keys = self
            .store
            .keys_with_prefix(&self.keys.worker_prefix())
            .await?;
        keys.sort();

        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let fields = self.store.hgetall(&key).await?;
            if fields.is_empty() {
                // Expired between listing and reading.
                continue;
            }
            let record = WorkerRecord::from_fields(&key, &fields);
            out.push((key, record));
        }
        Ok(out)
    }

    async fn sweep(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(Vec<(WorkerRecord, Duration)>, usize)> {
        let staleness = self.config.staleness();
        let mut active = Vec::new();
        let mut reaped = 0;

        for (key, record) in self.records().await? {
            let age = record.as_ref().ok().map(|record| {
                (now - record.last_heartbeat)
                    .to_std()
                    .unwrap_or(Duration::ZERO)
            });

            match (record, age) {
                (Ok(record), Some(age)) if age < staleness => {
                    active.push((record, age));
                }
                (record, age) => {
                    match &record {
                        Ok(record) => info!(
                            target: "sift::liveness",
                            worker_id = %record.worker_id,
                            age_secs = age.map(|a| a.as_secs()),
                            "reaping stale worker"
                        ),
                        Err(err) => warn!(
                            target: "sift::liveness",
                            key = %key,
                            error = %err,
                            "reaping undecodable worker record"
                        ),
                    }
                    self.store.delete(&key).await?;
                    reaped += 1;
                }
            }
        }

        Ok((active, reaped))
    }

    /// Launch a new worker process serving `queues`. Returns its pid.
    pub async fn spawn(&self, queues: &[String]) -> Result<u32> {
        let program: PathBuf = match &self.config.worker_program {
            Some(program) => program.clone(),
            None => std::env::current_exe()?,
        };

        let mut command = tokio::process::Command::new(&program);
        command
            .arg("worker")
            .arg("--queues")
            .arg(queues.join(","))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(false);
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(|e| {
            SiftError::Process(format!(
                "failed to launch worker {}: {e}",
                program.display()
            ))
        })?;
        let pid = child.id().ok_or_else(|| {
            SiftError::Process("worker exited before reporting a pid".into())
        })?;

        info!(
            target: "sift::liveness",
            pid,
            program = %program.display(),
            queues = ?queues,
            "spawned worker"
        );
        Ok(pid)
    }

    /// Signal every registered worker matching `selector` and purge its
    /// record, whether or not the process could be signalled.
    pub async fn terminate_all(
        &self,
        selector: &WorkerSelector,
    ) -> Result<TerminationReport> {
        let grace = self.config.terminate_grace();
        let own_pid = std::process::id();
        let mut report = TerminationReport::default();

        for (key, record) in self.records().await? {
            let record = match record {
                Ok(record) if selector.matches(&record) => record,
                Ok(_) => continue,
                Err(err) => {
                    warn!(
                        target: "sift::liveness",
                        key = %key,
                        error = %err,
                        "purging undecodable worker record"
                    );
                    self.store.delete(&key).await?;
                    report.purged += 1;
                    continue;
                }
            };

            if record.host != self.local_host || record.pid == own_pid {
                warn!(
                    target: "sift::liveness",
                    worker_id = %record.worker_id,
                    host = %record.host,
                    "worker cannot be signalled from this process"
                );
                report.failed_pids.push(record.pid);
            } else {
                match self.signaller.terminate(record.pid, grace).await {
                    Ok(TerminateOutcome::Exited | TerminateOutcome::Killed) => {
                        report.killed += 1;
                    }
                    Ok(TerminateOutcome::NotRunning) => {
                        debug!(
                            target: "sift::liveness",
                            pid = record.pid,
                            "worker process already gone"
                        );
                    }
                    Err(err) => {
                        warn!(
                            target: "sift::liveness",
                            pid = record.pid,
                            error = %err,
                            "failed to terminate worker"
                        );
                        report.failed_pids.push(record.pid);
                    }
                }
            }

            self.store.delete(&key).await?;
            report.purged += 1;
        }

        info!(
            target: "sift::liveness",
            killed = report.killed,
            failed = report.failed_pids.len(),
            purged = report.purged,
            "terminate_all finished"
        );
        Ok(report)
    }

    /// Refresh `record` every heartbeat interval (and whenever the activity
    /// changes) until `cancel` fires. Re-registers if the record vanished.
    pub fn spawn_heartbeat(
        &self,
        record: WorkerRecord,
        mut activity: watch::Receiver<Option<String>>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        let interval = self.config.heartbeat_interval();

        tokio::spawn(async move {
            let mut watching = true;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                    changed = activity.changed(), if watching => {
                        if changed.is_err() {
                            watching = false;
                        }
                    }
                }

                let current = activity.borrow().clone();
                match registry
                    .heartbeat(&record.worker_id, current.as_deref())
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(
                            target: "sift::liveness",
                            worker_id = %record.worker_id,
                            "worker record missing; registering again"
                        );
                        let mut fresh = record.clone();
                        fresh.last_heartbeat = Utc::now();
                        fresh.current_item = current;
                        if let Err(err) = registry.register(&fresh).await {
                            warn!(target: "sift::liveness", error = %err, "re-register failed");
                        }
                    }
                    Err(err) => {
                        warn!(
                            target: "sift::liveness",
                            worker_id = %record.worker_id,
                            error = %err,
                            "heartbeat failed"
                        );
                    }
                }
            }
            debug!(target: "sift::liveness", worker_id = %record.worker_id, "heartbeat loop exiting");
        })
    }
}
