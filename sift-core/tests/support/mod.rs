#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sift_core::control::{ControlSignal, JobControlPlane};
use sift_core::corpus::JsonCorpus;
use sift_core::error::{Result, SiftError};
use sift_core::ports::{
    AnalysisRequest, Analyzer, CandidateSource, ContentItem, ContentSource, Finding,
};
use sift_core::queue::{InProcJobQueue, JobQueue};
use sift_core::store::{CoordinationStore, InMemoryStore};
use sift_core::{
    DocumentId, EntityId, JobId, RunSummary, SiftConfig, SweepDeps, SweepFilter, SweepJob,
    SweepOrchestrator,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Analyzer double: returns a scripted number of findings per entity and
/// records every call with the tokio clock.
#[derive(Debug, Default)]
pub struct ScriptedAnalyzer {
    findings: HashMap<EntityId, usize>,
    failing: HashSet<EntityId>,
    delay: Duration,
    calls: Mutex<Vec<(EntityId, Instant)>>,
    stop_on_call: Mutex<Option<(JobControlPlane, JobId, usize)>>,
}

impl ScriptedAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_findings(mut self, entity: i64, count: usize) -> Self {
        self.findings.insert(EntityId(entity), count);
        self
    }

    pub fn failing_on(mut self, entity: i64) -> Self {
        self.failing.insert(EntityId(entity));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Write a `stop` signal for `job` while serving the `call`-th request.
    pub fn stop_on_call(&self, control: JobControlPlane, job: JobId, call: usize) {
        *self.stop_on_call.lock().expect("stop hook lock") = Some((control, job, call));
    }

    pub fn calls(&self) -> Vec<EntityId> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .map(|(entity, _)| *entity)
            .collect()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .map(|(_, at)| *at)
            .collect()
    }
}

#[async_trait]
impl Analyzer for ScriptedAnalyzer {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<Vec<Finding>> {
        let call = {
            let mut calls = self.calls.lock().expect("calls lock");
            calls.push((request.entity_id, Instant::now()));
            calls.len()
        };

        let hook = self
            .stop_on_call
            .lock()
            .expect("stop hook lock")
            .clone()
            .filter(|(_, _, at)| *at == call);
        if let Some((control, job, _)) = hook {
            control.set_control(job, ControlSignal::Stop).await?;
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self.failing.contains(&request.entity_id) {
            return Err(SiftError::Analyzer(format!(
                "scripted failure for {}",
                request.entity_id
            )));
        }

        let count = self.findings.get(&request.entity_id).copied().unwrap_or(1);
        Ok((0..count)
            .map(|n| serde_json::json!({ "entity": request.entity_id, "n": n }))
            .collect())
    }
}

pub fn corpus(entities: std::ops::RangeInclusive<i64>) -> JsonCorpus {
    let mut corpus = JsonCorpus::default();
    for id in entities {
        corpus.insert(
            EntityId(id),
            vec![ContentItem {
                id: 1,
                document_id: DocumentId(id % 7),
                text: format!("statement {id}"),
            }],
        );
    }
    corpus
}

/// Corpus double whose content lookups fail for chosen entities and whose
/// candidate list can shrink after planning.
#[derive(Debug)]
pub struct FaultyCorpus {
    corpus: JsonCorpus,
    failing_content: HashSet<EntityId>,
    keep_first: Mutex<Option<usize>>,
}

impl FaultyCorpus {
    pub fn new(corpus: JsonCorpus) -> Self {
        Self {
            corpus,
            failing_content: HashSet::new(),
            keep_first: Mutex::new(None),
        }
    }

    pub fn failing_content(mut self, entity: i64) -> Self {
        self.failing_content.insert(EntityId(entity));
        self
    }

    /// From now on only the first `n` candidates exist.
    pub fn truncate_candidates(&self, n: usize) {
        *self.keep_first.lock().expect("candidate limit lock") = Some(n);
    }
}

#[async_trait]
impl CandidateSource for FaultyCorpus {
    async fn candidate_ids(&self, filter: &SweepFilter) -> Result<Vec<EntityId>> {
        let mut ids = self.corpus.candidate_ids(filter).await?;
        if let Some(n) = *self.keep_first.lock().expect("candidate limit lock") {
            ids.truncate(n);
        }
        Ok(ids)
    }
}

#[async_trait]
impl ContentSource for FaultyCorpus {
    async fn content(
        &self,
        entity: EntityId,
        documents: Option<&BTreeSet<DocumentId>>,
        limit: Option<usize>,
    ) -> Result<Vec<ContentItem>> {
        if self.failing_content.contains(&entity) {
            return Err(SiftError::Internal(format!(
                "content database unavailable for {entity}"
            )));
        }
        self.corpus.content(entity, documents, limit).await
    }
}

/// Which calls an injected outage rejects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outage {
    /// Every call touching a matching key.
    All,
    /// Only `set` and `hset*` calls; reads, scans and deletes still work.
    Writes,
}

/// Store double: an in-memory store that fails calls on keys under a
/// chosen prefix once an outage is switched on.
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: InMemoryStore,
    outage: Mutex<Option<(String, Outage)>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, prefix: impl Into<String>, outage: Outage) {
        *self.outage.lock().expect("outage lock") = Some((prefix.into(), outage));
    }

    pub fn recover(&self) {
        *self.outage.lock().expect("outage lock") = None;
    }

    fn check(&self, key: &str, write: bool) -> Result<()> {
        let outage = self.outage.lock().expect("outage lock").clone();
        match outage {
            Some((prefix, mode)) if key.starts_with(&prefix) && (write || mode == Outage::All) => {
                Err(SiftError::Store(format!("connection refused ({key})")))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl CoordinationStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check(key, false)?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.check(key, true)?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check(key, false)?;
        self.inner.delete(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.check(key, false)?;
        self.inner.expire(key, ttl).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check(key, false)?;
        self.inner.exists(key).await
    }

    async fn hset_fields(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.check(key, true)?;
        self.inner.hset_fields(key, fields, ttl).await
    }

    async fn hset_existing(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Option<Duration>,
    ) -> Result<bool> {
        self.check(key, true)?;
        self.inner.hset_existing(key, fields, ttl).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.check(key, false)?;
        self.inner.hgetall(key).await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.check(prefix, false)?;
        self.inner.keys_with_prefix(prefix).await
    }
}

/// Config with cooldowns disabled and small batches.
pub fn test_config(batch_size: usize) -> SiftConfig {
    let mut config = SiftConfig::default();
    config.store.key_prefix = "test".to_string();
    config.sweep.batch_size = batch_size;
    config.sweep.cooldown_entities = 0;
    config
}

pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub queue: Arc<InProcJobQueue>,
    pub analyzer: Arc<ScriptedAnalyzer>,
    pub orchestrator: SweepOrchestrator,
    pub config: SiftConfig,
}

impl Harness {
    pub fn new(corpus: JsonCorpus, analyzer: ScriptedAnalyzer, config: SiftConfig) -> Self {
        let corpus = Arc::new(corpus);
        Self::with_sources(corpus.clone(), corpus, analyzer, config)
    }

    pub fn with_sources(
        candidates: Arc<dyn CandidateSource>,
        content: Arc<dyn ContentSource>,
        analyzer: ScriptedAnalyzer,
        config: SiftConfig,
    ) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InProcJobQueue::new());
        let analyzer = Arc::new(analyzer);
        let deps = SweepDeps {
            store: store.clone(),
            queue: queue.clone(),
            candidates,
            content,
            analyzer: analyzer.clone(),
        };
        let orchestrator = SweepOrchestrator::new(deps, &config);
        Self {
            store,
            queue,
            analyzer,
            orchestrator,
            config,
        }
    }

    pub async fn dequeue(&self) -> Option<SweepJob> {
        self.queue
            .dequeue(&[self.config.queue.default_queue.clone()])
            .await
            .expect("dequeue")
    }

    /// Dequeue the next job and run it to completion.
    pub async fn run_next(&self) -> RunSummary {
        let job = self.dequeue().await.expect("a queued job");
        self.orchestrator
            .run_batch(&job, &CancellationToken::new())
            .await
            .expect("run batch")
    }
}

/// Orchestrator over a [`FlakyStore`], for store-outage scenarios.
pub fn flaky_orchestrator(
    corpus: JsonCorpus,
    analyzer: Arc<ScriptedAnalyzer>,
    config: &SiftConfig,
) -> (Arc<FlakyStore>, Arc<InProcJobQueue>, SweepOrchestrator) {
    let store = Arc::new(FlakyStore::new());
    let queue = Arc::new(InProcJobQueue::new());
    let corpus = Arc::new(corpus);
    let deps = SweepDeps {
        store: store.clone(),
        queue: queue.clone(),
        candidates: corpus.clone(),
        content: corpus,
        analyzer,
    };
    let orchestrator = SweepOrchestrator::new(deps, config);
    (store, queue, orchestrator)
}
