//! Wires configured backends into a [`SweepOrchestrator`].

use std::sync::Arc;

use anyhow::{Context, bail};
use async_trait::async_trait;
use sift_core::analyzer::HttpAnalyzer;
use sift_core::corpus::JsonCorpus;
use sift_core::ports::{AnalysisRequest, Analyzer, Finding};
use sift_core::queue::{InProcJobQueue, JobQueue, RedisJobQueue};
use sift_core::store::{CoordinationStore, InMemoryStore, RedisStore, StoreKeys};
use sift_core::{SiftError, SweepDeps, SweepOrchestrator};
use tracing::{info, warn};

use crate::config::AppConfig;

/// What a command needs beyond the coordination store.
#[derive(Debug, Clone, Copy, Default)]
pub struct Requirements {
    pub corpus: bool,
    pub analyzer: bool,
}

impl Requirements {
    pub const CONTROL: Self = Self {
        corpus: false,
        analyzer: false,
    };
    pub const PLANNING: Self = Self {
        corpus: true,
        analyzer: false,
    };
    pub const EXECUTION: Self = Self {
        corpus: true,
        analyzer: true,
    };
}

/// Stand-in for commands that never analyze anything.
#[derive(Debug, Clone, Copy, Default)]
struct UnconfiguredAnalyzer;

#[async_trait]
impl Analyzer for UnconfiguredAnalyzer {
    async fn analyze(&self, request: &AnalysisRequest) -> sift_core::Result<Vec<Finding>> {
        Err(SiftError::Analyzer(format!(
            "no analyzer endpoint configured (entity {})",
            request.entity_id
        )))
    }
}

pub async fn build_orchestrator(
    config: &AppConfig,
    needs: Requirements,
) -> anyhow::Result<SweepOrchestrator> {
    let keys = StoreKeys::new(config.sift.store.key_prefix.clone());

    let (store, queue): (Arc<dyn CoordinationStore>, Arc<dyn JobQueue>) =
        match &config.redis_url {
            Some(url) => {
                let store = RedisStore::connect(url)
                    .await
                    .context("failed to connect to the coordination store")?;
                let queue = RedisJobQueue::new(store.connection(), keys);
                (Arc::new(store), Arc::new(queue))
            }
            None => {
                warn!(
                    "no Redis URL configured; using in-process store and queue (state is not shared)"
                );
                (Arc::new(InMemoryStore::new()), Arc::new(InProcJobQueue::new()))
            }
        };

    let corpus = if needs.corpus {
        JsonCorpus::load(&config.corpus_path).await.with_context(|| {
            format!("failed to load corpus {}", config.corpus_path.display())
        })?
    } else {
        JsonCorpus::default()
    };
    let corpus = Arc::new(corpus);

    let analyzer: Arc<dyn Analyzer> = match (&config.analyzer.url, needs.analyzer) {
        (Some(url), _) => {
            info!(endpoint = %url, timeout = ?config.analyzer.timeout, "using HTTP analyzer");
            Arc::new(
                HttpAnalyzer::new(url.clone(), config.analyzer.timeout)
                    .context("failed to build analyzer client")?,
            )
        }
        (None, true) => bail!(
            "this command runs analyses; set SIFT_ANALYZER_URL or [analyzer].url"
        ),
        (None, false) => Arc::new(UnconfiguredAnalyzer),
    };

    let deps = SweepDeps {
        store,
        queue,
        candidates: corpus.clone(),
        content: corpus,
        analyzer,
    };
    Ok(SweepOrchestrator::new(deps, &config.sift))
}
