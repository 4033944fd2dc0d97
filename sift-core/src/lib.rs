//! # Sift Core
//!
//! Resumable batch-analysis sweeps over a large corpus: every candidate
//! entity is handed to a slow external analyzer, safely, resumably and under
//! resource pressure.
//!
//! ## Overview
//!
//! - **Worker liveness**: analyzer processes register and heartbeat; stale
//!   records are reaped whenever workers are listed
//! - **Batch ledger**: the candidate set is partitioned into numbered,
//!   accountable batches that can be re-entered after a failure
//! - **Analysis cache**: a content fingerprint per entity lets unchanged
//!   entities skip the analyzer entirely
//! - **Control plane**: pause, resume and stop signals, cooldown
//!   backpressure and a runtime ceiling, reported through per-run status
//!   records
//!
//! All state lives in a shared [`store::CoordinationStore`]; nothing held in
//! process memory is authoritative.
//!
//! ## Feature Flags
//!
//! - `redis-backend` (default): [`store::RedisStore`] and
//!   [`queue::RedisJobQueue`]
//! - `http-analyzer` (default): [`analyzer::HttpAnalyzer`]
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use sift_core::{
//!     SiftConfig, SweepDeps, SweepOrchestrator, SweepRequest,
//!     corpus::JsonCorpus, queue::InProcJobQueue, store::InMemoryStore,
//! };
//!
//! # async fn run(analyzer: Arc<dyn sift_core::ports::Analyzer>) -> sift_core::Result<()> {
//! let corpus = Arc::new(JsonCorpus::load("corpus.json").await?);
//! let deps = SweepDeps {
//!     store: Arc::new(InMemoryStore::new()),
//!     queue: Arc::new(InProcJobQueue::new()),
//!     candidates: corpus.clone(),
//!     content: corpus,
//!     analyzer,
//! };
//! let orchestrator = SweepOrchestrator::new(deps, &SiftConfig::default());
//! let job = orchestrator
//!     .queue_batch_sweep(&SweepRequest::default().auto_continue(true))
//!     .await?;
//! # let _ = job;
//! # Ok(())
//! # }
//! ```

#[cfg(feature = "http-analyzer")]
pub mod analyzer;
pub mod cache;
pub mod config;
pub mod control;
pub mod corpus;
pub mod error;
pub mod fingerprint;
pub mod ledger;
pub mod liveness;
pub mod orchestrator;
pub mod ports;
pub mod queue;
pub mod store;
pub mod types;
pub mod worker;

pub use config::SiftConfig;
pub use error::{Result, SiftError};
pub use orchestrator::{RunSummary, SweepDeps, SweepOrchestrator};
pub use types::{DocumentId, EntityId, JobId, SweepFilter, SweepJob, SweepRequest, WorkerId};
pub use worker::QueueWorker;
