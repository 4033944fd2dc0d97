use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Global knobs for sweeps, workers and the coordination store.
///
/// Every section carries defaults so a deployment only needs to spell out the
/// values it wants to change.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SiftConfig {
    /// Key namespace in the coordination store.
    pub store: StoreConfig,
    /// Batch sizing, cooldown cadence and runtime ceiling.
    pub sweep: SweepConfig,
    /// Lifetimes of job status and control records.
    pub status: StatusConfig,
    /// Heartbeat cadence, staleness threshold and process control.
    pub liveness: LivenessConfig,
    /// Fingerprint sampling.
    pub cache: CacheConfig,
    /// Queue names and dequeue polling.
    pub queue: QueueConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "sift".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Entities per batch.
    pub batch_size: usize,
    /// Take a cooldown after this many processed entities. Zero disables it.
    pub cooldown_entities: usize,
    pub cooldown_secs: u64,
    /// Stop a run with `timeout` once it has been running this long.
    pub max_runtime_mins: u64,
    /// How often a paused run re-reads its control signal.
    pub pause_poll_ms: u64,
    /// Extra time a worker grants a job beyond `max_runtime_mins` before
    /// abandoning it.
    pub job_timeout_margin_mins: u64,
}

impl SweepConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn max_runtime(&self) -> Duration {
        Duration::from_secs(self.max_runtime_mins * 60)
    }

    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(
            (self.max_runtime_mins + self.job_timeout_margin_mins) * 60,
        )
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            cooldown_entities: 50,
            cooldown_secs: 30,
            max_runtime_mins: 60,
            pause_poll_ms: 2_000,
            job_timeout_margin_mins: 15,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// TTL renewed on every status update (seconds).
    pub status_ttl_secs: u64,
    /// TTL of a control signal (seconds).
    pub control_ttl_secs: u64,
}

impl StatusConfig {
    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status_ttl_secs)
    }

    pub fn control_ttl(&self) -> Duration {
        Duration::from_secs(self.control_ttl_secs)
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            status_ttl_secs: 3_600,
            control_ttl_secs: 3_600,
        }
    }
}

/// Heartbeat tuning for worker processes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// A worker whose last heartbeat is at least this old is stale (seconds).
    pub staleness_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// Grace period between SIGTERM and SIGKILL (ms).
    pub terminate_grace_ms: u64,
    /// Program launched by `spawn`; the current executable when unset.
    pub worker_program: Option<PathBuf>,
}

impl LivenessConfig {
    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    /// Store TTL on a worker record so crashed workers eventually vanish.
    pub fn record_ttl(&self) -> Duration {
        self.staleness() * 5
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            staleness_secs: 60,
            heartbeat_interval_secs: 30,
            terminate_grace_ms: 3_000,
            worker_program: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum content items folded into a fingerprint.
    pub sample_limit: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { sample_limit: 50 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub default_queue: String,
    /// Sleep between empty dequeue attempts (ms).
    pub poll_interval_ms: u64,
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_queue: "analysis".to_string(),
            poll_interval_ms: 1_000,
        }
    }
}
