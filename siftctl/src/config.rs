//! Layered configuration for `siftctl`: TOML file, then `.env`, then
//! environment variables. Command-line flags are applied by the caller.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use sift_core::SiftConfig;
use thiserror::Error;

const DEFAULT_CONFIG_LOCATIONS: &[&str] = &["sift.toml", "config/sift.toml"];
const DEFAULT_CORPUS_PATH: &str = "corpus.json";
const DEFAULT_ANALYZER_TIMEOUT_SECS: u64 = 120;

pub const ENV_CONFIG_PATH: &str = "SIFT_CONFIG";
pub const ENV_REDIS_URL: &str = "SIFT_REDIS_URL";
pub const ENV_CORPUS_PATH: &str = "SIFT_CORPUS_PATH";
pub const ENV_ANALYZER_URL: &str = "SIFT_ANALYZER_URL";
pub const ENV_KEY_PREFIX: &str = "SIFT_KEY_PREFIX";
pub const ENV_BATCH_SIZE: &str = "SIFT_BATCH_SIZE";

/// Fully resolved settings for one `siftctl` invocation.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub sift: SiftConfig,
    /// Shared coordination store; in-process backends when unset.
    pub redis_url: Option<String>,
    pub corpus_path: PathBuf,
    pub analyzer: AnalyzerSettings,
    pub metadata: ConfigMetadata,
}

#[derive(Debug, Clone)]
pub struct AnalyzerSettings {
    pub url: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    redis: Option<FileRedisConfig>,
    corpus: FileCorpusConfig,
    analyzer: FileAnalyzerConfig,
    #[serde(flatten)]
    sift: SiftConfig,
}

#[derive(Debug, Deserialize)]
struct FileRedisConfig {
    url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileCorpusConfig {
    path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileAnalyzerConfig {
    url: Option<String>,
    timeout_secs: Option<u64>,
}

/// Environment overrides, captured once so composition stays pure.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub redis_url: Option<String>,
    pub corpus_path: Option<PathBuf>,
    pub analyzer_url: Option<String>,
    pub key_prefix: Option<String>,
    pub batch_size: Option<String>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        Self {
            config_path: get(ENV_CONFIG_PATH).map(PathBuf::from),
            redis_url: get(ENV_REDIS_URL),
            corpus_path: get(ENV_CORPUS_PATH).map(PathBuf::from),
            analyzer_url: get(ENV_ANALYZER_URL),
            key_prefix: get(ENV_KEY_PREFIX),
            batch_size: get(ENV_BATCH_SIZE),
        }
    }

    pub fn from_map(vars: &HashMap<String, String>) -> Self {
        Self::from_lookup(|key| vars.get(key).cloned())
    }
}

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn load(&self) -> Result<AppConfig, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(
                |err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                },
            )?,
            None => dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
        };

        let mut config = self.load_with_env(EnvConfig::gather())?;
        config.metadata.env_file_loaded = env_file_loaded;
        Ok(config)
    }

    /// Compose a configuration from the file layer and `env`, without
    /// touching the process environment.
    pub fn load_with_env(&self, env: EnvConfig) -> Result<AppConfig, ConfigLoadError> {
        let (file, config_path) = self.load_file_config(&env)?;
        compose(file.unwrap_or_default(), env, config_path)
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let (path, explicit) = match (&self.options.config_path, &env.config_path) {
            (Some(path), _) => (path.clone(), true),
            (None, Some(path)) => (path.clone(), true),
            (None, None) => match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .map(PathBuf::from)
                .find(|candidate| candidate.exists())
            {
                Some(path) => (path, false),
                None => return Ok((None, None)),
            },
        };

        if !path.exists() {
            if explicit {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            return Ok((None, None));
        }

        let file = read_file_config(&path)?;
        Ok((Some(file), Some(path)))
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    let contents = fs::read_to_string(path).map_err(|err| ConfigLoadError::Io {
        path: path.to_path_buf(),
        source: err,
    })?;
    toml::from_str(&contents).map_err(|err| ConfigLoadError::Parse {
        path: path.to_path_buf(),
        source: err,
    })
}

fn compose(
    file: FileConfig,
    env: EnvConfig,
    config_path: Option<PathBuf>,
) -> Result<AppConfig, ConfigLoadError> {
    let FileConfig {
        redis: file_redis,
        corpus: file_corpus,
        analyzer: file_analyzer,
        sift: mut sift,
    } = file;

    if let Some(prefix) = env.key_prefix {
        sift.store.key_prefix = prefix;
    }
    if let Some(raw) = env.batch_size {
        sift.sweep.batch_size = raw
            .trim()
            .parse()
            .map_err(|_| ConfigLoadError::InvalidValue {
                key: ENV_BATCH_SIZE,
                value: raw.clone(),
            })?;
    }
    if sift.sweep.batch_size == 0 {
        return Err(ConfigLoadError::InvalidValue {
            key: "sweep.batch_size",
            value: "0".to_string(),
        });
    }

    let redis_url = env.redis_url.or(file_redis.map(|redis| redis.url));
    let corpus_path = env
        .corpus_path
        .or(file_corpus.path)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CORPUS_PATH));
    let analyzer = AnalyzerSettings {
        url: env.analyzer_url.or(file_analyzer.url),
        timeout: Duration::from_secs(
            file_analyzer
                .timeout_secs
                .unwrap_or(DEFAULT_ANALYZER_TIMEOUT_SECS),
        ),
    };

    Ok(AppConfig {
        sift,
        redis_url,
        corpus_path,
        analyzer,
        metadata: ConfigMetadata {
            config_path,
            env_file_loaded: false,
        },
    })
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}
