//! Sift control binary support: configuration loading and backend wiring
//! shared by the `siftctl` worker and operator commands.

pub mod app;
pub mod config;

pub use app::{Requirements, build_orchestrator};
pub use config::{AppConfig, ConfigLoadError, ConfigLoader, ConfigLoaderOptions};
