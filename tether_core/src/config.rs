use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

const ENV_WORKER_THREADS: &str = "TETHER_WORKER_THREADS";
const ENV_MAX_BLOCKING_THREADS: &str = "TETHER_MAX_BLOCKING_THREADS";
const ENV_MAX_OUTSTANDING_TASKS: &str = "TETHER_MAX_OUTSTANDING_TASKS";
const ENV_THREAD_NAME: &str = "TETHER_THREAD_NAME";
const ENV_SHUTDOWN_TIMEOUT_MS: &str = "TETHER_SHUTDOWN_TIMEOUT_MS";

/// Settings for one [`Runtime`](crate::Runtime) instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Tokio worker threads. `None` uses tokio's default (one per core).
    pub worker_threads: Option<usize>,
    /// Cap on the blocking pool that runs launched foreign functions.
    pub max_blocking_threads: usize,
    /// Limit on launched tasks running at once. Launches past the limit are
    /// queued, not rejected.
    pub max_outstanding_tasks: Option<usize>,
    pub thread_name: String,
    pub shutdown_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            worker_threads: None,
            max_blocking_threads: 512,
            max_outstanding_tasks: None,
            thread_name: "tether-worker".to_string(),
            shutdown_timeout_ms: 5000,
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: RuntimeConfig =
            toml::from_str(source).map_err(|e| RuntimeError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = fs::read_to_string(path)
            .map_err(|e| RuntimeError::config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&source)
    }

    /// Defaults overridden by any `TETHER_*` environment variables that are set.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = RuntimeConfig::default();

        if let Some(value) = lookup(ENV_WORKER_THREADS) {
            config.worker_threads = Some(parse_var(ENV_WORKER_THREADS, &value)?);
        }
        if let Some(value) = lookup(ENV_MAX_BLOCKING_THREADS) {
            config.max_blocking_threads = parse_var(ENV_MAX_BLOCKING_THREADS, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_OUTSTANDING_TASKS) {
            config.max_outstanding_tasks = Some(parse_var(ENV_MAX_OUTSTANDING_TASKS, &value)?);
        }
        if let Some(value) = lookup(ENV_THREAD_NAME) {
            config.thread_name = value;
        }
        if let Some(value) = lookup(ENV_SHUTDOWN_TIMEOUT_MS) {
            config.shutdown_timeout_ms = parse_var(ENV_SHUTDOWN_TIMEOUT_MS, &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == Some(0) {
            return Err(RuntimeError::config("worker_threads must be at least 1"));
        }
        if self.max_blocking_threads == 0 {
            return Err(RuntimeError::config("max_blocking_threads must be at least 1"));
        }
        if self.max_outstanding_tasks == Some(0) {
            return Err(RuntimeError::config("max_outstanding_tasks must be at least 1"));
        }
        if self.thread_name.is_empty() {
            return Err(RuntimeError::config("thread_name must not be empty"));
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| RuntimeError::config(format!("{}={:?}: {}", key, value, e)))
}
