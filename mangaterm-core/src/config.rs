use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use thiserror::Error;
use tracing::debug;

use crate::prefetch::PrefetchConfig;
use crate::reader::FitMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("prefetch.concurrency must be at least 1")]
    ZeroConcurrency,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Overrides the platform cache directory.
    pub cache_dir: Option<PathBuf>,
    pub prefetch: PrefetchSettings,
    pub reader: ReaderSettings,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchSettings {
    pub concurrency: usize,
    pub max_attempts: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "retry_backoff_ms")]
    pub retry_backoff: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "request_timeout_secs")]
    pub request_timeout: Duration,
}

impl Default for PrefetchSettings {
    fn default() -> Self {
        let defaults = PrefetchConfig::default();
        Self {
            concurrency: defaults.concurrency,
            max_attempts: defaults.max_attempts,
            retry_backoff: defaults.retry_backoff,
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderSettings {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "poll_interval_ms")]
    pub poll_interval: Duration,
    pub fit_mode: FitMode,
    pub grayscale: bool,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            fit_mode: FitMode::Screen,
            grayscale: true,
        }
    }
}

impl ReaderConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// A missing file yields the defaults; a malformed one is still an error.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            debug!(?path, "no config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prefetch.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        Ok(())
    }

    pub fn prefetch_config(&self) -> PrefetchConfig {
        PrefetchConfig {
            concurrency: self.prefetch.concurrency,
            max_attempts: self.prefetch.max_attempts.max(1),
            retry_backoff: self.prefetch.retry_backoff,
        }
    }
}
