//! Server configuration
//!
//! Loaded from TOML, with environment overrides:
//!
//! - `CREDIT_FLOW_CONFIG`: path to a TOML file (optional)
//! - `CREDIT_FLOW_GRANT_MODE`: `full`, `random` or `clamped`
//! - `CREDIT_FLOW_SEED`: seed for grant and latency sampling
//!
//! ```toml
//! seed = 7
//! journal = true
//!
//! [grant]
//! mode = "clamped"
//!
//! [latency]
//! work_min_ms = 1
//! work_max_ms = 50
//! cancel_min_ms = 1
//! cancel_max_ms = 50
//! ```

use crate::protocol::GrantMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Root seed; grant and latency streams are forked from it
    pub seed: u64,
    /// Record every applied action for conformance replay
    pub journal: bool,
    pub grant: GrantConfig,
    pub latency: LatencyConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            seed: 0,
            journal: false,
            grant: GrantConfig::default(),
            latency: LatencyConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Full grants and fixed latencies: every run takes the same path.
    pub fn deterministic() -> Self {
        ServerConfig {
            seed: 0,
            journal: true,
            grant: GrantConfig {
                mode: GrantMode::Full,
            },
            latency: LatencyConfig::fixed(Duration::from_millis(10), Duration::from_millis(5)),
        }
    }

    /// Seeded config for simulation tests.
    pub fn test(seed: u64) -> Self {
        ServerConfig {
            seed,
            journal: true,
            grant: GrantConfig::default(),
            latency: LatencyConfig::test(),
        }
    }

    pub fn with_grant_mode(mut self, mode: GrantMode) -> Self {
        self.grant.mode = mode;
        self
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// File named by `CREDIT_FLOW_CONFIG` (or defaults), then env overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("CREDIT_FLOW_CONFIG") {
            Ok(path) => Self::load(path)?,
            Err(_) => ServerConfig::default(),
        };

        if let Ok(mode) = std::env::var("CREDIT_FLOW_GRANT_MODE") {
            config.grant.mode = mode.parse().map_err(ConfigError::Invalid)?;
        }
        if let Ok(seed) = std::env::var("CREDIT_FLOW_SEED") {
            config.seed = seed.parse().map_err(|_| {
                ConfigError::Invalid(format!("CREDIT_FLOW_SEED '{}' is not a u64", seed))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.latency.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GrantConfig {
    pub mode: GrantMode,
}

/// Bounds for the simulated service and cancellation-propagation delays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    #[serde(rename = "work_min_ms", with = "duration_millis")]
    pub work_min: Duration,
    #[serde(rename = "work_max_ms", with = "duration_millis")]
    pub work_max: Duration,
    #[serde(rename = "cancel_min_ms", with = "duration_millis")]
    pub cancel_min: Duration,
    #[serde(rename = "cancel_max_ms", with = "duration_millis")]
    pub cancel_max: Duration,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        LatencyConfig {
            work_min: Duration::from_millis(1),
            work_max: Duration::from_millis(50),
            cancel_min: Duration::from_millis(1),
            cancel_max: Duration::from_millis(50),
        }
    }
}

impl LatencyConfig {
    pub fn fixed(work: Duration, cancel: Duration) -> Self {
        LatencyConfig {
            work_min: work,
            work_max: work,
            cancel_min: cancel,
            cancel_max: cancel,
        }
    }

    /// Overlapping work and cancel ranges so both sides of the race get exercised
    pub fn test() -> Self {
        LatencyConfig {
            work_min: Duration::from_millis(1),
            work_max: Duration::from_millis(20),
            cancel_min: Duration::from_millis(1),
            cancel_max: Duration::from_millis(20),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.work_min > self.work_max {
            return Err(ConfigError::Invalid(format!(
                "work_min_ms ({}) exceeds work_max_ms ({})",
                self.work_min.as_millis(),
                self.work_max.as_millis()
            )));
        }
        if self.cancel_min > self.cancel_max {
            return Err(ConfigError::Invalid(format!(
                "cancel_min_ms ({}) exceeds cancel_max_ms ({})",
                self.cancel_min.as_millis(),
                self.cancel_max.as_millis()
            )));
        }
        Ok(())
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
