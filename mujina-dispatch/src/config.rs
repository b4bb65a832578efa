//! Configuration management for mujina-dispatch.
//!
//! Configuration is a single TOML file. Its location comes from the
//! `MUJINA_CONFIG` environment variable, falling back to
//! `/etc/mujina/mujina-dispatch.toml`. With neither present, built-in defaults
//! apply: no pools, priority scheduler as default.
//!
//! ```toml
//! [daemon]
//! log_level = "info"
//! pools_file = "/var/lib/mujina/pools.json"
//!
//! [[pools]]
//! url = "dummy://local"
//! username = "worker1"
//! priority = 0
//!
//! [schedulers]
//! default = "round-robin"
//!
//! [schedulers.round_robin]
//! interval = 300
//! load_balance = false
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::pool::PoolId;
use crate::scheduler::{PRIORITY, ROUND_ROBIN};
use crate::tracing::prelude::*;
use crate::work::Algorithm;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "MUJINA_CONFIG";

/// Configuration file used when the environment variable is unset.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/mujina/mujina-dispatch.toml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Daemon configuration
    pub daemon: DaemonConfig,

    /// Statically configured pools
    pub pools: Vec<PoolConfig>,

    /// Scheduler selection and tuning
    pub schedulers: SchedulersConfig,
}

/// Daemon process configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Log level used when RUST_LOG is unset
    pub log_level: String,

    /// Optional JSON file with additional pools
    pub pools_file: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            pools_file: None,
        }
    }
}

/// Pool connection configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Fixed identifier; generated when absent
    #[serde(default)]
    pub id: Option<PoolId>,

    /// Pool URL; the scheme selects the session type
    #[serde(default)]
    pub url: String,

    /// Worker name
    #[serde(default)]
    pub username: String,

    /// Password (if required)
    #[serde(default)]
    pub password: Option<String>,

    /// Priority (lower is higher priority)
    #[serde(default)]
    pub priority: u32,

    /// Mining algorithm
    #[serde(default)]
    pub algorithm: Algorithm,

    /// Added but not connected until enabled
    #[serde(default)]
    pub disabled: bool,
}

impl PoolConfig {
    /// Check required fields.
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(Error::Config("pool URL is missing".into()));
        }
        if self.username.trim().is_empty() {
            return Err(Error::Config(format!(
                "pool {} has no username",
                self.url
            )));
        }
        Ok(())
    }
}

/// Scheduler selection.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulersConfig {
    /// Name of the scheduler that takes devices without an affinity
    pub default: String,

    /// Round-robin tuning
    pub round_robin: RoundRobinConfig,
}

impl Default for SchedulersConfig {
    fn default() -> Self {
        Self {
            default: PRIORITY.into(),
            round_robin: RoundRobinConfig::default(),
        }
    }
}

/// Round-robin scheduler tuning.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RoundRobinConfig {
    /// Seconds between forced pool switches; 0 or absent disables
    pub interval: Option<u64>,

    /// Move devices toward the pool with fewer accepted shares
    pub load_balance: bool,
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self> {
        if let Ok(path) = env::var(CONFIG_ENV) {
            return Self::load_from(Path::new(&path));
        }

        let path = Path::new(DEFAULT_CONFIG_PATH);
        if path.exists() {
            Self::load_from(path)
        } else {
            info!("No configuration file at {}, using defaults.", path.display());
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        debug!(path = %path.display(), pools = config.pools.len(), "Loaded configuration");
        Ok(config)
    }

    /// Parse and validate configuration text.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Exactly one known scheduler must be the default.
    pub fn validate(&self) -> Result<()> {
        match self.schedulers.default.as_str() {
            PRIORITY | ROUND_ROBIN => Ok(()),
            other => Err(Error::Config(format!(
                "unknown default scheduler \"{other}\" (expected \"{PRIORITY}\" or \"{ROUND_ROBIN}\")"
            ))),
        }
    }
}
