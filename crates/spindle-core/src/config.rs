//! AdminConfig - JSON 設定ファイル
//!
//! すべてのセクションに既定値がある。ファイルが無ければ既定値で起動する。
//!
//! ```json
//! {
//!   "tasks": { "load_ms": 30000 },
//!   "retry": { "base_delay_ms": 2000, "multiplier": 2.0, "max_delay_ms": 300000 },
//!   "monitors": [{ "name": "inbox", "directory": "/srv/in" }],
//!   "profiles": [{ "customer": "acme", "profile": "hd", "customer_priority": 10 }]
//! }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::admin::monitor::DEFAULT_MONITOR_RETRIES;
use crate::admin::{ManagerSettings, MonitorSpec, RetryPolicy, TaskSettings, TaskTimeouts};
use crate::domain::notification::NotificationSpec;
use crate::domain::profile::ProfileTemplate;
use crate::impls::{NotifierConfig, SimConfig};
use crate::runtime::RuntimeSettings;
use crate::scheduler::SchedulerSettings;

/// Upper bound of `retry.multiplier`.
pub const MAX_RETRY_MULTIPLIER: f64 = 10.0;

/// Upper bound of every `max_retries` setting.
pub const MAX_RETRIES_LIMIT: u32 = 100;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub max_retries: u32,
    /// Monitors per worker, independent of its transcoding capacity.
    pub slots_per_worker: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MONITOR_RETRIES,
            slots_per_worker: 4,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub tasks: TaskTimeouts,
    pub retry: RetryPolicy,
    pub monitor: MonitorConfig,
    /// Transcoder manager settings.
    pub manager: ManagerSettings,
    pub scheduler: SchedulerSettings,
    pub runtime: RuntimeSettings,
    pub notifier: NotifierConfig,
    pub monitors: Vec<MonitorSpec>,
    pub profiles: Vec<ProfileTemplate>,
    /// Declared for every profile.
    pub notifications: Vec<NotificationSpec>,
    /// Simulated cluster used by the CLI.
    pub cluster: SimConfig,
}

impl AdminConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json(&raw).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let multiplier = self.retry.multiplier;
        if !(1.0..=MAX_RETRY_MULTIPLIER).contains(&multiplier) {
            return Err(ConfigError::Invalid(format!(
                "retry.multiplier must be within 1.0..={MAX_RETRY_MULTIPLIER}, got {multiplier}"
            )));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "retry.max_delay_ms ({}) is below retry.base_delay_ms ({})",
                self.retry.max_delay_ms, self.retry.base_delay_ms
            )));
        }
        for (section, max_retries) in [
            ("monitor", self.monitor.max_retries),
            ("scheduler", self.scheduler.max_retries),
        ] {
            if max_retries > MAX_RETRIES_LIMIT {
                return Err(ConfigError::Invalid(format!(
                    "{section}.max_retries must be at most {MAX_RETRIES_LIMIT}, got {max_retries}"
                )));
            }
        }
        if self.runtime.force_stop_attempts == 0 {
            return Err(ConfigError::Invalid(
                "runtime.force_stop_attempts must be at least 1".into(),
            ));
        }

        let mut names = HashSet::new();
        for monitor in &self.monitors {
            if !names.insert(monitor.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "monitor '{}' is declared twice",
                    monitor.name
                )));
            }
        }

        let mut profiles = HashSet::new();
        for template in &self.profiles {
            if !profiles.insert((template.customer.as_str(), template.profile.as_str())) {
                return Err(ConfigError::Invalid(format!(
                    "profile {}/{} is declared twice",
                    template.customer, template.profile
                )));
            }
        }
        Ok(())
    }

    pub fn task_settings(&self) -> TaskSettings {
        TaskSettings {
            retry: self.retry.clone(),
            timeouts: self.tasks.clone(),
        }
    }

    /// Monitor manager settings: fixed slots per worker.
    pub fn monitor_manager(&self) -> ManagerSettings {
        ManagerSettings {
            slots_per_worker: Some(self.monitor.slots_per_worker),
            ..self.manager.clone()
        }
    }

    pub fn template(&self, customer: &str, profile: &str) -> Option<&ProfileTemplate> {
        self.profiles
            .iter()
            .find(|t| t.customer == customer && t.profile == profile)
    }
}
