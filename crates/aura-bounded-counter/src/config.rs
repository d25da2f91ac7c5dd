//! Coordinator configuration.
//!
//! Values are layered: defaults, then an optional TOML file, then
//! `AURA_BCOUNTER_*` environment variables.

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const ENV_GRACE_PERIOD_MS: &str = "AURA_BCOUNTER_GRACE_PERIOD_MS";
const ENV_REBALANCE_PERIOD_MS: &str = "AURA_BCOUNTER_REBALANCE_PERIOD_MS";
const ENV_COMMAND_BUFFER: &str = "AURA_BCOUNTER_COMMAND_BUFFER";
const ENV_MAX_PENDING_AGE_MS: &str = "AURA_BCOUNTER_MAX_PENDING_AGE_MS";

fn default_grace_period_ms() -> u64 {
    500
}

fn default_rebalance_period_ms() -> u64 {
    5_000
}

fn default_command_buffer() -> usize {
    256
}

/// Settings for one replica's bounded-counter coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundedCounterConfig {
    /// Minimum interval between two transfers for the same key and target
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// Interval between rebalance passes, measured from the end of a pass
    #[serde(default = "default_rebalance_period_ms")]
    pub rebalance_period_ms: u64,

    /// Capacity of the coordinator mailbox
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,

    /// Queued deficits older than this are dropped (never, when unset)
    #[serde(default)]
    pub max_pending_age_ms: Option<u64>,
}

impl Default for BoundedCounterConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
            rebalance_period_ms: default_rebalance_period_ms(),
            command_buffer: default_command_buffer(),
            max_pending_age_ms: None,
        }
    }
}

impl BoundedCounterConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn rebalance_period(&self) -> Duration {
        Duration::from_millis(self.rebalance_period_ms)
    }

    pub fn max_pending_age(&self) -> Option<Duration> {
        self.max_pending_age_ms.map(Duration::from_millis)
    }

    pub fn with_grace_period(mut self, period: Duration) -> Self {
        self.grace_period_ms = duration_ms(period);
        self
    }

    pub fn with_rebalance_period(mut self, period: Duration) -> Self {
        self.rebalance_period_ms = duration_ms(period);
        self
    }

    pub fn with_max_pending_age(mut self, age: Duration) -> Self {
        self.max_pending_age_ms = Some(duration_ms(age));
        self
    }

    /// Parse a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Override fields from `AURA_BCOUNTER_*` variables in the process environment.
    pub fn merge_with_env(&mut self) -> Result<(), ConfigError> {
        self.merge_with_vars(std::env::vars())
    }

    /// Override fields from an explicit set of environment-style variables.
    pub fn merge_with_vars<I, K, V>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref());
            match key {
                ENV_GRACE_PERIOD_MS => self.grace_period_ms = parse_env(key, value)?,
                ENV_REBALANCE_PERIOD_MS => self.rebalance_period_ms = parse_env(key, value)?,
                ENV_COMMAND_BUFFER => self.command_buffer = parse_env(key, value)?,
                ENV_MAX_PENDING_AGE_MS => {
                    self.max_pending_age_ms = if value.is_empty() {
                        None
                    } else {
                        Some(parse_env(key, value)?)
                    };
                }
                _ => {}
            }
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rebalance_period_ms == 0 {
            return Err(ConfigError::OutOfRange {
                field: "rebalance_period_ms",
                min: 1,
                actual: 0,
            });
        }
        if self.command_buffer == 0 {
            return Err(ConfigError::OutOfRange {
                field: "command_buffer",
                min: 1,
                actual: 0,
            });
        }
        if self.max_pending_age_ms == Some(0) {
            return Err(ConfigError::OutOfRange {
                field: "max_pending_age_ms",
                min: 1,
                actual: 0,
            });
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
    })
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
