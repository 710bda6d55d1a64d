//! Sandbox configuration loading.
//!
//! Settings come from an optional JSON file and are then overridden by
//! `HOPP_SANDBOX_*` environment variables.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::keepalive::{DEFAULT_GRACE_ROUNDS, DEFAULT_POLL_INTERVAL, KeepaliveSettings};
use crate::key_registry::KEY_EXPIRY_MS;

pub const DEFAULT_MEMORY_LIMIT_BYTES: usize = 64 * 1024 * 1024;
pub const DEFAULT_MAX_STACK_SIZE_BYTES: usize = 1024 * 1024;

/// Runtime limits and timing knobs for one sandbox run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Sliding TTL for registered crypto keys.
    #[serde(alias = "keyTtlMs")]
    pub key_ttl_ms: u64,
    #[serde(alias = "keepalivePollIntervalMs")]
    pub keepalive_poll_interval_ms: u64,
    /// Consecutive empty polls before the pending set counts as drained.
    #[serde(alias = "keepaliveGraceRounds")]
    pub keepalive_grace_rounds: u32,
    /// QuickJS heap limit; `0` disables it.
    #[serde(alias = "memoryLimitBytes")]
    pub memory_limit_bytes: usize,
    /// QuickJS stack limit; `0` disables it.
    #[serde(alias = "maxStackSizeBytes")]
    pub max_stack_size_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let poll_ms = DEFAULT_POLL_INTERVAL.as_millis() as u64;
        Self {
            key_ttl_ms: KEY_EXPIRY_MS,
            keepalive_poll_interval_ms: poll_ms,
            keepalive_grace_rounds: DEFAULT_GRACE_ROUNDS,
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            max_stack_size_bytes: DEFAULT_MAX_STACK_SIZE_BYTES,
        }
    }
}

fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

impl SandboxConfig {
    /// Load from an optional file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(env_lookup)?;
        Ok(config)
    }

    /// Load settings from a specific path. A missing or blank file yields
    /// the defaults.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Self = serde_json::from_str(&content).map_err(|e| {
            Error::config(format!(
                "Failed to parse sandbox config {}: {e}",
                path.display()
            ))
        })?;
        Ok(config)
    }

    /// Override fields from `HOPP_SANDBOX_*` variables resolved through
    /// `lookup`. Unset variables leave the field alone; unparsable ones are
    /// an error.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(name: &str, raw: Option<String>) -> Result<Option<T>> {
            raw.map(|value| {
                value.trim().parse::<T>().map_err(|_| {
                    Error::config(format!("Invalid value for {name}: {value:?}"))
                })
            })
            .transpose()
        }

        macro_rules! override_field {
            ($field:ident, $name:literal) => {
                if let Some(value) = parse($name, lookup($name))? {
                    tracing::debug!(
                        event = "sandbox.config.env_override",
                        variable = $name,
                        "Applied environment override"
                    );
                    self.$field = value;
                }
            };
        }

        override_field!(key_ttl_ms, "HOPP_SANDBOX_KEY_TTL_MS");
        override_field!(keepalive_poll_interval_ms, "HOPP_SANDBOX_KEEPALIVE_POLL_INTERVAL_MS");
        override_field!(keepalive_grace_rounds, "HOPP_SANDBOX_KEEPALIVE_GRACE_ROUNDS");
        override_field!(memory_limit_bytes, "HOPP_SANDBOX_MEMORY_LIMIT_BYTES");
        override_field!(max_stack_size_bytes, "HOPP_SANDBOX_MAX_STACK_SIZE_BYTES");
        Ok(())
    }

    pub const fn keepalive(&self) -> KeepaliveSettings {
        KeepaliveSettings {
            poll_interval: Duration::from_millis(self.keepalive_poll_interval_ms),
            grace_rounds: self.keepalive_grace_rounds,
        }
    }
}
