//! Recovery configuration
//!
//! Loaded from TOML, overridden from `TESSERA_*` environment variables and
//! validated before use. Every barrier in the recovery protocol takes its
//! deadline from here.

use crate::{TesseraError, TesseraResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for overrides (`TESSERA_MIN_REPLICAS=2`).
pub const ENV_PREFIX: &str = "TESSERA_";

/// Tunables for cluster formation and recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecoveryConfig {
    /// Minimum number of replicas the consensus protocol needs to run.
    pub min_replicas: usize,
    /// Deadline for the public replay / commit sync barrier.
    pub public_sync_timeout_ms: u64,
    /// Deadline for the apply-secrets broadcast barrier.
    pub apply_secrets_timeout_ms: u64,
    /// Unseal attempts per node before the recovery is declared failed.
    pub max_unseal_retries: u32,
    /// Records replayed between cooperative yields to the runtime.
    pub replay_yield_interval: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            min_replicas: 1,
            public_sync_timeout_ms: 30_000,
            apply_secrets_timeout_ms: 30_000,
            max_unseal_retries: 3,
            replay_yield_interval: 64,
        }
    }
}

impl RecoveryConfig {
    /// Load configuration from a TOML file. Missing keys take defaults.
    pub fn load_from_file(path: &Path) -> TesseraResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TesseraError::storage(format!(
                "failed to read config file {}: {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> TesseraResult<Self> {
        toml::from_str(content).map_err(|e| TesseraError::invalid(format!("invalid TOML: {e}")))
    }

    /// Apply `TESSERA_*` overrides from the process environment.
    pub fn merge_with_env(&mut self) -> TesseraResult<()> {
        self.merge_with_vars(std::env::vars())
    }

    /// Apply overrides from an explicit variable list.
    pub fn merge_with_vars(
        &mut self,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> TesseraResult<()> {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            self.set_from_string(&name.to_lowercase(), &value)?;
        }
        Ok(())
    }

    /// Set a single field by name.
    pub fn set_from_string(&mut self, key: &str, value: &str) -> TesseraResult<()> {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> TesseraResult<T> {
            value
                .parse()
                .map_err(|_| TesseraError::invalid(format!("invalid value for {key}: {value}")))
        }

        match key {
            "min_replicas" => self.min_replicas = parse(key, value)?,
            "public_sync_timeout_ms" => self.public_sync_timeout_ms = parse(key, value)?,
            "apply_secrets_timeout_ms" => self.apply_secrets_timeout_ms = parse(key, value)?,
            "max_unseal_retries" => self.max_unseal_retries = parse(key, value)?,
            "replay_yield_interval" => self.replay_yield_interval = parse(key, value)?,
            other => {
                tracing::debug!(key = other, "ignoring unknown configuration override");
            }
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> TesseraResult<()> {
        if self.min_replicas == 0 {
            return Err(TesseraError::invalid("min_replicas must be at least 1"));
        }
        if self.public_sync_timeout_ms == 0 || self.apply_secrets_timeout_ms == 0 {
            return Err(TesseraError::invalid("barrier timeouts must be non-zero"));
        }
        if self.max_unseal_retries == 0 {
            return Err(TesseraError::invalid("max_unseal_retries must be at least 1"));
        }
        if self.replay_yield_interval == 0 {
            return Err(TesseraError::invalid(
                "replay_yield_interval must be at least 1",
            ));
        }
        Ok(())
    }

    /// Public sync barrier deadline.
    pub fn public_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.public_sync_timeout_ms)
    }

    /// Apply-secrets barrier deadline.
    pub fn apply_secrets_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_secrets_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        RecoveryConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = RecoveryConfig::from_toml_str("min_replicas = 2\n").unwrap();
        assert_eq!(config.min_replicas, 2);
        assert_eq!(config.max_unseal_retries, 3);
    }

    #[test]
    fn unknown_toml_key_is_rejected() {
        let err = RecoveryConfig::from_toml_str("replicas = 2\n").unwrap_err();
        assert_matches!(err, TesseraError::Invalid { .. });
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = RecoveryConfig::default();
        config
            .merge_with_vars(vec![
                ("TESSERA_PUBLIC_SYNC_TIMEOUT_MS".to_string(), "250".to_string()),
                ("HOME".to_string(), "/root".to_string()),
            ])
            .unwrap();
        assert_eq!(config.public_sync_timeout_ms, 250);

        let err = config
            .merge_with_vars(vec![(
                "TESSERA_MIN_REPLICAS".to_string(),
                "many".to_string(),
            )])
            .unwrap_err();
        assert_matches!(err, TesseraError::Invalid { .. });
    }

    #[test]
    fn zero_values_fail_validation() {
        let config = RecoveryConfig {
            min_replicas: 0,
            ..RecoveryConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "apply_secrets_timeout_ms = 1500").unwrap();
        let config = RecoveryConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.apply_secrets_timeout(), Duration::from_millis(1500));
    }
}
