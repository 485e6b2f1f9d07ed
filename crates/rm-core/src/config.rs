//! Resource manager configuration
//!
//! Timeouts and limits shared by every owner of a domain. Configuration is
//! built in code or loaded from a TOML document; either way it is validated
//! before a domain accepts it.

use crate::errors::{RmError, RmResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Domain-wide limits and timeouts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RmConfig {
    /// Deadline of every outgoing request, session setup included
    pub outgoing_timeout_ms: u64,

    /// Rechecks after which a waiting request fails with a live-lock error
    pub max_rechecks: u32,

    /// Highest request priority; queues exist for 0..=max_priority
    pub max_priority: u8,

    /// Pending and granted incoming requests allowed per owner
    pub max_incoming_per_owner: usize,

    /// How long a caller waits for windup to settle
    pub windup_timeout_ms: u64,
}

impl Default for RmConfig {
    fn default() -> Self {
        Self {
            // Covers a slow session setup plus one round trip
            outgoing_timeout_ms: 30_000,
            max_rechecks: 64,
            max_priority: 7,
            max_incoming_per_owner: 4096,
            windup_timeout_ms: 120_000,
        }
    }
}

impl RmConfig {
    /// Short deadlines for tests
    pub fn testing() -> Self {
        Self {
            outgoing_timeout_ms: 500,
            windup_timeout_ms: 5_000,
            max_incoming_per_owner: 64,
            ..Default::default()
        }
    }

    /// Outgoing deadline as a duration
    pub fn outgoing_timeout(&self) -> Duration {
        Duration::from_millis(self.outgoing_timeout_ms)
    }

    /// Windup deadline as a duration
    pub fn windup_timeout(&self) -> Duration {
        Duration::from_millis(self.windup_timeout_ms)
    }

    /// Validate configuration settings
    pub fn validate(&self) -> RmResult<()> {
        if self.outgoing_timeout_ms == 0 {
            return Err(RmError::invalid("outgoing_timeout_ms must be greater than 0"));
        }
        if self.max_rechecks == 0 {
            return Err(RmError::invalid("max_rechecks must be greater than 0"));
        }
        if self.max_incoming_per_owner == 0 {
            return Err(RmError::invalid(
                "max_incoming_per_owner must be greater than 0",
            ));
        }
        if self.windup_timeout_ms < self.outgoing_timeout_ms {
            return Err(RmError::invalid(
                "windup_timeout_ms must not be shorter than outgoing_timeout_ms",
            ));
        }
        Ok(())
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> RmResult<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load_from_file(path: impl AsRef<Path>) -> RmResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&source)?;
        debug!(path = %path.display(), "loaded resource manager config");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        assert!(RmConfig::default().validate().is_ok());
        assert!(RmConfig::testing().validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_timeout() {
        let config = RmConfig {
            outgoing_timeout_ms: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(RmError::Invalid { .. })));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = RmConfig::from_toml_str("max_rechecks = 8\nmax_priority = 3\n").unwrap();
        assert_eq!(config.max_rechecks, 8);
        assert_eq!(config.max_priority, 3);
        assert_eq!(config.outgoing_timeout_ms, 30_000);
    }

    #[test]
    fn test_bad_toml_is_invalid() {
        let err = RmConfig::from_toml_str("max_rechecks = \"many\"").unwrap_err();
        assert!(matches!(err, RmError::Invalid { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "outgoing_timeout_ms = 250").unwrap();
        writeln!(file, "windup_timeout_ms = 1000").unwrap();
        let config = RmConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.outgoing_timeout(), Duration::from_millis(250));
        assert_eq!(config.windup_timeout(), Duration::from_secs(1));
    }
}
