//! KCI session configuration
//!
//! Loaded from the `[kci]` table of a TOML file or built in code. Every
//! field has a default, so an empty table is a valid configuration.
//!
//! ```toml
//! [kci]
//! queue_size = 64
//! profile = "emulation"
//! reverse_ring_size = 8
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tpu_mailbox::MAX_QUEUE_SIZE;

use crate::{KciError, Result};

/// Deployment the wait windows are tuned for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutProfile {
    /// Real silicon
    #[default]
    Production,
    /// Slow emulators and FPGA platforms
    Emulation,
    /// Test doubles that answer immediately or never
    Test,
}

impl TimeoutProfile {
    pub const fn timeout(self) -> Duration {
        match self {
            Self::Production => Duration::from_millis(5000),
            Self::Emulation => Duration::from_millis(60000),
            Self::Test => Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KciConfig {
    /// Element capacity of both KCI queues
    pub queue_size: u32,
    /// Wait window for queue space and for a response; overrides `profile`
    pub timeout_ms: Option<u64>,
    pub profile: TimeoutProfile,
    /// Capacity of the reverse-KCI ring
    pub reverse_ring_size: u32,
    /// Commands that may wait for a response at once; unlimited if unset
    pub max_pending: Option<u32>,
}

impl Default for KciConfig {
    fn default() -> Self {
        Self {
            queue_size: 64,
            timeout_ms: None,
            profile: TimeoutProfile::Production,
            reverse_ring_size: 8,
            max_pending: None,
        }
    }
}

impl KciConfig {
    /// Defaults with the wait window of `profile`
    pub fn for_profile(profile: TimeoutProfile) -> Self {
        Self {
            profile,
            ..Self::default()
        }
    }

    /// Parse the contents of a `[kci]` table
    ///
    /// # Errors
    /// `ConfigParse` for malformed TOML, `InvalidConfig` if a value is out
    /// of range.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout_ms
            .map_or_else(|| self.profile.timeout(), Duration::from_millis)
    }

    pub fn max_pending(&self) -> Option<usize> {
        self.max_pending.map(|n| n as usize)
    }

    /// Reject values the session cannot run with
    pub fn validate(&self) -> Result<()> {
        if !self.queue_size.is_power_of_two() || self.queue_size > MAX_QUEUE_SIZE {
            return Err(KciError::InvalidConfig(format!(
                "queue_size {} must be a power of two no larger than {}",
                self.queue_size, MAX_QUEUE_SIZE
            )));
        }
        if !self.reverse_ring_size.is_power_of_two() {
            return Err(KciError::InvalidConfig(format!(
                "reverse_ring_size {} must be a power of two",
                self.reverse_ring_size
            )));
        }
        if self.timeout().is_zero() {
            return Err(KciError::InvalidConfig("timeout must be non-zero".into()));
        }
        if self.max_pending == Some(0) {
            return Err(KciError::InvalidConfig("max_pending must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = KciConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timeout(), Duration::from_secs(5));
        assert_eq!(config.max_pending(), None);
    }

    #[test]
    fn test_profile_and_override() {
        let config = KciConfig::from_toml_str("profile = \"emulation\"").unwrap();
        assert_eq!(config.timeout(), Duration::from_secs(60));

        let config = KciConfig::from_toml_str("profile = \"test\"\ntimeout_ms = 50").unwrap();
        assert_eq!(config.timeout(), Duration::from_millis(50));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            KciConfig::from_toml_str("queue_size = 48"),
            Err(KciError::InvalidConfig(_))
        ));
        assert!(matches!(
            KciConfig::from_toml_str("queue_size = 1024"),
            Err(KciError::InvalidConfig(_))
        ));
        assert!(matches!(
            KciConfig::from_toml_str("max_pending = 0"),
            Err(KciError::InvalidConfig(_))
        ));
        assert!(matches!(
            KciConfig::from_toml_str("timeout_ms = 0"),
            Err(KciError::InvalidConfig(_))
        ));
        assert!(matches!(
            KciConfig::from_toml_str("queue_size = \"big\""),
            Err(KciError::ConfigParse(_))
        ));
    }
}
