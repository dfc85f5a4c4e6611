//! Simulator configuration file
//!
//! ```toml
//! [kci]
//! queue_size = 32
//! profile = "test"
//!
//! [firmware]
//! backend = "janeiro"
//! search_path = "./images"
//! ```

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tpu_firmware::FirmwareConfig;
use tpu_kci::KciConfig;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub kci: KciConfig,
    pub firmware: FirmwareConfig,
}

impl SimConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("Invalid simulator config")?;
        config.kci.validate()?;
        config.firmware.validate()?;
        Ok(config)
    }

    /// Read `path`, or fall back to defaults when no file is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("In {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpu_firmware::BackendKind;
    use tpu_kci::TimeoutProfile;

    #[test]
    fn test_empty_file_is_default() {
        let config = SimConfig::from_toml_str("").unwrap();
        assert_eq!(config.kci, KciConfig::default());
        assert_eq!(config.firmware.backend, BackendKind::Default);
    }

    #[test]
    fn test_both_tables() {
        let config = SimConfig::from_toml_str(
            "[kci]\nqueue_size = 16\nprofile = \"test\"\n\n[firmware]\nbackend = \"abrolhos\"\n",
        )
        .unwrap();
        assert_eq!(config.kci.queue_size, 16);
        assert_eq!(config.kci.profile, TimeoutProfile::Test);
        assert_eq!(config.firmware.backend, BackendKind::Abrolhos);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(SimConfig::from_toml_str("[kci]\nqueue_size = 3\n").is_err());
        assert!(SimConfig::from_toml_str("[firmware]\nsize_align = 100\n").is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(SimConfig::load(Some(Path::new("/nonexistent/kci-sim.toml"))).is_err());
        assert!(SimConfig::load(None).is_ok());
    }
}
