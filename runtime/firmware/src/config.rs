//! Firmware loader configuration
//!
//! ```toml
//! [firmware]
//! backend = "janeiro"
//! search_path = "/lib/firmware"
//! default_image = "google/edgetpu-janeiro.fw"
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{FirmwareError, Result};

/// Which chip's loading sequence to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Shared image buffers, no chip-specific steps
    #[default]
    Default,
    Janeiro,
    Abrolhos,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmwareConfig {
    pub backend: BackendKind,
    /// Directory firmware images are read from
    pub search_path: PathBuf,
    /// Shared image buffers are padded to a multiple of this
    pub size_align: usize,
    /// Image run at bring-up
    pub default_image: String,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Default,
            search_path: PathBuf::from("/lib/firmware"),
            size_align: 4096,
            default_image: String::from("google/edgetpu-janeiro.fw"),
        }
    }
}

impl FirmwareConfig {
    /// Parse the contents of a `[firmware]` table
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.size_align.is_power_of_two() {
            return Err(FirmwareError::InvalidConfig(format!(
                "size_align {} must be a power of two",
                self.size_align
            )));
        }
        if self.default_image.is_empty() {
            return Err(FirmwareError::InvalidConfig(
                "default_image must not be empty".into(),
            ));
        }
        Ok(())
    }
}
