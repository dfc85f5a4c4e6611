//! Firmware error types

use std::io;

use thiserror::Error;
use tpu_kci::KciError;

#[derive(Debug, Error)]
pub enum FirmwareError {
    #[error("firmware image '{name}' not found")]
    NotFound { name: String },

    #[error("failed to read firmware image '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid firmware image: {0}")]
    InvalidImage(String),

    /// The image does not fit the buffer the backend set aside
    #[error("firmware buffer too small: {available} bytes available, {required} required")]
    NoSpace { required: usize, available: usize },

    #[error("device is in use by a group")]
    Busy,

    #[error("no firmware loaded")]
    NotLoaded,

    /// The firmware did not answer the info handshake
    #[error("firmware handshake failed: {0}")]
    Handshake(#[source] KciError),

    #[error("backend does not support {0}")]
    Unsupported(&'static str),

    #[error("invalid firmware configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse firmware configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error(transparent)]
    Kci(#[from] KciError),
}

pub type Result<T> = core::result::Result<T, FirmwareError>;
