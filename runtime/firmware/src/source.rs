//! Where firmware images come from

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use tpu_mailbox::sync::lock;

use crate::{FirmwareError, Result};

/// Resolves an image name to its bytes
pub trait FirmwareSource: Send + Sync {
    /// # Errors
    /// `NotFound` if no image has this name, `Io` if it cannot be read.
    fn request(&self, name: &str) -> Result<Vec<u8>>;
}

/// Images read from files below one directory
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> Option<PathBuf> {
        let relative = Path::new(name);
        // names stay below the root
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if name.is_empty() || escapes {
            return None;
        }
        Some(self.root.join(relative))
    }
}

impl FirmwareSource for DirectorySource {
    fn request(&self, name: &str) -> Result<Vec<u8>> {
        let not_found = || FirmwareError::NotFound {
            name: name.to_owned(),
        };
        let path = self.resolve(name).ok_or_else(not_found)?;
        match fs::read(&path) {
            Ok(data) => {
                log::debug!("firmware: read {} ({} bytes)", path.display(), data.len());
                Ok(data)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(not_found()),
            Err(source) => Err(FirmwareError::Io {
                name: name.to_owned(),
                source,
            }),
        }
    }
}

/// Images held in memory, for tests and the simulator
#[derive(Debug, Default)]
pub struct MemorySource {
    images: Mutex<HashMap<String, Vec<u8>>>,
    requests: Mutex<Vec<String>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(self, name: &str, data: impl Into<Vec<u8>>) -> Self {
        self.insert(name, data);
        self
    }

    pub fn insert(&self, name: &str, data: impl Into<Vec<u8>>) {
        lock(&self.images).insert(name.to_owned(), data.into());
    }

    /// Names requested so far, in order
    pub fn requests(&self) -> Vec<String> {
        lock(&self.requests).clone()
    }
}

impl FirmwareSource for MemorySource {
    fn request(&self, name: &str) -> Result<Vec<u8>> {
        lock(&self.requests).push(name.to_owned());
        lock(&self.images)
            .get(name)
            .cloned()
            .ok_or_else(|| FirmwareError::NotFound {
                name: name.to_owned(),
            })
    }
}
