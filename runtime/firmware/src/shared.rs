//! Shared firmware image registry
//!
//! # Purpose
//! Several devices usually run the same image. The registry reads each
//! image once, keeps it in a buffer padded to the configured alignment and
//! hands out counted references to it.
//!
//! # Lifetime
//! A [`SharedFirmware`] handle is one reference. Cloning takes another,
//! dropping (or [`SharedFirmwareRegistry::put`]) gives it back, and the
//! buffer leaves the registry with the last one. An image can also be
//! pinned by the registry itself so that it survives while no device runs
//! it.
//!
//! The registry is an explicit object; there is no process-wide instance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tpu_mailbox::sync::lock;

use crate::source::FirmwareSource;
use crate::{FirmwareError, Result};

struct Entry {
    refs: usize,
    pinned: bool,
    data: Arc<[u8]>,
}

struct Registry {
    size_align: usize,
    images: Mutex<HashMap<Arc<str>, Entry>>,
}

impl Registry {
    fn images(&self) -> MutexGuard<'_, HashMap<Arc<str>, Entry>> {
        lock(&self.images)
    }

    fn acquire(&self, name: &str, data: &Arc<[u8]>) {
        if let Some(entry) = self.images().get_mut(name) {
            if Arc::ptr_eq(&entry.data, data) {
                entry.refs += 1;
            }
        }
    }

    fn release(&self, name: &str, data: &Arc<[u8]>) {
        let mut images = self.images();
        let Some(entry) = images.get_mut(name) else {
            return;
        };
        // a handle that outlived shutdown must not touch a reloaded image
        if !Arc::ptr_eq(&entry.data, data) {
            return;
        }
        entry.refs -= 1;
        if entry.refs == 0 {
            images.remove(name);
            log::debug!("firmware: released shared image {name}");
        }
    }
}

/// One counted reference to a shared image
pub struct SharedFirmware {
    registry: Arc<Registry>,
    name: Arc<str>,
    data: Arc<[u8]>,
}

impl SharedFirmware {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Image bytes followed by zero padding up to the aligned size
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Whether both handles refer to the same buffer
    pub fn same_buffer(&self, other: &SharedFirmware) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl Clone for SharedFirmware {
    fn clone(&self) -> Self {
        self.registry.acquire(&self.name, &self.data);
        Self {
            registry: Arc::clone(&self.registry),
            name: Arc::clone(&self.name),
            data: Arc::clone(&self.data),
        }
    }
}

impl Drop for SharedFirmware {
    fn drop(&mut self) {
        self.registry.release(&self.name, &self.data);
    }
}

impl core::fmt::Debug for SharedFirmware {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedFirmware")
            .field("name", &self.name)
            .field("size", &self.data.len())
            .finish()
    }
}

/// Name-indexed store of loaded images
#[derive(Clone)]
pub struct SharedFirmwareRegistry {
    inner: Arc<Registry>,
}

impl SharedFirmwareRegistry {
    /// # Errors
    /// `InvalidConfig` unless `size_align` is a power of two.
    pub fn new(size_align: usize) -> Result<Self> {
        if !size_align.is_power_of_two() {
            return Err(FirmwareError::InvalidConfig(format!(
                "size_align {size_align} must be a power of two"
            )));
        }
        Ok(Self {
            inner: Arc::new(Registry {
                size_align,
                images: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn size_align(&self) -> usize {
        self.inner.size_align
    }

    /// Take a reference to `name`, reading it from `source` on first use
    ///
    /// # Errors
    /// Whatever `source` reports for a name it cannot provide.
    pub fn load(&self, name: &str, source: &dyn FirmwareSource) -> Result<SharedFirmware> {
        let mut images = self.inner.images();
        let (key, data) = self.load_locked(&mut images, name, source)?;
        Ok(self.handle(key, data))
    }

    /// Find or read `name` and count one reference on it
    fn load_locked(
        &self,
        images: &mut HashMap<Arc<str>, Entry>,
        name: &str,
        source: &dyn FirmwareSource,
    ) -> Result<(Arc<str>, Arc<[u8]>)> {
        if let Some((key, entry)) = images.get_key_value(name) {
            let found = (Arc::clone(key), Arc::clone(&entry.data));
            if let Some(entry) = images.get_mut(name) {
                entry.refs += 1;
            }
            log::debug!("firmware: found shared image {name}");
            return Ok(found);
        }

        log::debug!("firmware: shared image {name} not loaded, requesting");
        let mut image = source.request(name)?;
        let aligned = image.len().next_multiple_of(self.inner.size_align);
        image.resize(aligned, 0);
        let data: Arc<[u8]> = image.into();
        let key: Arc<str> = Arc::from(name);
        images.insert(
            Arc::clone(&key),
            Entry {
                refs: 1,
                pinned: false,
                data: Arc::clone(&data),
            },
        );
        Ok((key, data))
    }

    fn handle(&self, name: Arc<str>, data: Arc<[u8]>) -> SharedFirmware {
        SharedFirmware {
            registry: Arc::clone(&self.inner),
            name,
            data,
        }
    }

    /// Another reference to the image behind `handle`
    pub fn get(&self, handle: &SharedFirmware) -> SharedFirmware {
        handle.clone()
    }

    /// A reference to `name` if it is loaded
    pub fn get_by_name(&self, name: &str) -> Option<SharedFirmware> {
        let mut images = self.inner.images();
        let (key, entry) = images.get_key_value(name)?;
        let handle = self.handle(Arc::clone(key), Arc::clone(&entry.data));
        if let Some(entry) = images.get_mut(name) {
            entry.refs += 1;
        }
        Some(handle)
    }

    /// Give back one reference
    pub fn put(&self, handle: SharedFirmware) {
        drop(handle);
    }

    /// Load `name` and hold a reference in the registry itself
    ///
    /// Pinning an image twice holds it once.
    pub fn pin(&self, name: &str, source: &dyn FirmwareSource) -> Result<()> {
        let mut images = self.inner.images();
        if images.get(name).is_some_and(|entry| entry.pinned) {
            return Ok(());
        }
        self.load_locked(&mut images, name, source)?;
        if let Some(entry) = images.get_mut(name) {
            entry.pinned = true;
        }
        Ok(())
    }

    /// Drop the registry's own reference to `name`
    ///
    /// Returns false if `name` was not pinned.
    pub fn unpin(&self, name: &str) -> bool {
        let mut images = self.inner.images();
        let Some(entry) = images.get_mut(name) else {
            return false;
        };
        if !entry.pinned {
            return false;
        }
        entry.pinned = false;
        entry.refs -= 1;
        if entry.refs == 0 {
            images.remove(name);
        }
        true
    }

    /// References currently held on `name`
    pub fn ref_count(&self, name: &str) -> usize {
        self.inner.images().get(name).map_or(0, |entry| entry.refs)
    }

    pub fn len(&self) -> usize {
        self.inner.images().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every image; warns about any that are still referenced
    pub fn shutdown(&self) {
        let mut images = self.inner.images();
        if !images.is_empty() {
            let names: Vec<&str> = images.keys().map(|name| &**name).collect();
            log::warn!("firmware: images not released on exit: {}", names.join(", "));
        }
        images.clear();
    }
}

impl core::fmt::Debug for SharedFirmwareRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedFirmwareRegistry")
            .field("size_align", &self.inner.size_align)
            .field("images", &self.len())
            .finish()
    }
}
