//! Chip registers and memory the firmware loader drives
//!
//! Backends never touch hardware directly; they go through
//! [`ChipControl`]. [`SimulatedChip`] implements it in memory and can
//! forward core resets to a device model.

use std::sync::Mutex;

use tpu_mailbox::sync::lock;

use crate::{FirmwareError, Result};

/// Carveout the control core executes its firmware from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareRegion {
    pub base: u64,
    pub size: usize,
}

pub trait ChipControl: Send + Sync {
    /// Hold (`true`) or release (`false`) the control core's reset
    fn set_core_reset(&self, held: bool);

    /// Point instruction fetches of the control core at `base`
    fn remap_instructions(&self, base: u64);

    fn firmware_region(&self) -> FirmwareRegion;

    /// Copy `image` to the start of the firmware region
    ///
    /// # Errors
    /// `NoSpace` if `image` is larger than the region.
    fn write_firmware_region(&self, image: &[u8]) -> Result<()>;
}

/// Register writes a [`SimulatedChip`] saw, oldest first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipEvent {
    CoreReset(bool),
    Remap(u64),
    RegionWrite(usize),
}

type ResetHook = Box<dyn Fn(bool) + Send + Sync>;

/// In-memory chip with a firmware carveout
pub struct SimulatedChip {
    region: FirmwareRegion,
    memory: Mutex<Vec<u8>>,
    events: Mutex<Vec<ChipEvent>>,
    on_reset: Option<ResetHook>,
}

impl SimulatedChip {
    pub fn new(region: FirmwareRegion) -> Self {
        Self {
            region,
            memory: Mutex::new(vec![0; region.size]),
            events: Mutex::new(Vec::new()),
            on_reset: None,
        }
    }

    /// Call `hook` on every core reset change, e.g. to pause a device model
    pub fn with_reset_hook(mut self, hook: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.on_reset = Some(Box::new(hook));
        self
    }

    pub fn events(&self) -> Vec<ChipEvent> {
        lock(&self.events).clone()
    }

    pub fn clear_events(&self) {
        lock(&self.events).clear();
    }

    /// Copy of the first `len` bytes of the carveout
    pub fn region_contents(&self, len: usize) -> Vec<u8> {
        let memory = lock(&self.memory);
        memory[..len.min(memory.len())].to_vec()
    }
}

impl ChipControl for SimulatedChip {
    fn set_core_reset(&self, held: bool) {
        lock(&self.events).push(ChipEvent::CoreReset(held));
        if let Some(hook) = &self.on_reset {
            hook(held);
        }
    }

    fn remap_instructions(&self, base: u64) {
        lock(&self.events).push(ChipEvent::Remap(base));
    }

    fn firmware_region(&self) -> FirmwareRegion {
        self.region
    }

    fn write_firmware_region(&self, image: &[u8]) -> Result<()> {
        let mut memory = lock(&self.memory);
        if image.len() > memory.len() {
            return Err(FirmwareError::NoSpace {
                required: image.len(),
                available: memory.len(),
            });
        }
        memory[..image.len()].copy_from_slice(image);
        drop(memory);
        lock(&self.events).push(ChipEvent::RegionWrite(image.len()));
        Ok(())
    }
}

impl core::fmt::Debug for SimulatedChip {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SimulatedChip")
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const REGION: FirmwareRegion = FirmwareRegion {
        base: 0x1000_0000,
        size: 64,
    };

    #[test]
    fn test_region_write_bounds() {
        let chip = SimulatedChip::new(REGION);
        chip.write_firmware_region(&[7; 8]).unwrap();
        assert_eq!(chip.region_contents(9), [7, 7, 7, 7, 7, 7, 7, 7, 0]);
        assert!(matches!(
            chip.write_firmware_region(&[0; 65]),
            Err(FirmwareError::NoSpace {
                required: 65,
                available: 64
            })
        ));
    }

    #[test]
    fn test_reset_hook_and_events() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chip = {
            let calls = Arc::clone(&calls);
            SimulatedChip::new(REGION).with_reset_hook(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        chip.set_core_reset(true);
        chip.remap_instructions(REGION.base);
        chip.set_core_reset(false);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            chip.events(),
            vec![
                ChipEvent::CoreReset(true),
                ChipEvent::Remap(REGION.base),
                ChipEvent::CoreReset(false),
            ]
        );
    }
}
