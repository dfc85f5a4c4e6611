//! Mock device-visible memory
//!
//! Hands out page-aligned device addresses from a fixed window and keeps a
//! map from address to buffer so the device thread can resolve what the
//! host programs into the queue CSRs.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tpu_mailbox::sync::lock;
use tpu_mailbox::{CoherentMem, DeviceBuffer, DeviceMemoryAllocator, MailboxError, Result};

/// First device address handed out
pub const MOCK_IOVA_BASE: u64 = 0x1_0000_0000;
const PAGE_SIZE: u64 = 0x1000;

#[derive(Debug, Default)]
struct State {
    next_addr: u64,
    regions: BTreeMap<u64, Arc<DeviceBuffer>>,
    total_allocs: usize,
    /// Successful allocations left before injected failures begin
    fail_after: Option<usize>,
    /// Byte new buffers are filled with; zeroed if unset
    fill: Option<u8>,
}

#[derive(Debug)]
pub struct MockAllocator {
    state: Mutex<State>,
}

impl Default for MockAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAllocator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_addr: MOCK_IOVA_BASE,
                ..State::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    /// Hand out buffers filled with `byte`, like recycled device memory
    pub fn fill_with(&self, byte: u8) {
        self.state().fill = Some(byte);
    }

    /// Let `n` more allocations succeed, then fail every one after
    pub fn fail_after(&self, n: usize) {
        self.state().fail_after = Some(n);
    }

    pub fn clear_failures(&self) {
        self.state().fail_after = None;
    }

    /// Buffer mapped at exactly `device_addr`
    pub fn resolve(&self, device_addr: u64) -> Option<Arc<DeviceBuffer>> {
        self.state().regions.get(&device_addr).cloned()
    }

    /// Allocations not yet freed
    pub fn live_count(&self) -> usize {
        self.state().regions.len()
    }

    /// Successful allocations since creation
    pub fn total_allocs(&self) -> usize {
        self.state().total_allocs
    }
}

impl DeviceMemoryAllocator for MockAllocator {
    fn alloc(&self, size: usize) -> Result<CoherentMem> {
        let mut state = self.state();
        match state.fail_after {
            Some(0) => return Err(MailboxError::OutOfMemory { requested: size }),
            Some(ref mut left) => *left -= 1,
            None => {}
        }

        let addr = state.next_addr;
        let span = (size.max(1) as u64).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        state.next_addr += span;
        state.total_allocs += 1;

        let buffer = Arc::new(DeviceBuffer::new(size));
        if let Some(byte) = state.fill {
            buffer.write_bytes(0, &vec![byte; size]);
        }
        state.regions.insert(addr, Arc::clone(&buffer));
        log::trace!("mock alloc {size} bytes at {addr:#x}");
        Ok(CoherentMem::new(buffer, addr, size))
    }

    fn free(&self, mem: CoherentMem) {
        if self.state().regions.remove(&mem.device_addr()).is_none() {
            log::warn!("mock free of unknown region {:#x}", mem.device_addr());
        }
    }
}
