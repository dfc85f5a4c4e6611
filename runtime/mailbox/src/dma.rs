//! Device-Visible Memory
//!
//! # Purpose
//! Queue buffers and command payloads live in memory that both the host and
//! the accelerator can reach. This module models such a region as an array
//! of 64-bit words with a stable device address.
//!
//! # Integration Points
//! - Provided by: the platform layer (IOMMU-backed pool on hardware,
//!   `tpu-mock` in tests) through [`DeviceMemoryAllocator`]
//! - Used by: mailbox channels, KCI commands carrying DMA payloads
//!
//! # Architecture
//! A [`DeviceBuffer`] is shared with the device side through an `Arc`.
//! Every word is an `AtomicU64`, so host and device may touch the same
//! region concurrently without undefined behaviour; ordering between them
//! is established by the register accesses in [`crate::csr`], exactly as
//! it is on real hardware.

use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::element::QueueElement;
use crate::Result;

/// Word-addressed region of device-visible memory
pub struct DeviceBuffer {
    words: Box<[AtomicU64]>,
}

impl DeviceBuffer {
    /// Create a zeroed buffer of at least `bytes` bytes
    pub fn new(bytes: usize) -> Self {
        let words = bytes.div_ceil(8);
        Self {
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Size in bytes
    pub fn len(&self) -> usize {
        self.words.len() * 8
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn read_word(&self, index: usize) -> u64 {
        self.words[index].load(Ordering::Relaxed)
    }

    pub fn write_word(&self, index: usize, value: u64) {
        self.words[index].store(value, Ordering::Relaxed);
    }

    /// Number of `T` elements the buffer holds
    pub fn capacity_of<T: QueueElement>(&self) -> usize {
        self.words.len() / T::WORDS
    }

    /// Read the element in slot `slot`
    ///
    /// # Panics
    /// Panics if the slot lies outside the buffer.
    pub fn read_element<T: QueueElement>(&self, slot: u32) -> T {
        let base = slot as usize * T::WORDS;
        let mut words = [0u64; 8];
        for (i, word) in words.iter_mut().take(T::WORDS).enumerate() {
            *word = self.read_word(base + i);
        }
        T::decode(&words[..T::WORDS])
    }

    /// Write `elem` into slot `slot`
    ///
    /// # Panics
    /// Panics if the slot lies outside the buffer.
    pub fn write_element<T: QueueElement>(&self, slot: u32, elem: &T) {
        let base = slot as usize * T::WORDS;
        let mut words = [0u64; 8];
        elem.encode(&mut words[..T::WORDS]);
        for (i, word) in words.iter().take(T::WORDS).enumerate() {
            self.write_word(base + i, *word);
        }
    }

    /// Copy `data` into the buffer at byte `offset` (little-endian words)
    pub fn write_bytes(&self, offset: usize, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            let pos = offset + i;
            let shift = (pos % 8) * 8;
            let word = &self.words[pos / 8];
            let mask = !(0xffu64 << shift);
            let old = word.load(Ordering::Relaxed);
            word.store((old & mask) | (u64::from(*byte) << shift), Ordering::Relaxed);
        }
    }

    /// Copy bytes starting at `offset` into `out`
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        for (i, byte) in out.iter_mut().enumerate() {
            let pos = offset + i;
            *byte = (self.read_word(pos / 8) >> ((pos % 8) * 8)) as u8;
        }
    }

    /// Zero the whole buffer
    pub fn clear(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }
}

impl core::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeviceBuffer").field("len", &self.len()).finish()
    }
}

/// A coherent allocation: host view plus the device address it is mapped at
#[derive(Debug, Clone)]
pub struct CoherentMem {
    buffer: Arc<DeviceBuffer>,
    device_addr: u64,
    size: usize,
}

impl CoherentMem {
    pub fn new(buffer: Arc<DeviceBuffer>, device_addr: u64, size: usize) -> Self {
        Self {
            buffer,
            device_addr,
            size,
        }
    }

    /// Address the accelerator uses for this region
    pub fn device_addr(&self) -> u64 {
        self.device_addr
    }

    /// Requested size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Host view of the region
    pub fn buffer(&self) -> &Arc<DeviceBuffer> {
        &self.buffer
    }
}

/// Capability that hands out device-visible memory
///
/// Implementations must keep the device address of an allocation stable
/// until it is passed back to [`DeviceMemoryAllocator::free`].
pub trait DeviceMemoryAllocator: Send + Sync {
    /// Allocate `size` bytes
    ///
    /// # Errors
    /// Returns `MailboxError::OutOfMemory` if no region is available.
    fn alloc(&self, size: usize) -> Result<CoherentMem>;

    /// Return a region obtained from [`DeviceMemoryAllocator::alloc`]
    fn free(&self, mem: CoherentMem);
}
