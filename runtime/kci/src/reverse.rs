//! Reverse KCI
//!
//! # Purpose
//! Requests the firmware sends on its own initiative arrive in the response
//! queue with the reverse flag set in `seq`. The response path parks them
//! in a small ring and a worker thread dispatches them, so nothing slow
//! runs in interrupt context.
//!
//! # Architecture
//! ```text
//!   response path ──offer──► ReverseRing ──drain_one──► worker ──► route(code)
//!   (IRQ or drain)          (SPSC, fixed)                          ├─ chip handler    (< 0x8000)
//!                                                                  ├─ firmware crash  (0x8000)
//!                                                                  └─ log + drop      (other)
//! ```
//!
//! A full ring drops the request with a warning. The firmware re-sends
//! anything it cannot live without.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tpu_mailbox::sync::lock;
use tpu_mailbox::{DeferredWork, KciResponseElement};

use crate::{KciError, Result};

/// Highest code in the chip-specific range
pub const CHIP_REVERSE_CODE_MAX: u16 = 0x7FFF;
/// Generic code: the firmware crashed, `retval` holds the crash type
pub const RKCI_FIRMWARE_CRASH: u16 = 0x8000;

/// Where a reverse request is dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReverseRoute {
    Chip(u16),
    FirmwareCrash,
    Unknown(u16),
}

pub const fn route(code: u16) -> ReverseRoute {
    match code {
        0..=CHIP_REVERSE_CODE_MAX => ReverseRoute::Chip(code),
        RKCI_FIRMWARE_CRASH => ReverseRoute::FirmwareCrash,
        other => ReverseRoute::Unknown(other),
    }
}

/// Crash type reported with [`RKCI_FIRMWARE_CRASH`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashType {
    AssertFail,
    DataAbort,
    PrefetchAbort,
    UndefinedException,
    UnrecoverableFault,
    /// Sent by test firmware
    Dummy,
    Unknown(u32),
}

impl CrashType {
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::AssertFail,
            1 => Self::DataAbort,
            2 => Self::PrefetchAbort,
            3 => Self::UndefinedException,
            4 => Self::UnrecoverableFault,
            0xFF => Self::Dummy,
            other => Self::Unknown(other),
        }
    }

    pub const fn raw(self) -> u32 {
        match self {
            Self::AssertFail => 0,
            Self::DataAbort => 1,
            Self::PrefetchAbort => 2,
            Self::UndefinedException => 3,
            Self::UnrecoverableFault => 4,
            Self::Dummy => 0xFF,
            Self::Unknown(raw) => raw,
        }
    }

    /// Whether the firmware has stopped and must be restarted
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::UnrecoverableFault)
    }
}

/// Handles reverse requests in the chip-specific code range
pub trait ChipReverseHandler: Send + Sync {
    fn handle(&self, resp: &KciResponseElement);
}

/// Notified when the firmware reports a crash
pub trait FirmwareCrashHandler: Send + Sync {
    fn firmware_crashed(&self, crash: CrashType);
}

/// Chip handler for chips without chip-specific requests
#[derive(Debug, Default)]
pub struct IgnoreChipRequests;

impl ChipReverseHandler for IgnoreChipRequests {
    fn handle(&self, resp: &KciResponseElement) {
        log::warn!("rkci: unrecognized chip request {:#x}", resp.code);
    }
}

/// Fixed-capacity single-producer single-consumer ring
///
/// Producers and consumers are each serialized by their own spin lock, so
/// one side never waits for the other. Indices run freely and are masked
/// on access; the producer publishes a slot by storing `head` with
/// release ordering after writing it, the consumer frees one by storing
/// `tail` after reading it.
pub struct ReverseRing {
    buffer: Box<[UnsafeCell<KciResponseElement>]>,
    mask: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
    producer: spin::Mutex<()>,
    consumer: spin::Mutex<()>,
}

// SAFETY: a slot is written only by the producer holding `producer` while it
// lies outside [tail, head), and read only by the consumer holding `consumer`
// while it lies inside. The head/tail release-acquire pairs order the slot
// accesses between the two sides.
unsafe impl Sync for ReverseRing {}
unsafe impl Send for ReverseRing {}

impl ReverseRing {
    /// Ring for `capacity` requests
    ///
    /// # Errors
    /// `InvalidConfig` unless `capacity` is a non-zero power of two.
    pub fn new(capacity: u32) -> Result<Self> {
        if !capacity.is_power_of_two() {
            return Err(KciError::InvalidConfig(format!(
                "reverse ring capacity {capacity} is not a power of two"
            )));
        }
        Ok(Self {
            buffer: (0..capacity)
                .map(|_| UnsafeCell::new(KciResponseElement::default()))
                .collect(),
            mask: capacity as usize - 1,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            producer: spin::Mutex::new(()),
            consumer: spin::Mutex::new(()),
        })
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append one request
    ///
    /// # Errors
    /// Returns `ReverseFull` if the ring has no room; the ring is unchanged.
    pub fn offer(&self, resp: KciResponseElement) -> Result<()> {
        let _producer = self.producer.lock();
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= self.capacity() {
            return Err(KciError::ReverseFull);
        }
        // SAFETY: the slot at `head` is outside [tail, head), so the consumer
        // does not touch it, and we hold the producer lock.
        unsafe {
            *self.buffer[head & self.mask].get() = resp;
        }
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Remove the oldest request
    pub fn drain_one(&self) -> Option<KciResponseElement> {
        let _consumer = self.consumer.lock();
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        // SAFETY: the slot at `tail` is inside [tail, head), published by the
        // producer's release store of `head`, and we hold the consumer lock.
        let resp = unsafe { *self.buffer[tail & self.mask].get() };
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(resp)
    }
}

impl core::fmt::Debug for ReverseRing {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReverseRing")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

struct Handlers {
    chip: Arc<dyn ChipReverseHandler>,
    crash: Option<Arc<dyn FirmwareCrashHandler>>,
}

struct Shared {
    ring: ReverseRing,
    handlers: Mutex<Handlers>,
    dropped: AtomicU64,
}

impl Shared {
    fn dispatch(&self, resp: &KciResponseElement) {
        match route(resp.code) {
            ReverseRoute::Chip(_) => {
                let chip = Arc::clone(&lock(&self.handlers).chip);
                chip.handle(resp);
            }
            ReverseRoute::FirmwareCrash => {
                let crash = CrashType::from_raw(resp.retval);
                let handler = lock(&self.handlers).crash.clone();
                match handler {
                    Some(handler) => handler.firmware_crashed(crash),
                    None => log::error!("rkci: firmware crashed ({crash:?}), no handler"),
                }
            }
            ReverseRoute::Unknown(code) => {
                log::warn!("rkci: unrecognized generic request {code:#x}");
            }
        }
    }

    fn drain(&self) {
        while let Some(resp) = self.ring.drain_one() {
            self.dispatch(&resp);
        }
    }
}

/// Reverse-KCI channel: ring, worker and handlers
pub struct ReverseKci {
    shared: Arc<Shared>,
    work: DeferredWork,
}

impl ReverseKci {
    /// Create the ring and start its worker
    pub fn new(capacity: u32) -> Result<Self> {
        let shared = Arc::new(Shared {
            ring: ReverseRing::new(capacity)?,
            handlers: Mutex::new(Handlers {
                chip: Arc::new(IgnoreChipRequests),
                crash: None,
            }),
            dropped: AtomicU64::new(0),
        });
        let work = {
            let shared = Arc::clone(&shared);
            DeferredWork::spawn("kci-rkci", move || shared.drain())?
        };
        Ok(Self { shared, work })
    }

    pub fn set_chip_handler(&self, handler: Arc<dyn ChipReverseHandler>) {
        lock(&self.shared.handlers).chip = handler;
    }

    pub fn set_crash_handler(&self, handler: Arc<dyn FirmwareCrashHandler>) {
        lock(&self.shared.handlers).crash = Some(handler);
    }

    /// Queue a request and kick the worker
    ///
    /// # Errors
    /// `ReverseFull` if the ring is full; the request is counted as dropped.
    pub fn add_response(&self, resp: KciResponseElement) -> Result<()> {
        if let Err(e) = self.shared.ring.offer(resp) {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            self.work.schedule();
            return Err(e);
        }
        self.work.schedule();
        Ok(())
    }

    /// Dispatch everything queued on the calling thread
    pub fn flush(&self) {
        self.shared.drain();
    }

    /// Requests lost to a full ring
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn ring(&self) -> &ReverseRing {
        &self.shared.ring
    }

    /// Stop the worker; queued requests are not dispatched
    pub fn cancel(&self) {
        self.work.cancel_sync();
    }
}

impl core::fmt::Debug for ReverseKci {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReverseKci")
            .field("ring", &self.shared.ring)
            .field("dropped", &self.dropped())
            .finish()
    }
}

static_assertions::assert_impl_all!(ReverseRing: Send, Sync);
static_assertions::assert_impl_all!(ReverseKci: Send, Sync);
