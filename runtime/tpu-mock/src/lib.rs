//! ⚠️  MOCK Edge TPU for host-side testing
//!
//! # WARNING: This is NOT the accelerator!
//!
//! A software model of the mailbox hardware and just enough control
//! firmware to exercise the host driver without silicon.
//!
//! ## What is modelled
//!
//! - [`MockRegisters`]: the mailbox CSR windows, including the doorbell
//!   side effects the host relies on
//! - [`MockAllocator`]: device-visible memory with stable device addresses
//!   and failure injection
//! - [`MockDevice`]: a thread playing the control processor. It consumes
//!   the command queue, asks a [`FirmwareModel`] what to answer, writes the
//!   response queue and raises the mailbox interrupt.
//!
//! ## Current Limitations
//!
//! - One mailbox per device thread
//! - No IOMMU: a device address is only valid as the base of an allocation
//! - Interrupts are plain callbacks run on the device thread

pub mod device;
pub mod firmware;
pub mod memory;
pub mod regs;

pub use device::MockDevice;
pub use firmware::{EchoFirmware, FirmwareModel, MockFwInfo, USAGE_METRIC_SIZE};
pub use memory::MockAllocator;
pub use regs::MockRegisters;
