//! Edge TPU firmware bring-up
//!
//! Loads control firmware images, starts the control core on them through
//! a chip [`backend`], confirms the start with the KCI info handshake and
//! recovers from firmware crashes.
//!
//! # Architecture
//! ```text
//!  FirmwareSource ─► SharedFirmwareRegistry ─┐
//!                                            ▼
//!  Firmware ──► FirmwareBackend ──► ChipControl (reset, remap, carveout)
//!     │  ▲
//!     │  └── crash handler ◄── reverse KCI
//!     ▼
//!    Kci (fw_info handshake)     GroupRegistry, Handshake
//! ```
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use tpu_firmware::{backend_for, BackendKind, Firmware, FirmwareEnv, FirmwareFlags};
//! # fn demo(env: FirmwareEnv) -> tpu_firmware::Result<()> {
//! let firmware = Firmware::create(env, backend_for(BackendKind::Janeiro))?;
//! firmware.run("google/edgetpu-janeiro.fw", FirmwareFlags::DEFAULT)?;
//! println!("running {} firmware", firmware.flavor());
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod chip;
pub mod config;
pub mod control;
pub mod error;
pub mod firmware;
pub mod groups;
pub mod shared;
pub mod source;
pub mod usage;

pub use backend::{
    backend_for, AbrolhosBackend, BackendContext, DefaultBackend, FirmwareBackend,
    FirmwareBuffer, FirmwareFlags, FirmwareVersion, JaneiroBackend, IMAGE_CONFIG_OFFSET,
    MOBILE_FW_HEADER_SIZE,
};
pub use chip::{ChipRequest, JaneiroReverseHandler, PerformanceState};
pub use config::{BackendKind, FirmwareConfig};
pub use control::{ChipControl, ChipEvent, FirmwareRegion, SimulatedChip};
pub use error::{FirmwareError, Result};
pub use firmware::{DeviceState, Firmware, FirmwareEnv, FirmwareInfo, FirmwareStatus};
pub use groups::{DeviceGroup, GroupRegistry, GroupStatus};
pub use shared::{SharedFirmware, SharedFirmwareRegistry};
pub use source::{DirectorySource, FirmwareSource, MemorySource};
pub use usage::{UsageComponent, UsageMetric, UsageStats, JANEIRO_TPU_STATES, USAGE_METRIC_SIZE};
