//! Edge TPU Kernel Control Interface
//!
//! The host side of the KCI protocol: commands to the control firmware on
//! mailbox 0, each answered by a response with the same sequence number,
//! plus requests the firmware initiates itself (reverse KCI).
//!
//! # Architecture
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │  Kci (session)          commands: fw_info, ...   │
//! │    ├─ WaitList          sequence-ordered waiters │
//! │    ├─ ReverseKci        ring + worker + handlers │
//! │    └─ MailboxChannel    (tpu-mailbox)            │
//! └──────────────────────────────────────────────────┘
//!              │ claims mailbox 0, registers IRQ
//!              ▼
//!        MailboxManager
//! ```
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use tpu_kci::{Kci, KciConfig};
//! # fn demo(
//! #     manager: Arc<tpu_mailbox::MailboxManager>,
//! #     allocator: Arc<dyn tpu_mailbox::DeviceMemoryAllocator>,
//! # ) -> tpu_kci::Result<()> {
//! let kci = Kci::init(manager, allocator, KciConfig::default())?;
//! let (flavor, info) = kci.fw_info()?;
//! println!("firmware {flavor:?} built at {}", info.build_time);
//! kci.release();
//! # Ok(())
//! # }
//! ```

pub mod activation;
pub mod commands;
pub mod config;
pub mod error;
pub mod reverse;
pub mod session;
pub mod wait_list;

pub use activation::Handshake;
pub use commands::{FirmwareFlavor, FwInfo, KciCode, UsageReport};
pub use config::{KciConfig, TimeoutProfile};
pub use error::{KciError, KciErrorCode, Result, TimeoutPhase};
pub use reverse::{
    route, ChipReverseHandler, CrashType, FirmwareCrashHandler, ReverseKci, ReverseRing,
    ReverseRoute, CHIP_REVERSE_CODE_MAX, RKCI_FIRMWARE_CRASH,
};
pub use session::Kci;
pub use wait_list::WaitList;
