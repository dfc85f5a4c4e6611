//! TPU Mailbox - command/response queues shared with the accelerator
//!
//! # Purpose
//! A mailbox is one command queue and one response queue in device-visible
//! memory, plus the doorbell and interrupt wiring that tells each side the
//! other has made progress. This crate owns everything below the protocol:
//! queue arithmetic, element layouts, queue memory, register access, the
//! per-mailbox channel and the manager that dispatches interrupts.
//!
//! # Integration Points
//! - Depends on: a [`RegisterBlock`] for CSR access and a
//!   [`DeviceMemoryAllocator`] for queue memory (hardware or `tpu-mock`)
//! - Provides to: `tpu-kci` (control mailbox), VII users (per-client mailboxes)
//!
//! # Architecture
//! ```text
//!  callers ──► MailboxChannel::lock_commands ──► cmd queue ──► device
//!                                                                │
//!  MailboxManager::handle_irq ◄── resp doorbell ◄── resp queue ◄─┘
//!        │
//!        └─► MailboxIrq::handle_irq ──► pop_one_response / DeferredWork
//! ```
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tpu_mailbox::{
//!     CommandElement, DeviceMemoryAllocator, KciResponseElement, MailboxChannel, RegisterBlock,
//! };
//!
//! # fn demo(regs: Arc<dyn RegisterBlock>, alloc: Arc<dyn DeviceMemoryAllocator>) -> tpu_mailbox::Result<()> {
//! let channel: MailboxChannel<CommandElement, KciResponseElement> =
//!     MailboxChannel::allocate(0, regs, alloc, 64)?;
//! channel.enable();
//! channel.push_command(&CommandElement::default(), Duration::from_millis(100))?;
//! let responses = channel.drain_responses();
//! # let _ = responses;
//! # Ok(())
//! # }
//! ```

use thiserror::Error;

pub mod channel;
pub mod circ;
pub mod csr;
pub mod dma;
pub mod element;
pub mod manager;
pub mod sync;
pub mod work;

pub use channel::{CommandQueueGuard, MailboxChannel, QueueMapping};
pub use circ::{CircularQueue, MAX_QUEUE_SIZE};
pub use csr::{MailboxReg, QueueKind, RegisterBlock};
pub use dma::{CoherentMem, DeviceBuffer, DeviceMemoryAllocator};
pub use element::{
    CommandElement, DmaDescriptor, DmaDirection, KciResponseElement, QueueElement,
    ResponseStatus, KCI_REVERSE_FLAG,
};
pub use manager::{MailboxIrq, MailboxManager, MailboxManagerDesc, KCI_MAILBOX_ID};
pub use work::DeferredWork;

/// Mailbox error types
#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("device memory allocation of {requested} bytes failed")]
    OutOfMemory { requested: usize },

    #[error("command queue is full")]
    QueueFull,

    #[error("command queue still full after {waited_ms} ms")]
    Timeout { waited_ms: u64 },

    #[error("invalid queue size {size}")]
    InvalidQueueSize { size: u32 },

    #[error("no free mailbox")]
    NoMailbox,

    #[error("mailbox {id} is already in use")]
    MailboxInUse { id: u32 },

    #[error("mailbox {id} does not exist")]
    InvalidMailbox { id: u32 },

    #[error("invalid mailbox layout: {0}")]
    InvalidLayout(&'static str),

    #[error("mailbox queues have been released")]
    Released,

    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(#[source] std::io::Error),
}

pub type Result<T> = core::result::Result<T, MailboxError>;
