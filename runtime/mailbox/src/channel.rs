//! Mailbox Channel
//!
//! # Purpose
//! One mailbox: a command queue the host produces into and a response
//! queue the host consumes from, both in device-visible memory, plus the
//! CSRs that publish indices and ring doorbells.
//!
//! # Locking
//! - The command lock covers the host tail and the sequence counter. It is
//!   held across "assign sequence, wait for space, write, ring" so that
//!   assignment order equals queue order. See [`CommandQueueGuard`].
//! - The response lock covers the host head. It is only ever *tried*:
//!   whichever context gets it does the fetching, the others leave.
//! - Queue space is re-checked every time the device rings the response
//!   doorbell, since that is the only signal that the device advanced the
//!   command-queue head.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::circ::CircularQueue;
use crate::csr::{MailboxReg, QueueKind, RegisterBlock};
use crate::dma::{CoherentMem, DeviceMemoryAllocator};
use crate::element::QueueElement;
use crate::sync::{lock, try_lock, Doorbell};
use crate::{MailboxError, Result};

#[derive(Debug)]
struct CommandState {
    queue: CircularQueue,
    tail: u32,
    seq: u64,
}

#[derive(Debug)]
struct ResponseState {
    queue: CircularQueue,
    head: u32,
}

/// Where a queue lives, for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueMapping {
    pub kind: QueueKind,
    pub device_addr: u64,
    /// Capacity in elements
    pub size: u32,
    /// Bytes per element
    pub element_size: usize,
}

/// A mailbox with command elements `C` and response elements `R`
pub struct MailboxChannel<C, R> {
    id: u32,
    regs: Arc<dyn RegisterBlock>,
    allocator: Arc<dyn DeviceMemoryAllocator>,
    cmd_mem: CoherentMem,
    resp_mem: CoherentMem,
    cmd: Mutex<CommandState>,
    resp: Mutex<ResponseState>,
    doorbell: Doorbell,
    released: AtomicBool,
    _elements: PhantomData<fn(C) -> R>,
}

impl<C: QueueElement, R: QueueElement> MailboxChannel<C, R> {
    /// Allocate both queues of mailbox `id` and program their CSRs
    ///
    /// # Arguments
    /// * `id` - mailbox index, selects the CSR window
    /// * `regs` - register access for the device
    /// * `allocator` - source of device-visible memory
    /// * `size` - capacity of each queue in elements (power of two)
    ///
    /// # Errors
    /// - `InvalidQueueSize` if `size` is not a legal queue size
    /// - `OutOfMemory` if either queue cannot be allocated; nothing is
    ///   left allocated in that case
    pub fn allocate(
        id: u32,
        regs: Arc<dyn RegisterBlock>,
        allocator: Arc<dyn DeviceMemoryAllocator>,
        size: u32,
    ) -> Result<Self> {
        let queue = CircularQueue::new(size).ok_or(MailboxError::InvalidQueueSize { size })?;

        let cmd_mem = allocator.alloc(size as usize * C::byte_size())?;
        let resp_mem = match allocator.alloc(size as usize * R::byte_size()) {
            Ok(mem) => mem,
            Err(e) => {
                allocator.free(cmd_mem);
                return Err(e);
            }
        };
        log::debug!(
            "mailbox {}: cmdq iova={:#x} rspq iova={:#x} size={}",
            id,
            cmd_mem.device_addr(),
            resp_mem.device_addr(),
            size
        );

        let channel = Self {
            id,
            regs,
            allocator,
            cmd_mem,
            resp_mem,
            cmd: Mutex::new(CommandState {
                queue,
                tail: 0,
                seq: 0,
            }),
            resp: Mutex::new(ResponseState { queue, head: 0 }),
            doorbell: Doorbell::new(),
            released: AtomicBool::new(false),
            _elements: PhantomData,
        };
        channel.program_queues(size)?;
        Ok(channel)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn registers(&self) -> &Arc<dyn RegisterBlock> {
        &self.regs
    }

    pub fn allocator(&self) -> &Arc<dyn DeviceMemoryAllocator> {
        &self.allocator
    }

    /// Program both queues at their existing addresses with `size` elements
    pub fn program_queues(&self, size: u32) -> Result<()> {
        self.set_queue(QueueKind::Command, self.cmd_mem.device_addr(), size)?;
        self.set_queue(QueueKind::Response, self.resp_mem.device_addr(), size)
    }

    /// Program the address and size CSRs of one queue and reset its indices
    ///
    /// # Errors
    /// Returns `InvalidQueueSize` if `size` is not a power of two within
    /// the CSR limit, or does not fit the memory behind the queue.
    pub fn set_queue(&self, kind: QueueKind, device_addr: u64, size: u32) -> Result<()> {
        let queue = CircularQueue::new(size).ok_or(MailboxError::InvalidQueueSize { size })?;
        let (mem, elem_bytes) = match kind {
            QueueKind::Command => (&self.cmd_mem, C::byte_size()),
            QueueKind::Response => (&self.resp_mem, R::byte_size()),
        };
        if size as usize * elem_bytes > mem.size() {
            return Err(MailboxError::InvalidQueueSize { size });
        }

        let (low, high, size_reg) = MailboxReg::queue_config(kind);
        self.regs.write(self.id, low, device_addr as u32);
        self.regs.write(self.id, high, (device_addr >> 32) as u32);
        self.regs.write(self.id, size_reg, size);

        match kind {
            QueueKind::Command => {
                let mut cmd = lock(&self.cmd);
                cmd.queue = queue;
                cmd.tail = 0;
                self.regs.write(self.id, MailboxReg::CmdTail, 0);
            }
            QueueKind::Response => {
                let mut resp = lock(&self.resp);
                resp.queue = queue;
                resp.head = 0;
                self.regs.write(self.id, MailboxReg::RespHead, 0);
            }
        }
        Ok(())
    }

    /// Drop anything left in either queue
    pub fn reset(&self) {
        let mut cmd = lock(&self.cmd);
        let mut resp = lock(&self.resp);
        self.regs.write(self.id, MailboxReg::ContextEnable, 0);
        self.regs.write(self.id, MailboxReg::CmdHead, 0);
        self.regs.write(self.id, MailboxReg::CmdTail, 0);
        self.regs.write(self.id, MailboxReg::RespHead, 0);
        self.regs.write(self.id, MailboxReg::RespTail, 0);
        cmd.tail = 0;
        resp.head = 0;
    }

    /// Clear stale doorbells and enable both doorbell interrupts
    pub fn init_doorbells(&self) {
        self.regs.write(self.id, MailboxReg::RespDoorbellClear, 1);
        self.regs.write(self.id, MailboxReg::CmdQueueDoorbellClear, 1);
        self.regs.write(self.id, MailboxReg::CmdQueueDoorbellEnable, 1);
        self.regs.write(self.id, MailboxReg::RespQueueDoorbellEnable, 1);
    }

    pub fn enable(&self) {
        self.regs.write(self.id, MailboxReg::ContextEnable, 1);
    }

    pub fn disable(&self) {
        self.regs.write(self.id, MailboxReg::ContextEnable, 0);
    }

    pub fn set_priority(&self, priority: u32) {
        self.regs.write(self.id, MailboxReg::Priority, priority);
    }

    /// Take the command lock
    ///
    /// Everything that must be atomic with respect to other producers
    /// (sequence assignment, bookkeeping keyed by it, the push itself)
    /// happens through the returned guard.
    pub fn lock_commands(&self) -> CommandQueueGuard<'_, C, R> {
        CommandQueueGuard {
            channel: self,
            state: lock(&self.cmd),
        }
    }

    /// Push one command, waiting up to `timeout` for queue space
    ///
    /// Returns the sequence number the command was pushed under.
    pub fn push_command(&self, elem: &C, timeout: Duration) -> Result<u64> {
        let mut guard = self.lock_commands();
        guard.wait_for_space(timeout)?;
        guard.push(elem)
    }

    /// Next sequence number to be assigned
    pub fn sequence(&self) -> u64 {
        lock(&self.cmd).seq
    }

    /// Fetch every response up to the device tail
    ///
    /// Returns an empty vector if another context is already fetching.
    /// Rings the command doorbell after a large batch, as the device may be
    /// stalled waiting for response-queue room.
    pub fn drain_responses(&self) -> Vec<R> {
        let Some(mut state) = try_lock(&self.resp) else {
            return Vec::new();
        };
        if self.released.load(Ordering::Acquire) {
            return Vec::new();
        }

        let queue = state.queue;
        let buffer = self.resp_mem.buffer();
        let mut head = state.head;
        let mut fetched = Vec::new();
        loop {
            let tail = self.regs.read_sync(self.id, MailboxReg::RespTail);
            let count = queue.count(head, tail);
            if count == 0 {
                break;
            }
            fetched.reserve(count as usize);
            for i in 0..count {
                let mut elem: R = buffer.read_element(queue.real_index(queue.inc(head, i)));
                elem.mark_fetched();
                fetched.push(elem);
            }
            head = queue.inc(head, count);
        }

        if fetched.is_empty() {
            return fetched;
        }
        state.head = head;
        self.regs.write(self.id, MailboxReg::RespHead, head);
        drop(state);

        if fetched.len() as u32 >= queue.size() / 2 {
            self.regs.write(self.id, MailboxReg::CmdDoorbellSet, 1);
        }
        fetched
    }

    /// Fetch at most one response without blocking
    ///
    /// Safe to call from interrupt context: returns `None` if the queue is
    /// empty or another context holds the response lock.
    pub fn pop_one_response(&self) -> Option<R> {
        let mut state = try_lock(&self.resp)?;
        if self.released.load(Ordering::Acquire) {
            return None;
        }

        let tail = self.regs.read_sync(self.id, MailboxReg::RespTail);
        if state.queue.is_empty(state.head, tail) {
            return None;
        }
        let mut elem: R = self
            .resp_mem
            .buffer()
            .read_element(state.queue.real_index(state.head));
        elem.mark_fetched();
        state.head = state.queue.inc(state.head, 1);
        self.regs.write(self.id, MailboxReg::RespHead, state.head);
        Some(elem)
    }

    /// Record a response doorbell and wake threads waiting for queue space
    pub fn notify_doorbell(&self) {
        self.doorbell.ring();
    }

    pub fn doorbell(&self) -> &Doorbell {
        &self.doorbell
    }

    /// Device addresses and sizes of both queues
    pub fn mappings(&self) -> [QueueMapping; 2] {
        let cmd_size = lock(&self.cmd).queue.size();
        let resp_size = lock(&self.resp).queue.size();
        [
            QueueMapping {
                kind: QueueKind::Command,
                device_addr: self.cmd_mem.device_addr(),
                size: cmd_size,
                element_size: C::byte_size(),
            },
            QueueMapping {
                kind: QueueKind::Response,
                device_addr: self.resp_mem.device_addr(),
                size: resp_size,
                element_size: R::byte_size(),
            },
        ]
    }

    /// Free both queue buffers
    ///
    /// Later pushes fail with `Released`, later fetches return nothing.
    pub fn release(&self) {
        let _cmd = lock(&self.cmd);
        let _resp = lock(&self.resp);
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.allocator.free(self.cmd_mem.clone());
        self.allocator.free(self.resp_mem.clone());
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl<C, R> core::fmt::Debug for MailboxChannel<C, R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MailboxChannel")
            .field("id", &self.id)
            .field("cmd_iova", &self.cmd_mem.device_addr())
            .field("resp_iova", &self.resp_mem.device_addr())
            .finish()
    }
}

/// Exclusive producer access to a command queue
pub struct CommandQueueGuard<'a, C, R> {
    channel: &'a MailboxChannel<C, R>,
    state: MutexGuard<'a, CommandState>,
}

impl<C: QueueElement, R: QueueElement> CommandQueueGuard<'_, C, R> {
    /// Sequence number the next pushed command gets
    pub fn next_seq(&self) -> u64 {
        self.state.seq
    }

    /// Block until the device leaves room for one command
    ///
    /// The tail cannot move while the guard is held, so only the device
    /// head needs re-reading. It is re-read each time the response doorbell
    /// rings.
    ///
    /// # Errors
    /// - `QueueFull` if the queue is full and `timeout` is zero
    /// - `Timeout` if the queue stayed full for `timeout`
    /// - `Released` if the queues have been freed
    pub fn wait_for_space(&self, timeout: Duration) -> Result<()> {
        let channel = self.channel;
        if channel.is_released() {
            return Err(MailboxError::Released);
        }
        let deadline = Instant::now() + timeout;
        let full_bits = self.state.tail ^ self.state.queue.wrap_bit();
        loop {
            let seen = channel.doorbell.generation();
            let head = channel.regs.read(channel.id, MailboxReg::CmdHead);
            if head != full_bits {
                return Ok(());
            }
            if timeout.is_zero() {
                return Err(MailboxError::QueueFull);
            }
            if !channel.doorbell.wait_past(seen, deadline) {
                let head = channel.regs.read(channel.id, MailboxReg::CmdHead);
                if head != full_bits {
                    return Ok(());
                }
                return Err(MailboxError::Timeout {
                    waited_ms: timeout.as_millis() as u64,
                });
            }
        }
    }

    /// Write `elem` at the tail, publish the tail and ring the doorbell
    ///
    /// The caller stamps `elem` with [`Self::next_seq`]. The counter is
    /// bumped only once the command is in the queue. Returns the sequence
    /// number the command was pushed under.
    ///
    /// # Errors
    /// Returns `QueueFull` if there is no room; call
    /// [`Self::wait_for_space`] first to block instead.
    pub fn push(&mut self, elem: &C) -> Result<u64> {
        let channel = self.channel;
        if channel.is_released() {
            return Err(MailboxError::Released);
        }
        let queue = self.state.queue;
        let head = channel.regs.read(channel.id, MailboxReg::CmdHead);
        if queue.is_full(head, self.state.tail) {
            return Err(MailboxError::QueueFull);
        }

        channel
            .cmd_mem
            .buffer()
            .write_element(queue.real_index(self.state.tail), elem);
        self.state.tail = queue.inc(self.state.tail, 1);
        channel
            .regs
            .write(channel.id, MailboxReg::CmdTail, self.state.tail);
        channel
            .regs
            .write_sync(channel.id, MailboxReg::CmdDoorbellSet, 1);

        let seq = self.state.seq;
        self.state.seq = seq.wrapping_add(1);
        Ok(seq)
    }
}

static_assertions::assert_impl_all!(
    MailboxChannel<crate::element::CommandElement, crate::element::KciResponseElement>: Send,
    Sync
);
