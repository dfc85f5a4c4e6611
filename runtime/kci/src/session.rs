//! KCI session
//!
//! # Purpose
//! The kernel control interface: sequenced commands to the control
//! firmware over mailbox 0 and the matching of its responses back to the
//! threads that sent them.
//!
//! # Flow
//! ```text
//!   send_command ─► lock cmd ─► seq = next ─► arm wait slot ─► push ─► unlock ─► wait slot
//!                                                                                   ▲
//!   IRQ ─► doorbell ─► pop one ─► consume ─► wake ─► schedule ─► drain ─► consume ──┘
//! ```
//!
//! # Integration Points
//! - The session claims mailbox [`KCI_MAILBOX_ID`](tpu_mailbox::KCI_MAILBOX_ID) from the
//!   [`MailboxManager`] and registers its interrupt handler there.
//! - Firmware-initiated requests go to the [`ReverseKci`] channel.
//! - Operation wrappers (`fw_info`, `join_group`, ...) live in
//!   [`crate::commands`].

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use tpu_mailbox::{
    CommandElement, DeferredWork, DeviceMemoryAllocator, KciResponseElement, MailboxChannel,
    MailboxIrq, MailboxManager, QueueMapping, ResponseStatus,
};

use crate::config::KciConfig;
use crate::reverse::{ChipReverseHandler, FirmwareCrashHandler, ReverseKci};
use crate::wait_list::WaitList;
use crate::{KciError, Result, TimeoutPhase};

pub(crate) type KciChannel = MailboxChannel<CommandElement, KciResponseElement>;

struct KciInner {
    manager: Arc<MailboxManager>,
    channel: KciChannel,
    wait_list: WaitList,
    reverse: ReverseKci,
    config: KciConfig,
    timeout: Duration,
    resp_work: OnceLock<DeferredWork>,
    released: AtomicBool,
}

impl KciInner {
    fn handle_response(&self, resp: KciResponseElement) {
        if resp.is_reverse() {
            if let Err(e) = self.reverse.add_response(resp) {
                log::warn!("rkci: dropping request {:#x}: {}", resp.code, e);
            }
        } else {
            self.wait_list.consume(&resp);
        }
    }

    fn handle_irq(&self) {
        self.channel.notify_doorbell();
        if let Some(resp) = self.channel.pop_one_response() {
            self.handle_response(resp);
            self.wait_list.wake_all();
        }
        if let Some(work) = self.resp_work.get() {
            work.schedule();
        }
    }

    fn drain(&self) {
        let responses = self.channel.drain_responses();
        if responses.is_empty() {
            return;
        }
        for resp in responses {
            self.handle_response(resp);
        }
        self.wait_list.wake_all();
    }

    fn teardown(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(work) = self.resp_work.get() {
            work.cancel_sync();
        }
        self.reverse.cancel();
        self.channel.release();

        let leaked = self.wait_list.pending();
        if leaked > 0 {
            log::warn!("kci: released with {leaked} commands still waiting");
            self.wait_list.cancel_all();
        }
        if let Err(e) = self.manager.remove(self.channel.id()) {
            log::warn!("kci: failed to give back mailbox: {e}");
        }
    }
}

impl Drop for KciInner {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Interrupt entry registered with the mailbox manager
struct KciIrq(Weak<KciInner>);

impl MailboxIrq for KciIrq {
    fn handle_irq(&self) {
        if let Some(inner) = self.0.upgrade() {
            inner.handle_irq();
        }
    }
}

/// A KCI session
///
/// Cheap to clone; clones share the session. The session stays alive until
/// [`Kci::release`] or until the last clone is dropped.
#[derive(Clone)]
pub struct Kci {
    inner: Arc<KciInner>,
}

impl Kci {
    /// Claim the KCI mailbox, allocate its queues and enable it
    ///
    /// # Arguments
    /// * `manager` - owner of the mailbox slots and the interrupt
    /// * `allocator` - source of device-visible memory for the queues
    /// * `config` - queue sizes and wait windows
    ///
    /// # Errors
    /// - `InvalidConfig` if `config` does not validate
    /// - `Mailbox(MailboxInUse)` if a session already exists
    /// - `OutOfMemory` if a queue cannot be allocated; nothing stays
    ///   allocated or claimed in that case
    pub fn init(
        manager: Arc<MailboxManager>,
        allocator: Arc<dyn DeviceMemoryAllocator>,
        config: KciConfig,
    ) -> Result<Self> {
        config.validate()?;
        let reverse = ReverseKci::new(config.reverse_ring_size)?;
        let id = manager.claim_kci()?;

        let channel = match KciChannel::allocate(
            id,
            Arc::clone(manager.registers()),
            allocator,
            config.queue_size,
        ) {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(remove_err) = manager.remove(id) {
                    log::warn!("kci: failed to give back mailbox: {remove_err}");
                }
                return Err(e.into());
            }
        };

        let inner = Arc::new(KciInner {
            manager: Arc::clone(&manager),
            channel,
            wait_list: WaitList::new(config.max_pending()),
            reverse,
            timeout: config.timeout(),
            config,
            resp_work: OnceLock::new(),
            released: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&inner);
        let work = DeferredWork::spawn("kci-resp", move || {
            if let Some(inner) = weak.upgrade() {
                inner.drain();
            }
        })?;
        if inner.resp_work.set(work).is_err() {
            log::error!("kci: response worker started twice");
        }

        manager.set_handler(id, Arc::new(KciIrq(Arc::downgrade(&inner))))?;
        inner.channel.init_doorbells();
        inner.channel.enable();
        log::debug!("kci: enabled on mailbox {id}, timeout {:?}", inner.timeout);
        Ok(Self { inner })
    }

    /// Reprogram the queue CSRs after the device lost them
    ///
    /// Reuses the queue memory from [`Kci::init`]; indices restart at zero.
    pub fn reinit(&self) -> Result<()> {
        self.check_alive()?;
        let channel = &self.inner.channel;
        channel.program_queues(self.inner.config.queue_size)?;
        channel.init_doorbells();
        channel.enable();
        Ok(())
    }

    /// Empty both queues and re-enable the mailbox
    ///
    /// Used while the control core is held in reset; anything the firmware
    /// had not consumed is lost.
    pub fn reset(&self) -> Result<()> {
        self.check_alive()?;
        self.inner.channel.reset();
        self.inner.channel.enable();
        Ok(())
    }

    fn check_alive(&self) -> Result<()> {
        if self.inner.released.load(Ordering::Acquire) {
            return Err(KciError::NoDevice);
        }
        Ok(())
    }

    /// Send `cmd` and wait for its response
    ///
    /// The sequence number of `cmd` is assigned here. The returned response
    /// carries the firmware's error code; [`Kci::send_cmd`] turns that
    /// into a `Result` too.
    ///
    /// # Errors
    /// - `Timeout { phase: Enqueue }` if the queue stayed full, or if
    ///   `max_pending` commands were waiting the whole time
    /// - `Timeout { phase: Response }` if no response came in time; the
    ///   device may still execute the command
    /// - `NoResponse` if the device answered a later command instead
    /// - `Cancelled` if the session was torn down while waiting
    pub fn send_command(&self, mut cmd: CommandElement) -> Result<KciResponseElement> {
        self.check_alive()?;
        let inner = &self.inner;
        let slot = inner.wait_list.reserve(inner.timeout)?;

        let seq = {
            let mut queue = inner.channel.lock_commands();
            if let Err(e) = queue.wait_for_space(inner.timeout) {
                inner.wait_list.release(slot);
                return Err(e.into());
            }
            cmd.seq = queue.next_seq();
            inner.wait_list.arm(slot, cmd.seq);
            if let Err(e) = queue.push(&cmd) {
                inner.wait_list.release(slot);
                log::error!("kci: failed to push command {}: {}", cmd.code, e);
                return Err(e.into());
            }
            cmd.seq
        };

        let Some(resp) = inner.wait_list.wait(slot, inner.timeout) else {
            log::warn!("kci: command {} seq {} timed out", cmd.code, seq);
            return Err(KciError::Timeout {
                phase: TimeoutPhase::Response,
                waited_ms: inner.timeout.as_millis() as u64,
            });
        };
        match resp.status() {
            ResponseStatus::Ok => Ok(resp),
            ResponseStatus::Cancelled => Err(KciError::Cancelled { seq }),
            _ => Err(KciError::NoResponse { seq }),
        }
    }

    /// Push `cmd` without waiting for a response
    ///
    /// Returns the sequence number it was sent under. A response the
    /// firmware sends anyway finds no waiter and is dropped.
    pub fn post_command(&self, mut cmd: CommandElement) -> Result<u64> {
        self.check_alive()?;
        let mut queue = self.inner.channel.lock_commands();
        queue.wait_for_space(self.inner.timeout)?;
        cmd.seq = queue.next_seq();
        Ok(queue.push(&cmd)?)
    }

    /// Interrupt handler body, for platforms that bypass the manager
    pub fn handle_irq(&self) {
        self.inner.handle_irq();
    }

    /// Route one response to its waiter or to the reverse channel
    pub fn consume_response(&self, resp: KciResponseElement) {
        self.inner.handle_response(resp);
        self.inner.wait_list.wake_all();
    }

    /// Drain the response queue on the calling thread
    pub fn consume_responses(&self) {
        self.inner.drain();
    }

    /// Fail every waiting command with `Cancelled`
    ///
    /// Returns how many were waiting.
    pub fn cancel_all_pending(&self) -> usize {
        let cancelled = self.inner.wait_list.cancel_all();
        if cancelled > 0 {
            log::warn!("kci: cancelled {cancelled} pending commands");
        }
        cancelled
    }

    /// Stop the workers, free the queues and give the mailbox back
    ///
    /// Commands still waiting complete with `Cancelled`. Later calls fail
    /// with `NoDevice`.
    pub fn release(&self) {
        self.inner.teardown();
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Where both queues live
    pub fn mappings(&self) -> [QueueMapping; 2] {
        self.inner.channel.mappings()
    }

    /// Next sequence number to be assigned
    pub fn sequence(&self) -> u64 {
        self.inner.channel.sequence()
    }

    /// Commands waiting for a response
    pub fn pending(&self) -> usize {
        self.inner.wait_list.pending()
    }

    pub fn mailbox_id(&self) -> u32 {
        self.inner.channel.id()
    }

    pub fn config(&self) -> &KciConfig {
        &self.inner.config
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    pub fn reverse(&self) -> &ReverseKci {
        &self.inner.reverse
    }

    pub fn set_chip_handler(&self, handler: Arc<dyn ChipReverseHandler>) {
        self.inner.reverse.set_chip_handler(handler);
    }

    pub fn set_crash_handler(&self, handler: Arc<dyn FirmwareCrashHandler>) {
        self.inner.reverse.set_crash_handler(handler);
    }

    pub(crate) fn allocator(&self) -> &Arc<dyn DeviceMemoryAllocator> {
        self.inner.channel.allocator()
    }
}

impl core::fmt::Debug for Kci {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Kci")
            .field("mailbox", &self.inner.channel.id())
            .field("sequence", &self.sequence())
            .field("pending", &self.pending())
            .field("released", &self.is_released())
            .finish()
    }
}

static_assertions::assert_impl_all!(Kci: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use tpu_mailbox::{
        MailboxError, MailboxManagerDesc, MailboxReg, RegisterBlock, KCI_MAILBOX_ID,
    };
    use tpu_mock::{MockAllocator, MockRegisters};

    use crate::config::TimeoutProfile;

    fn setup() -> (Arc<MockRegisters>, Arc<MailboxManager>, Arc<MockAllocator>) {
        let regs = Arc::new(MockRegisters::new(8));
        let manager = Arc::new(
            MailboxManager::new(regs.clone(), MailboxManagerDesc::JANEIRO).unwrap(),
        );
        (regs, manager, Arc::new(MockAllocator::new()))
    }

    fn config() -> KciConfig {
        KciConfig {
            queue_size: 4,
            ..KciConfig::for_profile(TimeoutProfile::Test)
        }
    }

    #[test]
    fn test_init_programs_and_enables() {
        let (regs, manager, mem) = setup();
        let kci = Kci::init(manager.clone(), mem.clone(), config()).unwrap();

        assert_eq!(kci.mailbox_id(), KCI_MAILBOX_ID);
        assert!(manager.is_claimed(KCI_MAILBOX_ID));
        assert_eq!(regs.read(0, MailboxReg::ContextEnable), 1);
        assert_eq!(regs.read(0, MailboxReg::CmdQueueSize), 4);
        assert_eq!(mem.live_count(), 2);
        assert!(matches!(
            Kci::init(manager, mem, config()),
            Err(KciError::Mailbox(MailboxError::MailboxInUse { id: 0 }))
        ));
    }

    #[test]
    fn test_release_frees_everything() {
        let (regs, manager, mem) = setup();
        let kci = Kci::init(manager.clone(), mem.clone(), config()).unwrap();
        kci.release();

        assert_eq!(mem.live_count(), 0);
        assert!(!manager.is_claimed(KCI_MAILBOX_ID));
        assert_eq!(regs.read(0, MailboxReg::ContextEnable), 0);
        assert!(matches!(
            kci.send_command(CommandElement::default()),
            Err(KciError::NoDevice)
        ));
    }

    #[test]
    fn test_drop_releases() {
        let (_regs, manager, mem) = setup();
        drop(Kci::init(manager.clone(), mem.clone(), config()).unwrap());
        assert_eq!(mem.live_count(), 0);
        assert!(!manager.is_claimed(KCI_MAILBOX_ID));
    }

    #[test]
    fn test_post_command_assigns_sequence() {
        let (regs, manager, mem) = setup();
        let kci = Kci::init(manager, mem, config()).unwrap();
        assert_eq!(kci.post_command(CommandElement::default()).unwrap(), 0);
        assert_eq!(kci.post_command(CommandElement::default()).unwrap(), 1);
        assert_eq!(kci.sequence(), 2);
        assert_eq!(regs.read(0, MailboxReg::CmdTail), 2);
        assert_eq!(kci.pending(), 0);
    }

    #[test]
    fn test_response_timeout_without_device() {
        let (_regs, manager, mem) = setup();
        let kci = Kci::init(manager, mem, config()).unwrap();
        let err = kci.send_command(CommandElement::default()).unwrap_err();
        assert!(matches!(
            err,
            KciError::Timeout {
                phase: TimeoutPhase::Response,
                waited_ms: 200
            }
        ));
        assert_eq!(kci.pending(), 0);
    }

    #[test]
    fn test_enqueue_timeout_when_queue_full() {
        let (_regs, manager, mem) = setup();
        let kci = Kci::init(manager, mem, config()).unwrap();
        for _ in 0..4 {
            kci.post_command(CommandElement::default()).unwrap();
        }
        assert!(matches!(
            kci.send_command(CommandElement::default()),
            Err(KciError::Timeout {
                phase: TimeoutPhase::Enqueue,
                ..
            })
        ));
        assert_eq!(kci.pending(), 0);
        assert_eq!(kci.sequence(), 4);
    }
}
