//! Mailbox Manager
//!
//! Owns the table of mailboxes a device provides and routes the shared
//! mailbox interrupt to whichever mailbox rang its response doorbell.
//!
//! Index [`KCI_MAILBOX_ID`] is reserved for the kernel control interface.
//! VII (per-client) mailboxes come from a contiguous range right after it.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::csr::{MailboxReg, RegisterBlock};
use crate::{MailboxError, Result};

/// Mailbox index of the kernel control interface
pub const KCI_MAILBOX_ID: u32 = 0;

/// Receiver of a mailbox's response-doorbell interrupt
///
/// Runs in interrupt context: must not block.
pub trait MailboxIrq: Send + Sync {
    fn handle_irq(&self);
}

/// Mailbox layout of a chip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxManagerDesc {
    pub num_mailbox: u32,
    pub num_vii_mailbox: u32,
}

impl MailboxManagerDesc {
    /// Eight mailboxes, all but the KCI one usable as VII
    pub const JANEIRO: Self = Self {
        num_mailbox: 8,
        num_vii_mailbox: 7,
    };
}

#[derive(Default)]
struct Slot {
    handler: Option<Arc<dyn MailboxIrq>>,
}

pub struct MailboxManager {
    regs: Arc<dyn RegisterBlock>,
    vii_from: u32,
    vii_to: u32,
    slots: RwLock<Vec<Option<Slot>>>,
}

impl MailboxManager {
    pub fn new(regs: Arc<dyn RegisterBlock>, desc: MailboxManagerDesc) -> Result<Self> {
        if desc.num_mailbox == 0 {
            return Err(MailboxError::InvalidLayout("no mailboxes"));
        }
        if desc.num_vii_mailbox >= desc.num_mailbox {
            return Err(MailboxError::InvalidLayout(
                "VII mailboxes overlap the KCI mailbox",
            ));
        }
        let vii_from = KCI_MAILBOX_ID + 1;
        Ok(Self {
            regs,
            vii_from,
            vii_to: vii_from + desc.num_vii_mailbox,
            slots: RwLock::new((0..desc.num_mailbox).map(|_| None).collect()),
        })
    }

    pub fn registers(&self) -> &Arc<dyn RegisterBlock> {
        &self.regs
    }

    pub fn num_mailbox(&self) -> u32 {
        self.read_slots().len() as u32
    }

    /// VII index range, `[from, to)`
    pub fn vii_range(&self) -> core::ops::Range<u32> {
        self.vii_from..self.vii_to
    }

    /// Claim the KCI mailbox
    pub fn claim_kci(&self) -> Result<u32> {
        self.claim(KCI_MAILBOX_ID)
    }

    /// Claim a VII mailbox
    ///
    /// `id == 0` takes the first free VII mailbox, any other value that
    /// specific one.
    pub fn claim_vii(&self, id: u32) -> Result<u32> {
        if id != 0 {
            if !self.vii_range().contains(&id) {
                return Err(MailboxError::InvalidMailbox { id });
            }
            return self.claim(id);
        }
        let mut slots = self.write_slots();
        let free = self
            .vii_range()
            .find(|&i| slots[i as usize].is_none())
            .ok_or(MailboxError::NoMailbox)?;
        slots[free as usize] = Some(Slot::default());
        Ok(free)
    }

    fn claim(&self, id: u32) -> Result<u32> {
        let mut slots = self.write_slots();
        let slot = slots
            .get_mut(id as usize)
            .ok_or(MailboxError::InvalidMailbox { id })?;
        if slot.is_some() {
            return Err(MailboxError::MailboxInUse { id });
        }
        *slot = Some(Slot::default());
        Ok(id)
    }

    /// Route interrupts of claimed mailbox `id` to `handler`
    pub fn set_handler(&self, id: u32, handler: Arc<dyn MailboxIrq>) -> Result<()> {
        let mut slots = self.write_slots();
        match slots.get_mut(id as usize) {
            Some(Some(slot)) => {
                slot.handler = Some(handler);
                Ok(())
            }
            _ => Err(MailboxError::InvalidMailbox { id }),
        }
    }

    /// Give mailbox `id` back, disabling its context
    pub fn remove(&self, id: u32) -> Result<()> {
        let mut slots = self.write_slots();
        slots
            .get_mut(id as usize)
            .and_then(Option::take)
            .ok_or(MailboxError::InvalidMailbox { id })?;
        self.regs.write(id, MailboxReg::ContextEnable, 0);
        Ok(())
    }

    pub fn remove_all(&self) {
        let mut slots = self.write_slots();
        for (id, slot) in slots.iter_mut().enumerate() {
            if slot.take().is_some() {
                self.regs.write(id as u32, MailboxReg::ContextEnable, 0);
            }
        }
    }

    pub fn is_claimed(&self, id: u32) -> bool {
        matches!(self.read_slots().get(id as usize), Some(Some(_)))
    }

    /// Service the mailbox interrupt
    ///
    /// Every claimed mailbox whose response doorbell is up has it cleared
    /// and its handler run. Returns whether any mailbox was serviced.
    pub fn handle_irq(&self) -> bool {
        let pending: Vec<(u32, Arc<dyn MailboxIrq>)> = {
            let slots = self.read_slots();
            slots
                .iter()
                .enumerate()
                .filter_map(|(id, slot)| {
                    let handler = slot.as_ref()?.handler.as_ref()?;
                    Some((id as u32, Arc::clone(handler)))
                })
                .filter(|(id, _)| self.regs.read(*id, MailboxReg::RespDoorbellStatus) != 0)
                .collect()
        };

        for (id, handler) in &pending {
            self.regs.write(*id, MailboxReg::RespDoorbellClear, 1);
            handler.handle_irq();
        }
        !pending.is_empty()
    }

    fn read_slots(&self) -> RwLockReadGuard<'_, Vec<Option<Slot>>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_slots(&self) -> RwLockWriteGuard<'_, Vec<Option<Slot>>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl core::fmt::Debug for MailboxManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MailboxManager")
            .field("num_mailbox", &self.num_mailbox())
            .field("vii", &self.vii_range())
            .finish()
    }
}
