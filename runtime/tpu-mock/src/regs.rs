//! Mock mailbox CSRs
//!
//! Plain storage plus the side effects of the write-to-act registers:
//! clearing a doorbell drops its status bit and setting the command
//! doorbell wakes the device thread. The device side updates its own
//! registers through [`MockRegisters::device_write`], which has no side
//! effects.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use tpu_mailbox::sync::Doorbell;
use tpu_mailbox::{MailboxReg, RegisterBlock};

pub struct MockRegisters {
    num_mailbox: u32,
    regs: Box<[AtomicU32]>,
    cmd_doorbells: Box<[AtomicU64]>,
    device_bell: Doorbell,
}

impl MockRegisters {
    pub fn new(num_mailbox: u32) -> Self {
        let words = num_mailbox as usize * MailboxReg::COUNT;
        Self {
            num_mailbox,
            regs: (0..words).map(|_| AtomicU32::new(0)).collect(),
            cmd_doorbells: (0..num_mailbox).map(|_| AtomicU64::new(0)).collect(),
            device_bell: Doorbell::new(),
        }
    }

    pub fn num_mailbox(&self) -> u32 {
        self.num_mailbox
    }

    fn slot(&self, mailbox_id: u32, reg: MailboxReg) -> &AtomicU32 {
        &self.regs[mailbox_id as usize * MailboxReg::COUNT + reg.index()]
    }

    /// Register update made by the device itself
    pub fn device_write(&self, mailbox_id: u32, reg: MailboxReg, value: u32) {
        self.slot(mailbox_id, reg).store(value, Ordering::Release);
    }

    /// Times the host has rung the command doorbell of `mailbox_id`
    pub fn cmd_doorbell_count(&self, mailbox_id: u32) -> u64 {
        self.cmd_doorbells[mailbox_id as usize].load(Ordering::SeqCst)
    }

    /// Event the device thread sleeps on
    pub fn device_bell(&self) -> &Doorbell {
        &self.device_bell
    }

    /// Device address programmed for a queue, from the low/high CSR pair
    pub fn queue_address(&self, mailbox_id: u32, low: MailboxReg, high: MailboxReg) -> u64 {
        u64::from(self.read(mailbox_id, low)) | (u64::from(self.read(mailbox_id, high)) << 32)
    }
}

impl RegisterBlock for MockRegisters {
    fn read(&self, mailbox_id: u32, reg: MailboxReg) -> u32 {
        self.slot(mailbox_id, reg).load(Ordering::Acquire)
    }

    fn write(&self, mailbox_id: u32, reg: MailboxReg, value: u32) {
        match reg {
            MailboxReg::RespDoorbellClear => {
                self.device_write(mailbox_id, MailboxReg::RespDoorbellStatus, 0);
            }
            MailboxReg::CmdQueueDoorbellClear => {
                self.device_write(mailbox_id, MailboxReg::CmdDoorbellStatus, 0);
            }
            MailboxReg::CmdDoorbellSet => {
                self.cmd_doorbells[mailbox_id as usize].fetch_add(1, Ordering::SeqCst);
                self.device_write(mailbox_id, MailboxReg::CmdDoorbellStatus, 1);
            }
            _ => {}
        }
        self.slot(mailbox_id, reg).store(value, Ordering::Release);

        if matches!(reg, MailboxReg::CmdDoorbellSet | MailboxReg::RespHead) {
            self.device_bell.ring();
        }
    }
}

impl core::fmt::Debug for MockRegisters {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MockRegisters")
            .field("num_mailbox", &self.num_mailbox)
            .finish()
    }
}
