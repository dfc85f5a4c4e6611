//! Mailbox Control/Status Registers
//!
//! Every mailbox exposes three CSR blocks: a context block only the host
//! kernel may touch, and one block each for the command and response
//! queues. The layout and order match the RTL.

use core::sync::atomic::{fence, Ordering};

/// Distance between the CSR windows of two consecutive mailboxes
pub const MAILBOX_CSR_STRIDE: u32 = 0x2000;
/// Offset of the command-queue block inside a mailbox window
pub const CMD_QUEUE_CSR_OFFSET: u32 = 0x1000;
/// Offset of the response-queue block inside a mailbox window
pub const RESP_QUEUE_CSR_OFFSET: u32 = 0x1800;

/// Which queue of a mailbox an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Command,
    Response,
}

/// One mailbox register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MailboxReg {
    // Context block
    ContextEnable,
    Priority,
    CmdQueueDoorbellEnable,
    CmdQueueTailDoorbellEnable,
    CmdQueueDoorbellClear,
    CmdQueueAddressLow,
    CmdQueueAddressHigh,
    CmdQueueSize,
    RespQueueDoorbellEnable,
    RespQueueTailDoorbellEnable,
    RespQueueAddressLow,
    RespQueueAddressHigh,
    RespQueueSize,

    // Command queue block
    CmdDoorbellSet,
    CmdDoorbellStatus,
    CmdHead,
    CmdTail,
    CmdConfig,
    CmdErrorStatus,

    // Response queue block
    RespDoorbellSet,
    RespDoorbellClear,
    RespDoorbellStatus,
    RespHead,
    RespTail,
    RespConfig,
    RespErrorStatus,
}

impl MailboxReg {
    /// Number of registers in one mailbox window
    pub const COUNT: usize = 26;

    /// Dense index of the register, `0..COUNT`
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Offset of the register inside its mailbox window
    pub const fn offset(self) -> u32 {
        use MailboxReg::*;
        match self {
            ContextEnable => 0x00,
            Priority => 0x04,
            CmdQueueDoorbellEnable => 0x08,
            CmdQueueTailDoorbellEnable => 0x0c,
            CmdQueueDoorbellClear => 0x10,
            CmdQueueAddressLow => 0x14,
            CmdQueueAddressHigh => 0x18,
            CmdQueueSize => 0x1c,
            RespQueueDoorbellEnable => 0x20,
            RespQueueTailDoorbellEnable => 0x24,
            RespQueueAddressLow => 0x28,
            RespQueueAddressHigh => 0x2c,
            RespQueueSize => 0x30,

            CmdDoorbellSet => CMD_QUEUE_CSR_OFFSET,
            CmdDoorbellStatus => CMD_QUEUE_CSR_OFFSET + 0x04,
            CmdHead => CMD_QUEUE_CSR_OFFSET + 0x08,
            CmdTail => CMD_QUEUE_CSR_OFFSET + 0x0c,
            CmdConfig => CMD_QUEUE_CSR_OFFSET + 0x10,
            CmdErrorStatus => CMD_QUEUE_CSR_OFFSET + 0x14,

            RespDoorbellSet => RESP_QUEUE_CSR_OFFSET,
            RespDoorbellClear => RESP_QUEUE_CSR_OFFSET + 0x04,
            RespDoorbellStatus => RESP_QUEUE_CSR_OFFSET + 0x08,
            RespHead => RESP_QUEUE_CSR_OFFSET + 0x0c,
            RespTail => RESP_QUEUE_CSR_OFFSET + 0x10,
            RespConfig => RESP_QUEUE_CSR_OFFSET + 0x14,
            RespErrorStatus => RESP_QUEUE_CSR_OFFSET + 0x18,
        }
    }

    /// Absolute offset of the register of mailbox `mailbox_id`
    pub const fn absolute(self, mailbox_id: u32) -> u32 {
        mailbox_id * MAILBOX_CSR_STRIDE + self.offset()
    }

    /// Address registers (low, high) and size register of a queue
    pub const fn queue_config(kind: QueueKind) -> (Self, Self, Self) {
        match kind {
            QueueKind::Command => (
                Self::CmdQueueAddressLow,
                Self::CmdQueueAddressHigh,
                Self::CmdQueueSize,
            ),
            QueueKind::Response => (
                Self::RespQueueAddressLow,
                Self::RespQueueAddressHigh,
                Self::RespQueueSize,
            ),
        }
    }
}

/// Register access to the mailbox CSRs of one device
///
/// `read_sync`/`write_sync` are for accesses the protocol depends on: the
/// synchronized read orders every later access after it, the synchronized
/// write is complete (read back) before it returns.
pub trait RegisterBlock: Send + Sync {
    fn read(&self, mailbox_id: u32, reg: MailboxReg) -> u32;

    fn write(&self, mailbox_id: u32, reg: MailboxReg, value: u32);

    fn read_sync(&self, mailbox_id: u32, reg: MailboxReg) -> u32 {
        let value = self.read(mailbox_id, reg);
        fence(Ordering::Acquire);
        value
    }

    fn write_sync(&self, mailbox_id: u32, reg: MailboxReg, value: u32) {
        fence(Ordering::SeqCst);
        self.write(mailbox_id, reg, value);
        let _ = self.read(mailbox_id, reg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_offsets() {
        assert_eq!(MailboxReg::RespQueueSize.offset(), 0x30);
        assert_eq!(MailboxReg::CmdTail.offset(), 0x100c);
        assert_eq!(MailboxReg::RespTail.offset(), 0x1810);
        assert_eq!(MailboxReg::CmdDoorbellSet.absolute(2), 0x5000);
    }

    #[test]
    fn test_dense_index_covers_window() {
        assert_eq!(MailboxReg::ContextEnable.index(), 0);
        assert_eq!(MailboxReg::RespErrorStatus.index(), MailboxReg::COUNT - 1);
    }
}
