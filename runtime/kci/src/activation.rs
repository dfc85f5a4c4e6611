//! Mailbox activation handshake
//!
//! The firmware must be told which VII mailboxes are in use before it
//! serves them. [`Handshake`] remembers what the host wants open (`state`)
//! and what the firmware has been told (`fw_state`), so OPEN_DEVICE and
//! CLOSE_DEVICE are sent only for the difference. A firmware restart
//! forgets everything the firmware knew; [`Handshake::clear_fw_state`]
//! records that and [`Handshake::restore`] re-sends the open set.

use std::sync::Mutex;

use tpu_mailbox::sync::lock;

use crate::session::Kci;
use crate::Result;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct State {
    state: u32,
    fw_state: u32,
}

#[derive(Debug, Default)]
pub struct Handshake {
    inner: Mutex<State>,
}

impl Handshake {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the mailboxes in the `mailbox_ids` bitmask
    ///
    /// # Errors
    /// Propagates the OPEN_DEVICE failure; nothing is recorded then.
    pub fn activate(&self, kci: &Kci, mailbox_ids: u32) -> Result<()> {
        let mut inner = lock(&self.inner);
        let to_send = mailbox_ids & !inner.fw_state;
        if to_send != 0 {
            kci.open_device(to_send)?;
        }
        inner.state |= mailbox_ids;
        inner.fw_state |= mailbox_ids;
        Ok(())
    }

    /// Close the mailboxes in the `mailbox_ids` bitmask
    ///
    /// The host-side state is cleared even if CLOSE_DEVICE fails.
    pub fn deactivate(&self, kci: &Kci, mailbox_ids: u32) -> Result<()> {
        let mut inner = lock(&self.inner);
        inner.state &= !mailbox_ids;
        let to_send = mailbox_ids & inner.fw_state;
        if to_send == 0 {
            return Ok(());
        }
        inner.fw_state &= !to_send;
        kci.close_device(to_send)
    }

    /// The firmware restarted and knows no open mailboxes
    pub fn clear_fw_state(&self) {
        lock(&self.inner).fw_state = 0;
    }

    /// Re-open on the firmware everything the host still has open
    pub fn restore(&self, kci: &Kci) -> Result<()> {
        let mut inner = lock(&self.inner);
        let to_send = inner.state & !inner.fw_state;
        if to_send == 0 {
            return Ok(());
        }
        kci.open_device(to_send)?;
        inner.fw_state |= to_send;
        Ok(())
    }

    /// Mailboxes the host has open
    pub fn state(&self) -> u32 {
        lock(&self.inner).state
    }

    /// Mailboxes the firmware has been told about
    pub fn fw_state(&self) -> u32 {
        lock(&self.inner).fw_state
    }
}
