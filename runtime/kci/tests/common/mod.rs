//! Shared rig: a mock device wired to a live KCI session

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tpu_kci::{Kci, KciConfig, TimeoutProfile};
use tpu_mailbox::{MailboxManager, MailboxManagerDesc, MailboxReg, RegisterBlock};
use tpu_mock::{FirmwareModel, MockAllocator, MockDevice, MockRegisters};

pub struct Rig {
    // stopped before the session goes away
    pub device: MockDevice,
    pub kci: Kci,
    pub manager: Arc<MailboxManager>,
    pub mem: Arc<MockAllocator>,
    pub regs: Arc<MockRegisters>,
}

pub fn config(queue_size: u32, timeout_ms: u64) -> KciConfig {
    KciConfig {
        queue_size,
        timeout_ms: Some(timeout_ms),
        ..KciConfig::for_profile(TimeoutProfile::Test)
    }
}

/// Session plus device, with the device interrupt routed to the manager
pub fn rig(config: KciConfig, model: impl FirmwareModel + 'static) -> Rig {
    let rig = rig_without_irq(config, model);
    let manager = Arc::clone(&rig.manager);
    rig.device.set_irq_handler(move || {
        manager.handle_irq();
    });
    rig
}

/// Session plus device; responses are only fetched when the test asks
pub fn rig_without_irq(config: KciConfig, model: impl FirmwareModel + 'static) -> Rig {
    let regs = Arc::new(MockRegisters::new(8));
    let mem = Arc::new(MockAllocator::new());
    let manager =
        Arc::new(MailboxManager::new(regs.clone(), MailboxManagerDesc::JANEIRO).unwrap());
    let kci = Kci::init(manager.clone(), mem.clone(), config).unwrap();
    let device = MockDevice::start(regs.clone(), mem.clone(), kci.mailbox_id(), model).unwrap();
    Rig {
        device,
        kci,
        manager,
        mem,
        regs,
    }
}

/// Poll `cond` for up to five seconds
pub fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

pub fn reg(rig: &Rig, reg: MailboxReg) -> u32 {
    rig.regs.read(rig.kci.mailbox_id(), reg)
}
