//! Session setup, reprogramming and teardown

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{config, eventually, rig};
use tpu_kci::{Kci, KciError};
use tpu_mailbox::{
    CommandElement, DmaDescriptor, KciResponseElement, MailboxManager, MailboxManagerDesc,
    MailboxReg, QueueKind, RegisterBlock, KCI_MAILBOX_ID,
};
use tpu_mock::{EchoFirmware, MockAllocator, MockDevice, MockRegisters};

fn silent(_: &CommandElement, _: &MockAllocator) -> Vec<KciResponseElement> {
    Vec::new()
}

#[test]
fn test_reinit_reuses_queue_memory() {
    let regs = Arc::new(MockRegisters::new(8));
    let mem = Arc::new(MockAllocator::new());
    let manager =
        Arc::new(MailboxManager::new(regs.clone(), MailboxManagerDesc::JANEIRO).unwrap());
    let kci = Kci::init(manager.clone(), mem.clone(), config(16, 2000)).unwrap();
    let mappings = kci.mappings();
    let allocs = mem.total_allocs();

    // power cycle: the device forgets every CSR
    for reg in [
        MailboxReg::ContextEnable,
        MailboxReg::CmdQueueAddressLow,
        MailboxReg::CmdQueueAddressHigh,
        MailboxReg::CmdQueueSize,
        MailboxReg::RespQueueAddressLow,
        MailboxReg::RespQueueAddressHigh,
        MailboxReg::RespQueueSize,
        MailboxReg::CmdHead,
        MailboxReg::CmdTail,
        MailboxReg::RespHead,
        MailboxReg::RespTail,
    ] {
        regs.device_write(0, reg, 0);
    }
    kci.reinit().unwrap();

    assert_eq!(kci.mappings(), mappings);
    assert_eq!(mem.total_allocs(), allocs);
    for mapping in mappings {
        let (low, high, size) = MailboxReg::queue_config(mapping.kind);
        assert_eq!(regs.queue_address(0, low, high), mapping.device_addr);
        assert_eq!(regs.read(0, size), 16);
    }
    assert_eq!(mappings[0].kind, QueueKind::Command);
    assert_eq!(regs.read(0, MailboxReg::ContextEnable), 1);

    let device = MockDevice::start(regs.clone(), mem.clone(), 0, EchoFirmware::new()).unwrap();
    let irq_manager = Arc::clone(&manager);
    device.set_irq_handler(move || {
        irq_manager.handle_irq();
    });
    kci.ack().unwrap();
}

#[test]
fn test_allocation_failure_leaks_nothing() {
    for successes in [0, 1] {
        let regs = Arc::new(MockRegisters::new(8));
        let mem = Arc::new(MockAllocator::new());
        let manager =
            Arc::new(MailboxManager::new(regs.clone(), MailboxManagerDesc::JANEIRO).unwrap());
        mem.fail_after(successes);

        assert!(matches!(
            Kci::init(manager.clone(), mem.clone(), config(16, 2000)),
            Err(KciError::OutOfMemory { .. })
        ));
        assert_eq!(mem.live_count(), 0);
        assert!(!manager.is_claimed(KCI_MAILBOX_ID));
    }
}

#[test]
fn test_cancel_all_pending_wakes_waiters() {
    let rig = rig(config(8, 10_000), silent);
    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let kci = rig.kci.clone();
            thread::spawn(move || kci.send_command(CommandElement::new(0, DmaDescriptor::EMPTY)))
        })
        .collect();
    assert!(rig.device.wait_for_arrivals(3, Duration::from_secs(5)));
    assert!(eventually(|| rig.kci.pending() == 3));

    assert_eq!(rig.kci.cancel_all_pending(), 3);
    for waiter in waiters {
        assert!(matches!(
            waiter.join().unwrap(),
            Err(KciError::Cancelled { .. })
        ));
    }
    assert_eq!(rig.kci.pending(), 0);
}

#[test]
fn test_release_cancels_waiters_and_frees_queues() {
    let rig = rig(config(8, 10_000), silent);
    let waiter = {
        let kci = rig.kci.clone();
        thread::spawn(move || kci.ack())
    };
    assert!(rig.device.wait_for_arrivals(1, Duration::from_secs(5)));
    assert!(eventually(|| rig.kci.pending() == 1));

    rig.kci.release();
    assert!(matches!(
        waiter.join().unwrap(),
        Err(KciError::Cancelled { seq: 0 })
    ));
    assert_eq!(rig.mem.live_count(), 0);
    assert!(!rig.manager.is_claimed(KCI_MAILBOX_ID));
    assert!(matches!(rig.kci.ack(), Err(KciError::NoDevice)));
}
