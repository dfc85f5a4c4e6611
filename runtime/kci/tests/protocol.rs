//! Command ordering and response matching against a mock device

mod common;

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use common::{config, eventually, reg, rig, rig_without_irq};
use tpu_kci::{KciError, TimeoutPhase};
use tpu_mailbox::{CommandElement, DmaDescriptor, KciResponseElement, MailboxReg};
use tpu_mock::{EchoFirmware, MockAllocator};

fn cmd(code: u64) -> CommandElement {
    CommandElement::new(code, DmaDescriptor::EMPTY)
}

#[test]
fn test_concurrent_senders_keep_queue_order() {
    const THREADS: u64 = 8;
    const PER_THREAD: u64 = 10;
    let rig = rig(config(4, 2000), EchoFirmware::new());
    let barrier = Arc::new(Barrier::new(THREADS as usize));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let kci = rig.kci.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..PER_THREAD {
                    let code = t * 100 + i;
                    let resp = kci.send_command(cmd(code)).unwrap();
                    assert_eq!(resp.retval, code as u32);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let seqs: Vec<u64> = rig.device.arrivals().iter().map(|c| c.seq).collect();
    assert_eq!(seqs, (0..THREADS * PER_THREAD).collect::<Vec<_>>());
    assert_eq!(rig.kci.sequence(), THREADS * PER_THREAD);
    assert_eq!(rig.kci.pending(), 0);
}

#[test]
fn test_each_caller_gets_its_own_response() {
    let rig = rig(config(8, 2000), EchoFirmware::new());
    for code in [3u64, 4, 9] {
        let resp = rig.kci.send_command(cmd(code)).unwrap();
        assert_eq!(resp.code, 0);
        assert_eq!(resp.retval, code as u32);
    }
}

#[test]
fn test_skipped_command_gets_no_response() {
    let model = |c: &CommandElement, _: &MockAllocator| -> Vec<KciResponseElement> {
        if c.seq == 1 {
            Vec::new()
        } else {
            vec![KciResponseElement::new(c.seq, 0, 0)]
        }
    };
    let rig = rig(config(8, 2000), model);
    rig.kci.send_command(cmd(0)).unwrap();

    let skipped = {
        let kci = rig.kci.clone();
        thread::spawn(move || kci.send_command(cmd(0)))
    };
    assert!(rig.device.wait_for_arrivals(2, Duration::from_secs(5)));
    rig.kci.send_command(cmd(0)).unwrap();

    assert!(matches!(
        skipped.join().unwrap(),
        Err(KciError::NoResponse { seq: 1 })
    ));
    assert_eq!(rig.kci.pending(), 0);
}

#[test]
fn test_timeout_then_late_response_is_ignored() {
    let model = |c: &CommandElement, _: &MockAllocator| -> Vec<KciResponseElement> {
        if c.seq == 0 {
            Vec::new()
        } else {
            vec![KciResponseElement::new(c.seq, 0, 7)]
        }
    };
    let rig = rig(config(8, 100), model);

    let start = Instant::now();
    let result = rig.kci.send_command(cmd(0));
    let waited = start.elapsed();
    assert!(matches!(
        result,
        Err(KciError::Timeout {
            phase: TimeoutPhase::Response,
            waited_ms: 100
        })
    ));
    assert!(waited >= Duration::from_millis(100), "returned after {waited:?}");
    assert!(waited < Duration::from_millis(300), "returned after {waited:?}");
    assert_eq!(rig.kci.pending(), 0);

    rig.device.inject_response(KciResponseElement::new(0, 0, 0));
    let resp = rig.kci.send_command(cmd(0)).unwrap();
    assert_eq!((resp.seq, resp.retval), (1, 7));
}

#[test]
fn test_five_commands_through_four_slot_queue() {
    let mut held = Vec::new();
    let model = move |c: &CommandElement, _: &MockAllocator| -> Vec<KciResponseElement> {
        held.push(KciResponseElement::new(c.seq, 0, c.code as u32));
        if held.len() == 5 {
            std::mem::take(&mut held)
        } else {
            Vec::new()
        }
    };
    let rig = rig_without_irq(config(4, 5000), model);

    let senders: Vec<_> = (0..5u64)
        .map(|i| {
            let kci = rig.kci.clone();
            let sender = thread::spawn(move || kci.send_command(cmd(10 + i)));
            assert!(rig
                .device
                .wait_for_arrivals(i as usize + 1, Duration::from_secs(5)));
            sender
        })
        .collect();
    assert_eq!(rig.regs.cmd_doorbell_count(0), 5);

    // four answers fill the response queue, the fifth waits for room
    assert!(eventually(|| reg(&rig, MailboxReg::RespTail) == 4
        && rig.device.pending_responses() == 1));
    rig.kci.consume_responses();
    assert_eq!(rig.regs.cmd_doorbell_count(0), 6);

    assert!(eventually(|| reg(&rig, MailboxReg::RespTail) == 5));
    rig.kci.consume_responses();
    assert_eq!(rig.regs.cmd_doorbell_count(0), 6);
    assert_eq!(reg(&rig, MailboxReg::RespHead), 5);

    for (i, sender) in senders.into_iter().enumerate() {
        let resp = sender.join().unwrap().unwrap();
        assert_eq!(resp.seq, i as u64);
        assert_eq!(resp.retval, 10 + i as u32);
    }
}

#[test]
fn test_callers_beyond_queue_capacity_all_complete() {
    // answers nothing until all five commands are in
    let mut held = Vec::new();
    let model = move |c: &CommandElement, _: &MockAllocator| -> Vec<KciResponseElement> {
        held.push(KciResponseElement::new(c.seq, 0, c.code as u32));
        if held.len() == 5 {
            std::mem::take(&mut held)
        } else {
            Vec::new()
        }
    };
    let config = config(4, 3000);
    assert_eq!(config.max_pending, None);
    let rig = rig(config, model);
    let barrier = Arc::new(Barrier::new(5));

    let senders: Vec<_> = (0..5u64)
        .map(|i| {
            let kci = rig.kci.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                kci.send_command(cmd(20 + i))
            })
        })
        .collect();
    for (i, sender) in senders.into_iter().enumerate() {
        let resp = sender.join().unwrap().unwrap();
        assert_eq!(resp.retval, 20 + i as u32);
    }
    assert_eq!(rig.device.arrivals().len(), 5);
    assert_eq!(rig.kci.pending(), 0);
}

#[test]
fn test_ten_threads_with_jittery_device() {
    let rig = rig(
        config(8, 5000),
        EchoFirmware::new().with_jitter(Duration::from_millis(2), 7),
    );
    rig.kci.ack().unwrap();
    let before = rig.kci.sequence();

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let kci = rig.kci.clone();
            thread::spawn(move || kci.ack())
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }
    assert_eq!(rig.kci.sequence(), before + 10);
    assert_eq!(rig.kci.pending(), 0);
}
