//! Mock control processor
//!
//! # Architecture
//! One thread per device, bound to one mailbox. Each pass it:
//! 1. resolves the queues from the address and size CSRs the host wrote,
//! 2. consumes every command between `CmdHead` and `CmdTail`, recording
//!    the arrival order and collecting the model's responses,
//! 3. copies as many pending responses as fit into the response queue,
//! 4. raises the response doorbell and the interrupt if it did anything.
//!
//! Responses that do not fit stay pending until the host moves `RespHead`.
//! The thread sleeps on the command doorbell between passes and polls
//! every few milliseconds in case a wakeup was folded into another one.

use core::sync::atomic::{AtomicBool, Ordering};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tpu_mailbox::sync::lock;
use tpu_mailbox::{
    CircularQueue, CommandElement, DeviceBuffer, KciResponseElement, MailboxReg, RegisterBlock,
};

use crate::firmware::FirmwareModel;
use crate::memory::MockAllocator;
use crate::regs::MockRegisters;

const POLL_INTERVAL: Duration = Duration::from_millis(2);

type IrqHandler = Arc<dyn Fn() + Send + Sync>;

struct Shared {
    mailbox_id: u32,
    regs: Arc<MockRegisters>,
    mem: Arc<MockAllocator>,
    model: Mutex<Box<dyn FirmwareModel>>,
    pending: Mutex<VecDeque<KciResponseElement>>,
    arrivals: Mutex<Vec<CommandElement>>,
    irq: Mutex<Option<IrqHandler>>,
    paused: AtomicBool,
    stop: AtomicBool,
}

struct Queue {
    buffer: Arc<DeviceBuffer>,
    geometry: CircularQueue,
}

impl Shared {
    fn resolve(&self, low: MailboxReg, high: MailboxReg, size: MailboxReg) -> Option<Queue> {
        let addr = self.regs.queue_address(self.mailbox_id, low, high);
        let geometry = CircularQueue::new(self.regs.read(self.mailbox_id, size))?;
        let buffer = self.mem.resolve(addr)?;
        Some(Queue { buffer, geometry })
    }

    /// One pass over both queues; returns whether anything moved
    fn step(&self) -> bool {
        let id = self.mailbox_id;
        if self.regs.read(id, MailboxReg::ContextEnable) == 0 {
            return false;
        }
        let mut progressed = false;

        if let Some(cmdq) = self.resolve(
            MailboxReg::CmdQueueAddressLow,
            MailboxReg::CmdQueueAddressHigh,
            MailboxReg::CmdQueueSize,
        ) {
            let tail = self.regs.read_sync(id, MailboxReg::CmdTail);
            let mut head = self.regs.read(id, MailboxReg::CmdHead);
            while cmdq.geometry.count(head, tail) > 0 {
                let cmd: CommandElement = cmdq.buffer.read_element(cmdq.geometry.real_index(head));
                let responses = lock(&self.model).on_command(&cmd, &self.mem);
                lock(&self.pending).extend(responses);
                lock(&self.arrivals).push(cmd);

                head = cmdq.geometry.inc(head, 1);
                self.regs.device_write(id, MailboxReg::CmdHead, head);
                progressed = true;
            }
        }

        if let Some(respq) = self.resolve(
            MailboxReg::RespQueueAddressLow,
            MailboxReg::RespQueueAddressHigh,
            MailboxReg::RespQueueSize,
        ) {
            let mut pending = lock(&self.pending);
            let head = self.regs.read(id, MailboxReg::RespHead);
            let mut tail = self.regs.read(id, MailboxReg::RespTail);
            while !respq.geometry.is_full(head, tail) {
                let Some(resp) = pending.pop_front() else {
                    break;
                };
                respq
                    .buffer
                    .write_element(respq.geometry.real_index(tail), &resp);
                tail = respq.geometry.inc(tail, 1);
                self.regs.device_write(id, MailboxReg::RespTail, tail);
                progressed = true;
            }
        }

        if progressed {
            self.raise_irq();
        }
        progressed
    }

    fn raise_irq(&self) {
        self.regs
            .device_write(self.mailbox_id, MailboxReg::RespDoorbellStatus, 1);
        let handler = lock(&self.irq).clone();
        if let Some(handler) = handler {
            (*handler)();
        }
    }

    fn run(&self) {
        while !self.stop.load(Ordering::Acquire) {
            let seen = self.regs.device_bell().generation();
            if !self.paused.load(Ordering::Acquire) {
                self.step();
            }
            self.regs
                .device_bell()
                .wait_past(seen, Instant::now() + POLL_INTERVAL);
        }
    }
}

/// A running mock device bound to one mailbox
pub struct MockDevice {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl MockDevice {
    /// Start the device thread for `mailbox_id`
    pub fn start(
        regs: Arc<MockRegisters>,
        mem: Arc<MockAllocator>,
        mailbox_id: u32,
        model: impl FirmwareModel + 'static,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            mailbox_id,
            regs,
            mem,
            model: Mutex::new(Box::new(model)),
            pending: Mutex::new(VecDeque::new()),
            arrivals: Mutex::new(Vec::new()),
            irq: Mutex::new(None),
            paused: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        });
        let thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("mock-tpu-mbox{mailbox_id}"))
                .spawn(move || shared.run())?
        };
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Callback run as the mailbox interrupt, on the device thread
    pub fn set_irq_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        *lock(&self.shared.irq) = Some(Arc::new(handler));
    }

    /// Swap the firmware model
    pub fn set_model(&self, model: impl FirmwareModel + 'static) {
        *lock(&self.shared.model) = Box::new(model);
    }

    /// Stop or resume processing; queued work stays where it is
    pub fn set_paused(&self, paused: bool) {
        self.shared.paused.store(paused, Ordering::Release);
        self.shared.regs.device_bell().ring();
    }

    /// Queue a response the firmware sends on its own, e.g. a reverse KCI
    pub fn inject_response(&self, resp: KciResponseElement) {
        lock(&self.shared.pending).push_back(resp);
        self.shared.regs.device_bell().ring();
    }

    /// Commands in the order the device consumed them
    pub fn arrivals(&self) -> Vec<CommandElement> {
        lock(&self.shared.arrivals).clone()
    }

    /// Responses produced but not yet written to the queue
    pub fn pending_responses(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    /// Block until `n` commands have arrived or `timeout` passes
    pub fn wait_for_arrivals(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if lock(&self.shared.arrivals).len() >= n {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        lock(&self.shared.arrivals).len() >= n
    }

    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.regs.device_bell().ring();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("mock device thread panicked");
            }
        }
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::EchoFirmware;
    use tpu_mailbox::{DeviceMemoryAllocator, QueueElement};

    struct Rig {
        regs: Arc<MockRegisters>,
        mem: Arc<MockAllocator>,
        cmdq: tpu_mailbox::CoherentMem,
        respq: tpu_mailbox::CoherentMem,
    }

    fn rig(size: u32) -> Rig {
        let regs = Arc::new(MockRegisters::new(1));
        let mem = Arc::new(MockAllocator::new());
        let cmdq = mem.alloc(size as usize * CommandElement::byte_size()).unwrap();
        let respq = mem
            .alloc(size as usize * KciResponseElement::byte_size())
            .unwrap();
        for (low, high, size_reg, addr) in [
            (
                MailboxReg::CmdQueueAddressLow,
                MailboxReg::CmdQueueAddressHigh,
                MailboxReg::CmdQueueSize,
                cmdq.device_addr(),
            ),
            (
                MailboxReg::RespQueueAddressLow,
                MailboxReg::RespQueueAddressHigh,
                MailboxReg::RespQueueSize,
                respq.device_addr(),
            ),
        ] {
            regs.write(0, low, addr as u32);
            regs.write(0, high, (addr >> 32) as u32);
            regs.write(0, size_reg, size);
        }
        regs.write(0, MailboxReg::ContextEnable, 1);
        Rig {
            regs,
            mem,
            cmdq,
            respq,
        }
    }

    fn push(rig: &Rig, seq: u64) {
        let queue = CircularQueue::new(rig.regs.read(0, MailboxReg::CmdQueueSize)).unwrap();
        let tail = rig.regs.read(0, MailboxReg::CmdTail);
        let mut cmd = CommandElement::default();
        cmd.seq = seq;
        rig.cmdq.buffer().write_element(queue.real_index(tail), &cmd);
        rig.regs.write(0, MailboxReg::CmdTail, queue.inc(tail, 1));
        rig.regs.write(0, MailboxReg::CmdDoorbellSet, 1);
    }

    #[test]
    fn test_consumes_commands_and_answers() {
        let rig = rig(4);
        let device =
            MockDevice::start(rig.regs.clone(), rig.mem.clone(), 0, EchoFirmware::new()).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        device.set_irq_handler(move || {
            let _ = tx.send(());
        });

        push(&rig, 0);
        push(&rig, 1);
        assert!(device.wait_for_arrivals(2, Duration::from_secs(5)));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while rig.regs.read(0, MailboxReg::RespTail) < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(rig.regs.read(0, MailboxReg::CmdHead), 2);
        assert_eq!(rig.regs.read(0, MailboxReg::RespTail), 2);
        let second: KciResponseElement = rig.respq.buffer().read_element(1);
        assert_eq!(second.seq, 1);
        assert_eq!(rig.regs.read(0, MailboxReg::RespDoorbellStatus), 1);
    }

    #[test]
    fn test_full_response_queue_holds_back() {
        let rig = rig(2);
        let device =
            MockDevice::start(rig.regs.clone(), rig.mem.clone(), 0, EchoFirmware::new()).unwrap();
        for seq in 0..2 {
            push(&rig, seq);
        }
        assert!(device.wait_for_arrivals(2, Duration::from_secs(5)));
        for seq in 0..2 {
            device.inject_response(KciResponseElement::reverse(0x8000, seq));
        }

        // two answers fit, the injected pair waits for the host
        let deadline = Instant::now() + Duration::from_secs(5);
        while device.pending_responses() != 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(device.pending_responses(), 2);

        rig.regs.write(0, MailboxReg::RespHead, 2);
        let deadline = Instant::now() + Duration::from_secs(5);
        while device.pending_responses() != 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(rig.regs.read(0, MailboxReg::RespTail), 0);
        let injected: KciResponseElement = rig.respq.buffer().read_element(0);
        assert!(injected.is_reverse());
    }
}
