//! Wait-list
//!
//! # Purpose
//! Commands waiting for a response, in sequence order. Each waiter owns one
//! slot of the table and blocks until the slot is filled by the response
//! path, by teardown, or by its own timeout. The table grows on demand; with
//! a limit set, callers past it wait for a slot to come free.
//!
//! # Matching
//! Responses are assumed to arrive in command order. Matching pops from the
//! front while the waiting sequence is below the response's: those commands
//! were skipped by the device and complete with `NoResponse`. An equal
//! sequence completes with the response. A larger one means the response
//! belongs to nobody still waiting and is dropped.
//!
//! # Locking
//! One mutex, independent of the queue locks, and two condvars: one for
//! responses and one for free slots. Completing entries does not notify;
//! the caller wakes everyone once per batch with [`WaitList::wake_all`].

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tpu_mailbox::sync::{lock, wait_until};
use tpu_mailbox::{KciResponseElement, ResponseStatus};

use crate::{KciError, Result, TimeoutPhase};

/// A reserved wait-list slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotId(usize);

#[derive(Debug, Clone, Copy)]
enum Slot {
    Free,
    /// Handed out, no sequence number yet
    Reserved,
    Waiting { seq: u64 },
    Done(KciResponseElement),
}

#[derive(Debug)]
struct Inner {
    slots: Vec<Slot>,
    free: Vec<usize>,
    /// Waiting slots, ascending sequence
    order: VecDeque<usize>,
}

impl Inner {
    fn recycle(&mut self, idx: usize) {
        self.slots[idx] = Slot::Free;
        self.free.push(idx);
    }

    fn unlink(&mut self, idx: usize) {
        if let Some(pos) = self.order.iter().position(|&i| i == idx) {
            self.order.remove(pos);
        }
    }
}

#[derive(Debug)]
pub struct WaitList {
    inner: Mutex<Inner>,
    cond: Condvar,
    space: Condvar,
    /// Most slots handed out at once; `None` for no limit
    limit: Option<usize>,
}

impl WaitList {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                free: Vec::new(),
                order: VecDeque::new(),
            }),
            cond: Condvar::new(),
            space: Condvar::new(),
            limit,
        }
    }

    /// Take a slot for a command about to be sent
    ///
    /// Waits up to `timeout` if the slot limit is reached.
    ///
    /// # Errors
    /// `Timeout { phase: Enqueue }` if no slot came free in time.
    pub fn reserve(&self, timeout: Duration) -> Result<SlotId> {
        let deadline = Instant::now() + timeout;
        let mut inner = lock(&self.inner);
        loop {
            if let Some(idx) = inner.free.pop() {
                inner.slots[idx] = Slot::Reserved;
                return Ok(SlotId(idx));
            }
            if self.limit.map_or(true, |limit| inner.slots.len() < limit) {
                inner.slots.push(Slot::Reserved);
                return Ok(SlotId(inner.slots.len() - 1));
            }
            let (guard, timed_out) = wait_until(&self.space, inner, deadline);
            inner = guard;
            if timed_out && inner.free.is_empty() {
                return Err(KciError::Timeout {
                    phase: TimeoutPhase::Enqueue,
                    waited_ms: timeout.as_millis() as u64,
                });
            }
        }
    }

    /// Start waiting for `seq` in `slot`
    ///
    /// Must be called in sequence order, i.e. under the command lock.
    pub fn arm(&self, slot: SlotId, seq: u64) {
        let mut inner = lock(&self.inner);
        debug_assert!(matches!(inner.slots[slot.0], Slot::Reserved));
        debug_assert!(inner
            .order
            .back()
            .map_or(true, |&last| matches!(inner.slots[last], Slot::Waiting { seq: s } if s < seq)));
        inner.slots[slot.0] = Slot::Waiting { seq };
        inner.order.push_back(slot.0);
    }

    /// Give back a slot whose command never made it into the queue
    pub fn release(&self, slot: SlotId) {
        let mut inner = lock(&self.inner);
        inner.unlink(slot.0);
        inner.recycle(slot.0);
        self.space.notify_one();
    }

    /// Match one response against the waiting commands
    ///
    /// Returns the number of waiters completed, including skipped ones.
    pub fn consume(&self, resp: &KciResponseElement) -> usize {
        let mut inner = lock(&self.inner);
        let mut completed = 0;
        while let Some(&idx) = inner.order.front() {
            let Slot::Waiting { seq } = inner.slots[idx] else {
                inner.order.pop_front();
                continue;
            };
            if seq > resp.seq {
                break;
            }
            inner.order.pop_front();
            completed += 1;
            if seq == resp.seq {
                let mut matched = *resp;
                matched.set_status(ResponseStatus::Ok);
                inner.slots[idx] = Slot::Done(matched);
                return completed;
            }
            log::warn!("kci: no response for seq {} (got seq {})", seq, resp.seq);
            let mut skipped = KciResponseElement::new(seq, 0, 0);
            skipped.set_status(ResponseStatus::NoResponse);
            inner.slots[idx] = Slot::Done(skipped);
        }
        if completed == 0 {
            log::debug!("kci: dropping unmatched response seq {}", resp.seq);
        }
        completed
    }

    /// Wake every waiter to recheck its slot
    pub fn wake_all(&self) {
        self.cond.notify_all();
    }

    /// Block until `slot` is completed or `timeout` passes
    ///
    /// On completion the slot is freed and its response returned; the
    /// status tells a match from a skip or a cancel. On timeout the entry is
    /// removed so a late response finds nothing, and `None` is returned.
    pub fn wait(&self, slot: SlotId, timeout: Duration) -> Option<KciResponseElement> {
        let deadline = Instant::now() + timeout;
        let mut inner = lock(&self.inner);
        loop {
            if let Slot::Done(resp) = inner.slots[slot.0] {
                inner.recycle(slot.0);
                self.space.notify_one();
                return Some(resp);
            }
            let (guard, timed_out) = wait_until(&self.cond, inner, deadline);
            inner = guard;
            if timed_out {
                if let Slot::Done(resp) = inner.slots[slot.0] {
                    inner.recycle(slot.0);
                    self.space.notify_one();
                    return Some(resp);
                }
                inner.unlink(slot.0);
                inner.recycle(slot.0);
                self.space.notify_one();
                return None;
            }
        }
    }

    /// Complete every waiter with `Cancelled` and wake them
    ///
    /// Returns how many were waiting.
    pub fn cancel_all(&self) -> usize {
        let mut inner = lock(&self.inner);
        let waiting: Vec<usize> = inner.order.drain(..).collect();
        for &idx in &waiting {
            if let Slot::Waiting { seq } = inner.slots[idx] {
                let mut cancelled = KciResponseElement::new(seq, 0, 0);
                cancelled.set_status(ResponseStatus::Cancelled);
                inner.slots[idx] = Slot::Done(cancelled);
            }
        }
        drop(inner);
        self.cond.notify_all();
        waiting.len()
    }

    /// Commands still waiting for a response
    pub fn pending(&self) -> usize {
        lock(&self.inner).order.len()
    }

    /// Sequence numbers still waiting, front first
    pub fn pending_seqs(&self) -> Vec<u64> {
        let inner = lock(&self.inner);
        inner
            .order
            .iter()
            .filter_map(|&idx| match inner.slots[idx] {
                Slot::Waiting { seq } => Some(seq),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn armed(list: &WaitList, seqs: &[u64]) -> Vec<SlotId> {
        seqs.iter()
            .map(|&seq| {
                let slot = list.reserve(Duration::ZERO).unwrap();
                list.arm(slot, seq);
                slot
            })
            .collect()
    }

    #[test]
    fn test_in_order_matching() {
        let list = WaitList::new(None);
        let slots = armed(&list, &[1, 2, 3]);
        for seq in 1..=3 {
            assert_eq!(list.consume(&KciResponseElement::new(seq, 0, seq as u32 * 10)), 1);
        }
        for (slot, seq) in slots.into_iter().zip(1..=3u64) {
            let resp = list.wait(slot, Duration::ZERO).unwrap();
            assert_eq!(resp.seq, seq);
            assert_eq!(resp.retval, seq as u32 * 10);
            assert_eq!(resp.status(), ResponseStatus::Ok);
        }
        assert_eq!(list.pending(), 0);
    }

    #[test]
    fn test_gap_yields_no_response() {
        let list = WaitList::new(None);
        let slots = armed(&list, &[1, 2, 3]);
        list.consume(&KciResponseElement::new(1, 0, 0));
        assert_eq!(list.consume(&KciResponseElement::new(3, 0, 0)), 2);

        let skipped = list.wait(slots[1], Duration::ZERO).unwrap();
        assert_eq!(skipped.status(), ResponseStatus::NoResponse);
        assert_eq!(skipped.seq, 2);
        assert_eq!(
            list.wait(slots[2], Duration::ZERO).unwrap().status(),
            ResponseStatus::Ok
        );
    }

    #[test]
    fn test_unmatched_response_is_dropped() {
        let list = WaitList::new(None);
        let _slots = armed(&list, &[5]);
        assert_eq!(list.consume(&KciResponseElement::new(4, 0, 0)), 0);
        assert_eq!(list.pending_seqs(), vec![5]);
    }

    #[test]
    fn test_timeout_removes_entry() {
        let list = WaitList::new(None);
        let slots = armed(&list, &[0, 1]);
        assert!(list.wait(slots[0], Duration::from_millis(10)).is_none());
        assert_eq!(list.pending_seqs(), vec![1]);

        // the late answer for 0 must not disturb 1
        assert_eq!(list.consume(&KciResponseElement::new(0, 0, 0)), 0);
        assert_eq!(list.consume(&KciResponseElement::new(1, 0, 0)), 1);
        assert!(list.wait(slots[1], Duration::ZERO).is_some());
    }

    #[test]
    fn test_table_grows_without_limit() {
        let list = WaitList::new(None);
        let slots = armed(&list, &(0..100).collect::<Vec<_>>());
        assert_eq!(list.pending(), 100);
        assert_eq!(list.consume(&KciResponseElement::new(99, 0, 0)), 100);
        for slot in slots {
            assert!(list.wait(slot, Duration::ZERO).is_some());
        }
        // freed slots are reused before the table grows again
        let _slot = list.reserve(Duration::ZERO).unwrap();
        assert_eq!(lock(&list.inner).slots.len(), 100);
    }

    #[test]
    fn test_slot_limit_times_out() {
        let list = WaitList::new(Some(1));
        let slot = list.reserve(Duration::ZERO).unwrap();
        let start = Instant::now();
        assert!(matches!(
            list.reserve(Duration::from_millis(20)),
            Err(KciError::Timeout {
                phase: TimeoutPhase::Enqueue,
                waited_ms: 20
            })
        ));
        assert!(start.elapsed() >= Duration::from_millis(20));
        list.release(slot);
        assert!(list.reserve(Duration::ZERO).is_ok());
    }

    #[test]
    fn test_slot_limit_waits_for_free_slot() {
        let list = Arc::new(WaitList::new(Some(1)));
        let first = armed(&list, &[0])[0];
        let second = {
            let list = Arc::clone(&list);
            thread::spawn(move || list.reserve(Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(10));
        list.consume(&KciResponseElement::new(0, 0, 0));
        list.wake_all();
        assert!(list.wait(first, Duration::ZERO).is_some());
        assert!(second.join().unwrap().is_ok());
    }

    #[test]
    fn test_cancel_all_wakes_waiter() {
        let list = Arc::new(WaitList::new(None));
        let slot = armed(&list, &[9])[0];
        let waiter = {
            let list = Arc::clone(&list);
            thread::spawn(move || list.wait(slot, Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(10));
        assert_eq!(list.cancel_all(), 1);
        let resp = waiter.join().unwrap().unwrap();
        assert_eq!(resp.status(), ResponseStatus::Cancelled);
        assert_eq!(resp.seq, 9);
    }
}
