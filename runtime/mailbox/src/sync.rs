//! Lock helpers and the doorbell event
//!
//! State behind the mailbox locks is plain data that is consistent at every
//! unlock point, so a poisoned lock is recovered rather than propagated.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Instant;

/// Lock `mutex`, recovering from poisoning
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Try to lock `mutex` without blocking
///
/// Returns `None` only if another thread holds the lock.
pub fn try_lock<T>(mutex: &Mutex<T>) -> Option<MutexGuard<'_, T>> {
    match mutex.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    }
}

/// Wait on `cond` until `deadline`
///
/// Returns the guard and whether the deadline has passed.
pub fn wait_until<'a, T>(
    cond: &Condvar,
    guard: MutexGuard<'a, T>,
    deadline: Instant,
) -> (MutexGuard<'a, T>, bool) {
    let now = Instant::now();
    if now >= deadline {
        return (guard, true);
    }
    let (guard, result) = cond
        .wait_timeout(guard, deadline - now)
        .unwrap_or_else(PoisonError::into_inner);
    (guard, result.timed_out() && Instant::now() >= deadline)
}

/// Response doorbell event
///
/// Every interrupt bumps a generation counter. A waiter snapshots the
/// generation before checking its condition and then sleeps until the
/// generation moves, so an interrupt between the check and the sleep is
/// never lost.
#[derive(Debug, Default)]
pub struct Doorbell {
    generation: Mutex<u64>,
    rung: Condvar,
}

impl Doorbell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        *lock(&self.generation)
    }

    /// Record one doorbell and wake every waiter
    pub fn ring(&self) {
        let mut generation = lock(&self.generation);
        *generation = generation.wrapping_add(1);
        drop(generation);
        self.rung.notify_all();
    }

    /// Sleep until the generation differs from `seen` or `deadline` passes
    ///
    /// Returns `false` on timeout.
    pub fn wait_past(&self, seen: u64, deadline: Instant) -> bool {
        let mut generation = lock(&self.generation);
        while *generation == seen {
            let (guard, timed_out) = wait_until(&self.rung, generation, deadline);
            generation = guard;
            if timed_out {
                return *generation != seen;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_wait_past_times_out_without_ring() {
        let bell = Doorbell::new();
        let seen = bell.generation();
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(!bell.wait_past(seen, deadline));
        assert!(Instant::now() >= deadline);
    }

    #[test]
    fn test_ring_before_wait_is_not_lost() {
        let bell = Doorbell::new();
        let seen = bell.generation();
        bell.ring();
        assert!(bell.wait_past(seen, Instant::now()));
    }

    #[test]
    fn test_ring_wakes_waiter() {
        let bell = Arc::new(Doorbell::new());
        let seen = bell.generation();
        let ringer = {
            let bell = Arc::clone(&bell);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                bell.ring();
            })
        };
        assert!(bell.wait_past(seen, Instant::now() + Duration::from_secs(5)));
        ringer.join().unwrap();
    }

    #[test]
    fn test_try_lock_reports_contention() {
        let mutex = Mutex::new(0u32);
        let held = lock(&mutex);
        assert!(try_lock(&mutex).is_none());
        drop(held);
        assert!(try_lock(&mutex).is_some());
    }
}
