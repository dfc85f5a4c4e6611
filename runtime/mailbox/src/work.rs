//! Deferred work
//!
//! A named worker thread that runs one job whenever it is scheduled.
//! Scheduling while a run is already pending is a no-op, so any number of
//! interrupts between two runs collapse into one run. Interrupt-side code
//! only ever calls [`DeferredWork::schedule`], which never blocks.

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender, TrySendError};

use crate::sync::lock;
use crate::{MailboxError, Result};

pub struct DeferredWork {
    name: String,
    trigger: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    cancelled: Arc<AtomicBool>,
}

impl DeferredWork {
    /// Start the worker thread
    ///
    /// `job` must not own the object that owns this `DeferredWork`, or the
    /// pair is never dropped; hand it a `Weak` instead.
    pub fn spawn<F>(name: &str, mut job: F) -> Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (tx, rx) = channel::bounded::<()>(1);
        let cancelled = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&cancelled);
        let worker = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                while rx.recv().is_ok() {
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    job();
                }
            })
            .map_err(MailboxError::WorkerSpawn)?;

        Ok(Self {
            name: name.to_owned(),
            trigger: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            cancelled,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue one run of the job
    ///
    /// Returns `false` if a run was already pending or the work has been
    /// cancelled.
    pub fn schedule(&self) -> bool {
        match lock(&self.trigger).as_ref().map(|tx| tx.try_send(())) {
            Some(Ok(())) => true,
            Some(Err(TrySendError::Full(()) | TrySendError::Disconnected(()))) | None => false,
        }
    }

    /// Drop any pending run and wait for a running one to finish
    ///
    /// Called from the worker's own job it only stops the worker.
    pub fn cancel_sync(&self) {
        self.cancelled.store(true, Ordering::Release);
        lock(&self.trigger).take();

        let Some(worker) = lock(&self.worker).take() else {
            return;
        };
        if worker.thread().id() == thread::current().id() {
            return;
        }
        if worker.join().is_err() {
            log::error!("{}: worker panicked", self.name);
        }
    }
}

impl Drop for DeferredWork {
    fn drop(&mut self) {
        self.cancel_sync();
    }
}

impl core::fmt::Debug for DeferredWork {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeferredWork")
            .field("name", &self.name)
            .field("cancelled", &self.cancelled.load(Ordering::Relaxed))
            .finish()
    }
}
