// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Worker identities.
//!
//! Every OS thread that touches the runtime is assigned a process-unique
//! integer id on first use. Lock bookkeeping and the waits-for graph operate
//! on these ids instead of [`std::thread::ThreadId`], so cycle search stays a
//! plain traversal over integers.
//!
//! A [`Worker`] handle also carries the thread's interrupt flag. The flag can
//! be raised from any other thread; the `_interruptible` lock variants observe
//! it and fail with [`crate::TxError::Interrupted`], while the plain blocking
//! variants leave it raised for the caller to inspect.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_WORKER: Worker = Worker::register();
}

/// A cloneable handle onto one worker thread: its id and interrupt flag.
#[derive(Clone)]
pub struct Worker {
    id: u64,
    interrupted: Arc<AtomicBool>,
}

impl Worker {
    fn register() -> Self {
        Self {
            id: NEXT_WORKER_ID.fetch_add(1, Ordering::SeqCst),
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns the handle of the calling thread.
    pub fn current() -> Worker {
        CURRENT_WORKER.with(|w| w.clone())
    }

    /// The process-unique id of this worker.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Raises the interrupt flag. The target observes it at its next
    /// interruptible suspension point.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    /// Returns whether the flag is raised, without clearing it.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Clears the flag and returns whether it was raised.
    pub(crate) fn take_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Worker({})", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::Worker;

    #[test]
    fn test_worker_id_is_stable_per_thread() {
        let a = Worker::current();
        let b = Worker::current();
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_worker_ids_are_unique_across_threads() {
        let here = Worker::current().id();
        let there = std::thread::spawn(|| Worker::current().id())
            .join()
            .expect("Failed to join worker thread");
        assert_ne!(here, there);
    }

    #[test]
    fn test_interrupt_flag_round_trip() {
        let w = Worker::current();
        assert!(!w.is_interrupted());

        w.interrupt();
        assert!(w.is_interrupted());
        assert!(w.take_interrupt());
        assert!(!w.is_interrupted());
    }
}
