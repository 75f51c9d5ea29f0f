// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! One-shot futures.
//!
//! Commute results and deferred asynchronous mutations are promised values:
//! the transaction keeps the [`TxPromise`] in its working set and hands the
//! [`TxFuture`] to the caller. A promise settles exactly once, on commit
//! (fulfilled), on rollback (cancelled) or on a commit-time validation
//! failure (failed). The settled outcome lives in an [`AtomSetOnce`] cell, so
//! the first writer wins and late settlement attempts are no-ops.

use std::{
    any::Any,
    sync::{atomic::Ordering, Arc, Condvar, Mutex},
};

// leading `::` keeps the dependency apart from this crate's `atom` module
use ::atom::AtomSetOnce;

use crate::errors::{Result, TxError};

/// Terminal state of a one-shot future.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Fulfilled(T),
    Cancelled,
    Failed(TxError),
}

struct Shared<T> {
    cell: AtomSetOnce<Box<Outcome<T>>>,
    settled: Mutex<bool>,
    cv: Condvar,
}

/// The consumer half: query or block for the outcome.
pub struct TxFuture<T> {
    shared: Arc<Shared<T>>,
}

/// The producer half, held by the transaction runtime.
pub struct TxPromise<T> {
    shared: Arc<Shared<T>>,
}

/// Creates a connected promise/future pair.
pub fn pair<T>() -> (TxPromise<T>, TxFuture<T>) {
    let shared = Arc::new(Shared {
        cell: AtomSetOnce::empty(),
        settled: Mutex::new(false),
        cv: Condvar::new(),
    });
    (
        TxPromise {
            shared: shared.clone(),
        },
        TxFuture { shared },
    )
}

/// Creates a future that is already fulfilled with `value`.
pub fn ready<T>(value: T) -> TxFuture<T> {
    let (promise, future) = pair();
    promise.fulfill(value);
    future
}

impl<T> Shared<T> {
    fn settle(&self, outcome: Outcome<T>) -> bool {
        // first writer wins; losers get their box back and drop it
        if self.cell.set_if_none(Box::new(outcome), Ordering::SeqCst).is_some() {
            return false;
        }
        let mut settled = self.settled.lock().expect("future state poisoned");
        *settled = true;
        self.cv.notify_all();
        true
    }

    fn outcome(&self) -> Option<&Outcome<T>> {
        self.cell.get(Ordering::SeqCst)
    }
}

impl<T> TxPromise<T> {
    pub fn fulfill(&self, value: T) -> bool {
        self.shared.settle(Outcome::Fulfilled(value))
    }

    pub fn cancel(&self) -> bool {
        self.shared.settle(Outcome::Cancelled)
    }

    pub fn fail(&self, err: TxError) -> bool {
        self.shared.settle(Outcome::Failed(err))
    }
}

impl<T> Clone for TxPromise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Clone for TxFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> TxFuture<T> {
    /// Returns the outcome if the future has settled.
    pub fn peek(&self) -> Option<&Outcome<T>> {
        self.shared.outcome()
    }

    pub fn is_settled(&self) -> bool {
        self.peek().is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.peek(), Some(Outcome::Cancelled))
    }
}

impl<T: Clone> TxFuture<T> {
    /// Blocks until the future settles.
    pub fn wait(&self) -> Result<T> {
        let mut settled = self.shared.settled.lock().expect("future state poisoned");
        while !*settled {
            settled = self
                .shared
                .cv
                .wait(settled)
                .expect("future state poisoned");
        }
        drop(settled);

        match self.shared.outcome().expect("settled future has an outcome") {
            Outcome::Fulfilled(v) => Ok(v.clone()),
            Outcome::Cancelled => Err(TxError::Cancelled),
            Outcome::Failed(e) => Err(e.clone()),
        }
    }

    /// Returns the value without blocking, if fulfilled.
    pub fn try_value(&self) -> Option<T> {
        match self.peek() {
            Some(Outcome::Fulfilled(v)) => Some(v.clone()),
            _ => None,
        }
    }
}

/// Type-erased view of a promise, used by the savepoint machinery where
/// promises of different value types share one queue.
pub(crate) trait ErasedPromise: Send + Sync {
    fn fulfill_boxed(&self, value: Box<dyn Any + Send>);
    fn cancel(&self);
    fn fail(&self, err: TxError);
}

impl<T: Send + Sync + 'static> ErasedPromise for TxPromise<T> {
    fn fulfill_boxed(&self, value: Box<dyn Any + Send>) {
        match value.downcast::<T>() {
            Ok(v) => {
                self.fulfill(*v);
            }
            Err(_) => {
                self.fail(TxError::InternalConsistency(
                    "commute result of unexpected type".into(),
                ));
            }
        }
    }

    fn cancel(&self) {
        TxPromise::cancel(self);
    }

    fn fail(&self, err: TxError) {
        TxPromise::fail(self, err);
    }
}

/// Rendezvous between a committing transaction and readers that requested a
/// version past an atom's chain head.
///
/// The commit version is published as soon as it is allocated; the gate opens
/// once every dirty atom carries its new head. A reader first learns the
/// version: if its own read version is older than the commit, the in-flight
/// commit cannot concern it and it proceeds without waiting for the gate.
pub(crate) struct CommitAnnouncement {
    state: Mutex<AnnounceState>,
    cv: Condvar,
}

struct AnnounceState {
    version: Option<u64>,
    open: bool,
}

/// What a waiting reader learned from an announcement.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Announced {
    /// The commit version is newer than the requested version; the current
    /// chain head already satisfies the read.
    Newer,
    /// The gate opened; re-read the chain head.
    Opened,
}

impl CommitAnnouncement {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(AnnounceState {
                version: None,
                open: false,
            }),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn publish_version(&self, version: u64) {
        let mut state = self.state.lock().expect("announcement poisoned");
        state.version = Some(version);
        self.cv.notify_all();
    }

    pub(crate) fn open_gate(&self) {
        let mut state = self.state.lock().expect("announcement poisoned");
        state.open = true;
        self.cv.notify_all();
    }

    pub(crate) fn await_commit(&self, wanted: u64) -> Announced {
        let mut state = self.state.lock().expect("announcement poisoned");
        loop {
            if state.open {
                return Announced::Opened;
            }
            if let Some(w) = state.version {
                if wanted < w {
                    return Announced::Newer;
                }
            }
            state = self.cv.wait(state).expect("announcement poisoned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fulfilled_future_yields_value() {
        let (promise, future) = pair::<usize>();
        assert!(!future.is_settled());

        assert!(promise.fulfill(42));
        assert_eq!(future.wait(), Ok(42));
        assert_eq!(future.try_value(), Some(42));
    }

    #[test]
    fn test_first_settlement_wins() {
        let (promise, future) = pair::<usize>();
        assert!(promise.cancel());
        assert!(!promise.fulfill(7));

        assert!(future.is_cancelled());
        assert_eq!(future.wait(), Err(TxError::Cancelled));
    }

    #[test]
    fn test_wait_blocks_until_settled() {
        let (promise, future) = pair::<String>();

        let waiter = std::thread::spawn(move || future.wait());
        std::thread::sleep(std::time::Duration::from_millis(20));
        promise.fulfill("done".to_string());

        let got = waiter.join().expect("Failed to join waiter thread");
        assert_eq!(got, Ok("done".to_string()));
    }

    #[test]
    fn test_announcement_releases_reader_on_newer_version() {
        let ann = CommitAnnouncement::new();
        ann.publish_version(10);

        // a reader at version 5 does not care about a commit at 10
        assert_eq!(ann.await_commit(5), Announced::Newer);
    }

    #[test]
    fn test_announcement_gate_wakes_waiters() {
        let ann = std::sync::Arc::new(CommitAnnouncement::new());
        ann.publish_version(3);

        let a = ann.clone();
        let waiter = std::thread::spawn(move || a.await_commit(8));
        std::thread::sleep(std::time::Duration::from_millis(20));
        ann.open_gate();

        assert_eq!(
            waiter.join().expect("Failed to join waiter thread"),
            Announced::Opened
        );
    }
}
