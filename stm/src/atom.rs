// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Transactional atoms
//!
//! A [`TxAtom`] is an observable mutable cell backed by a version chain and a
//! hierarchical lock node. Outside a transaction every mutation is applied
//! immediately under the atom's exclusive lock; inside one, reads and writes
//! are routed through the worker's transaction so they commit or roll back as
//! a unit.
//!
//! Watchers are callbacks `fn(&TxAtom<T>, old, new)` registered with set
//! semantics; they observe one notification per committed write, carrying the
//! net change. A validator vets every value before it becomes visible.

use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use log::warn;

use crate::{
    chain::Chain,
    errors::{Result, TxError},
    lock::HierLock,
    promise::{self, Announced, CommitAnnouncement, TxFuture},
    transaction,
    version,
};

static NEXT_ATOM_ID: AtomicU64 = AtomicU64::new(1);

/// Predicate every new value must satisfy.
pub type Validator<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Observer of committed writes.
pub type Watcher<T> = Arc<dyn Fn(&TxAtom<T>, &T, &T) + Send + Sync>;

struct AtomInner<T> {
    id: u64,
    lock: HierLock,
    chain: Chain<T>,
    validator: Option<Validator<T>>,
    watchers: Mutex<Vec<Watcher<T>>>,
    mark: Mutex<Option<Arc<CommitAnnouncement>>>,
}

/// A thread-safe, observable, transactional reference cell.
pub struct TxAtom<T> {
    inner: Arc<AtomInner<T>>,
}

impl<T> Clone for TxAtom<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> TxAtom<T> {
    /// Creates an atom rooting a new (unfair) lock tree.
    pub fn new(value: T) -> Self {
        Self::build(value, None, HierLock::new())
    }

    /// Creates an atom whose writes must satisfy `validator`.
    pub fn with_validator(value: T, validator: Validator<T>) -> Self {
        Self::build(value, Some(validator), HierLock::new())
    }

    /// Creates an atom rooting a lock tree with strictly FIFO queues.
    pub fn new_fair(value: T, validator: Option<Validator<T>>) -> Self {
        Self::build(value, validator, HierLock::new_fair())
    }

    /// Creates an atom whose lock node is a child of this atom's. Writes to
    /// either then conflict through the shared tree.
    pub fn new_child<U: Clone + Send + Sync + 'static>(
        &self,
        value: U,
        validator: Option<Validator<U>>,
    ) -> TxAtom<U> {
        TxAtom::build(value, validator, self.inner.lock.new_child())
    }

    fn build(value: T, validator: Option<Validator<T>>, lock: HierLock) -> Self {
        Self {
            inner: Arc::new(AtomInner {
                id: NEXT_ATOM_ID.fetch_add(1, Ordering::SeqCst),
                lock,
                chain: Chain::new(value, version::current_version()),
                validator,
                watchers: Mutex::new(Vec::new()),
                mark: Mutex::new(None),
            }),
        }
    }

    /// Process-unique id of this atom.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Current value: the chain head outside a transaction, the transaction's
    /// view (working set, then snapshot) inside one.
    pub fn get(&self) -> Result<T> {
        if transaction::is_active() {
            transaction::read_atom(self)
        } else {
            Ok(self.inner.chain.latest())
        }
    }

    /// Replaces the value, returning the previous one.
    pub fn set(&self, value: T) -> Result<T> {
        if transaction::is_active() {
            transaction::write_atom(self, value)
        } else {
            self.write_direct(|_| value.clone()).map(|(old, _)| old)
        }
    }

    /// Applies `f` to the current value, returning the new one.
    pub fn update<F: Fn(&T) -> T>(&self, f: F) -> Result<T> {
        if transaction::is_active() {
            let current = transaction::read_atom(self)?;
            let value = f(&current);
            transaction::write_atom(self, value.clone())?;
            Ok(value)
        } else {
            self.write_direct(f).map(|(_, new)| new)
        }
    }

    /// Applies `f` to the current value, returning the previous one.
    pub fn get_and_update<F: Fn(&T) -> T>(&self, f: F) -> Result<T> {
        if transaction::is_active() {
            let current = transaction::read_atom(self)?;
            transaction::write_atom(self, f(&current))?;
            Ok(current)
        } else {
            self.write_direct(f).map(|(old, _)| old)
        }
    }

    /// Enqueues a commutative update. Inside a transaction `f` runs at commit
    /// time; the returned future fulfills with the value right after `f` was
    /// applied, or cancels if the transaction rolls back. Outside one the
    /// update is applied immediately and the future is already fulfilled.
    pub fn commute<F>(&self, f: F) -> Result<TxFuture<T>>
    where
        F: Fn(&T) -> T + Send + Sync + 'static,
    {
        if transaction::is_active() {
            transaction::commute_atom(self, Arc::new(f))
        } else {
            let (_, new) = self.write_direct(f)?;
            Ok(promise::ready(new))
        }
    }

    /// Protects this atom from concurrent modification for the rest of the
    /// transaction without writing to it. Only valid inside a transaction.
    pub fn pin(&self) -> Result<T> {
        if transaction::is_active() {
            transaction::pin_atom(self)
        } else {
            Err(TxError::NoTransaction)
        }
    }

    /// Registers a watcher. Registering the same handle twice is a no-op;
    /// returns whether the set changed.
    pub fn add_watcher(&self, watcher: Watcher<T>) -> bool {
        let mut watchers = self.inner.watchers.lock().expect("watcher set poisoned");
        if watchers.iter().any(|w| Arc::ptr_eq(w, &watcher)) {
            return false;
        }
        watchers.push(watcher);
        true
    }

    /// Removes a previously registered watcher; returns whether it was known.
    pub fn remove_watcher(&self, watcher: &Watcher<T>) -> bool {
        let mut watchers = self.inner.watchers.lock().expect("watcher set poisoned");
        match watchers.iter().position(|w| Arc::ptr_eq(w, watcher)) {
            Some(i) => {
                watchers.remove(i);
                true
            }
            None => false,
        }
    }

    /// Runs the validator against `value`.
    pub fn validate(&self, value: &T) -> Result<()> {
        match &self.inner.validator {
            Some(v) if !v(value) => Err(TxError::Validation),
            _ => Ok(()),
        }
    }

    pub(crate) fn lock(&self) -> &HierLock {
        &self.inner.lock
    }

    pub(crate) fn latest(&self) -> T {
        self.inner.chain.latest()
    }

    pub(crate) fn latest_version(&self) -> u64 {
        self.inner.chain.latest_version()
    }

    /// Snapshot read at `v`, waiting out an in-flight commit whose version
    /// could still land at or below `v`.
    pub(crate) fn read_at(&self, v: u64) -> Result<T> {
        loop {
            if v <= self.inner.chain.latest_version() {
                return self.inner.chain.read_at(v);
            }
            let mark = self
                .inner
                .mark
                .lock()
                .expect("commit mark poisoned")
                .clone();
            match mark {
                None => return self.inner.chain.read_at(v),
                Some(ann) => match ann.await_commit(v) {
                    // the in-flight commit is newer than the requested
                    // version; the present head already answers the read
                    Announced::Newer => return self.inner.chain.read_at(v),
                    Announced::Opened => continue,
                },
            }
        }
    }

    fn write_direct<F: FnOnce(&T) -> T>(&self, f: F) -> Result<(T, T)> {
        let mut handle = self.inner.lock.acquire_exclusive()?;

        let old = self.inner.chain.latest();
        let new = f(&old);
        self.validate(&new)?;

        let w = version::new_pinned_version();
        let oldest = version::oldest_pinned();
        self.inner.chain.append(new.clone(), w, oldest);
        version::unpin(w)?;

        handle.release()?;
        self.notify_watchers(&old, &new);
        Ok((old, new))
    }

    pub(crate) fn notify_watchers(&self, old: &T, new: &T) {
        let snapshot: Vec<Watcher<T>> = self
            .inner
            .watchers
            .lock()
            .expect("watcher set poisoned")
            .clone();
        for watcher in snapshot {
            // a panicking watcher must not poison the committing worker
            if catch_unwind(AssertUnwindSafe(|| watcher(self, old, new))).is_err() {
                warn!("atom({}): watcher panicked, notification dropped", self.id());
            }
        }
    }
}

/// The commit-time face of an atom, with the value type erased. The
/// transaction working set speaks this vocabulary only; everything typed
/// happens behind it.
pub(crate) trait ErasedAtom: Send + Sync {
    fn id(&self) -> u64;
    fn lock(&self) -> &HierLock;
    fn latest_version(&self) -> u64;
    fn latest_boxed(&self) -> Box<dyn Any + Send>;
    fn read_at_boxed(&self, v: u64) -> Result<Box<dyn Any + Send>>;
    fn validate_boxed(&self, value: &dyn Any) -> Result<()>;
    fn mark_for_commit(&self, ann: Arc<CommitAnnouncement>) -> Result<()>;
    fn unmark(&self);
    /// Appends the pending value at `commit_version`, collecting history up
    /// to `oldest_pinned`, and returns the `(old, new)` pair for watchers.
    fn publish(
        &self,
        pending: &dyn Any,
        commit_version: u64,
        oldest_pinned: u64,
    ) -> Result<(Box<dyn Any + Send>, Box<dyn Any + Send>)>;
    fn notify_boxed(&self, old: &dyn Any, new: &dyn Any);
}

impl<T: Clone + Send + Sync + 'static> ErasedAtom for TxAtom<T> {
    fn id(&self) -> u64 {
        self.inner.id
    }

    fn lock(&self) -> &HierLock {
        &self.inner.lock
    }

    fn latest_version(&self) -> u64 {
        self.inner.chain.latest_version()
    }

    fn latest_boxed(&self) -> Box<dyn Any + Send> {
        Box::new(self.inner.chain.latest())
    }

    fn read_at_boxed(&self, v: u64) -> Result<Box<dyn Any + Send>> {
        self.read_at(v).map(|value| Box::new(value) as Box<dyn Any + Send>)
    }

    fn validate_boxed(&self, value: &dyn Any) -> Result<()> {
        let value = value
            .downcast_ref::<T>()
            .ok_or_else(|| TxError::InternalConsistency("pending value of unexpected type".into()))?;
        self.validate(value)
    }

    fn mark_for_commit(&self, ann: Arc<CommitAnnouncement>) -> Result<()> {
        let mut mark = self.inner.mark.lock().expect("commit mark poisoned");
        if mark.is_some() {
            return Err(TxError::InternalConsistency(format!(
                "atom {} is already marked by an in-flight commit",
                self.inner.id
            )));
        }
        *mark = Some(ann);
        Ok(())
    }

    fn unmark(&self) {
        self.inner
            .mark
            .lock()
            .expect("commit mark poisoned")
            .take();
    }

    fn publish(
        &self,
        pending: &dyn Any,
        commit_version: u64,
        oldest_pinned: u64,
    ) -> Result<(Box<dyn Any + Send>, Box<dyn Any + Send>)> {
        let new = pending
            .downcast_ref::<T>()
            .ok_or_else(|| TxError::InternalConsistency("pending value of unexpected type".into()))?
            .clone();
        let old = self.inner.chain.latest();
        self.inner.chain.append(new.clone(), commit_version, oldest_pinned);
        Ok((Box::new(old), Box::new(new)))
    }

    fn notify_boxed(&self, old: &dyn Any, new: &dyn Any) {
        if let (Some(old), Some(new)) = (old.downcast_ref::<T>(), new.downcast_ref::<T>()) {
            self.notify_watchers(old, new);
        }
    }
}

impl<T> std::fmt::Debug for TxAtom<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TxAtom({})", self.inner.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_direct_set_and_get() {
        let atom = TxAtom::new(1usize);
        assert_eq!(atom.get(), Ok(1));
        assert_eq!(atom.set(5), Ok(1));
        assert_eq!(atom.get(), Ok(5));
        assert_eq!(atom.update(|v| v + 1), Ok(6));
        assert_eq!(atom.get_and_update(|v| v * 2), Ok(6));
        assert_eq!(atom.get(), Ok(12));
    }

    #[test]
    fn test_validator_rejects_direct_write() {
        let atom = TxAtom::with_validator(2usize, Arc::new(|v: &usize| *v % 2 == 0));
        assert_eq!(atom.set(3), Err(TxError::Validation));
        assert_eq!(atom.get(), Ok(2), "rejected write must not land");
        assert_eq!(atom.set(4), Ok(2));
    }

    #[test]
    fn test_validator_failure_releases_the_lock() {
        let atom = TxAtom::with_validator(0usize, Arc::new(|v: &usize| *v < 10));
        assert_eq!(atom.set(10), Err(TxError::Validation));
        // a poisoned exclusive lock would wedge this second write
        assert_eq!(atom.set(3), Ok(0));
    }

    #[test]
    fn test_watcher_set_semantics() {
        let atom = TxAtom::new(0usize);
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let watcher: Watcher<usize> = Arc::new(move |_, _, _| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert!(atom.add_watcher(watcher.clone()));
        assert!(!atom.add_watcher(watcher.clone()), "duplicate is a no-op");

        atom.set(1).expect("set");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(atom.remove_watcher(&watcher));
        assert!(!atom.remove_watcher(&watcher));
        atom.set(2).expect("set");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_watcher_sees_old_and_new() {
        let atom = TxAtom::new(10usize);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        atom.add_watcher(Arc::new(move |_, old: &usize, new: &usize| {
            s.lock().expect("seen").push((*old, *new));
        }));

        atom.set(11).expect("set");
        atom.update(|v| v + 9).expect("update");
        assert_eq!(*seen.lock().expect("seen"), vec![(10, 11), (11, 20)]);
    }

    #[test]
    fn test_watcher_panic_is_swallowed() {
        let atom = TxAtom::new(0usize);
        atom.add_watcher(Arc::new(|_, _, _| panic!("misbehaving watcher")));
        assert_eq!(atom.set(1), Ok(0));
        assert_eq!(atom.get(), Ok(1));
    }

    #[test]
    fn test_commute_outside_transaction_applies_immediately() {
        let atom = TxAtom::new(10usize);
        let future = atom.commute(|v| v * 2).expect("commute");
        assert_eq!(future.try_value(), Some(20));
        assert_eq!(atom.get(), Ok(20));
    }

    #[test]
    fn test_pin_outside_transaction_errors() {
        let atom = TxAtom::new(0usize);
        assert_eq!(atom.pin(), Err(TxError::NoTransaction));
    }

    #[test]
    fn test_child_atom_shares_lock_tree() {
        let parent = TxAtom::new(0usize);
        let child: TxAtom<String> = parent.new_child(String::new(), None);

        let _held = child.lock().acquire_exclusive().expect("child exclusive");
        let p = parent.clone();
        let blocked = std::thread::spawn(move || p.lock().try_acquire_exclusive().is_none())
            .join()
            .expect("Failed to join");
        assert!(blocked, "parent write must conflict with the held child");
    }
}
