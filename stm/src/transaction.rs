// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # The transaction runtime
//!
//! One transaction runs per worker at a time, installed in thread-local
//! state; atoms reach it implicitly, so a computation reads and writes plain
//! [`crate::TxAtom`] handles and the runtime buffers everything until commit.
//!
//! [`Transaction::run`] drives the retry loop: execute the computation,
//! commit on success, roll back and rerun on recoverable isolation or
//! deadlock failures, roll back and propagate everything else. Commit is a
//! straight-line sequence in the committing worker: fold the queued commutes,
//! drop the read pin, announce, mark, publish the new chain heads under one
//! commit version, release locks, settle futures, submit deferred
//! asynchronous work, open the gate, notify watchers.

use std::{
    any::Any,
    cell::RefCell,
    collections::HashMap,
    sync::Arc,
};

use log::debug;

use crate::{
    atom::{ErasedAtom, TxAtom},
    breaker::BusyBreaker,
    errors::{Result, TxError},
    lock::LockHandle,
    promise::{self, CommitAnnouncement, ErasedPromise, TxFuture},
    savepoint::{AsyncAction, AtomEntry, CommutePending, LockState, Savepoint, SavepointHandle},
    version,
    worker::Worker,
};

/// Read/pin/lock policy of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Reads observe the current chain head; nothing is pinned.
    ReadCommitted,
    /// The first read pins a snapshot version all further reads use.
    RepeatableRead,
    /// Like repeatable read, but reads also take shared locks, which rules
    /// out write skew.
    Serializable,
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::RepeatableRead
    }
}

/// Retry budgets and isolation level consumed by [`Transaction::run`].
#[derive(Debug, Clone, Copy)]
pub struct TxConfig {
    pub isolation: IsolationLevel,
    pub max_isolation_failures: usize,
    pub max_deadlock_failures: usize,
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::default(),
            max_isolation_failures: 1000,
            max_deadlock_failures: 10,
        }
    }
}

impl TxConfig {
    pub fn with_isolation(isolation: IsolationLevel) -> Self {
        Self {
            isolation,
            ..Self::default()
        }
    }

    /// Budgets of one: any recoverable failure surfaces instead of rerunning
    /// the computation.
    pub fn non_idempotent(isolation: IsolationLevel) -> Self {
        Self {
            isolation,
            max_isolation_failures: 1,
            max_deadlock_failures: 1,
        }
    }
}

struct TxState {
    isolation: IsolationLevel,
    read_version: Option<u64>,
    savepoints: Vec<Savepoint>,
    locks: HashMap<u64, LockHandle>,
    staged_commutes: Vec<(Box<dyn ErasedPromise>, Box<dyn Any + Send>)>,
    announcement: Option<Arc<CommitAnnouncement>>,
    marked: Vec<Arc<dyn ErasedAtom>>,
    next_savepoint: u64,
}

thread_local! {
    static CURRENT: RefCell<Option<TxState>> = RefCell::new(None);
}

/// Everything commit still owes the world once the transaction state itself
/// is gone: futures to settle, tasks to submit, the gate, watcher calls.
struct CommitTail {
    staged: Vec<(Box<dyn ErasedPromise>, Box<dyn Any + Send>)>,
    async_actions: Vec<AsyncAction>,
    announcement: Arc<CommitAnnouncement>,
    notifications: Vec<(Arc<dyn ErasedAtom>, Box<dyn Any + Send>, Box<dyn Any + Send>)>,
}

/// Handle onto the worker's active transaction.
///
/// The handle carries no state of its own; it exists so computations have a
/// value to call [`savepoint`](Self::savepoint), [`rollback_to`](Self::rollback_to)
/// and [`rollback`](Self::rollback) on.
pub struct Transaction {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl Transaction {
    fn handle() -> Self {
        Self {
            _not_send: std::marker::PhantomData,
        }
    }

    /// Runs `f` transactionally under `config` and returns its result.
    ///
    /// Fails with [`TxError::NestedTransaction`] when the worker already runs
    /// a transaction.
    pub fn run<R, F>(config: TxConfig, mut f: F) -> Result<R>
    where
        F: FnMut(&Transaction) -> Result<R>,
    {
        let installed = CURRENT.with(|c| {
            let mut slot = c.borrow_mut();
            if slot.is_some() {
                return false;
            }
            *slot = Some(TxState::new(config.isolation));
            true
        });
        if !installed {
            return Err(TxError::NestedTransaction);
        }
        let _guard = UninstallGuard;

        let worker = Worker::current();
        let breaker = BusyBreaker::default();
        let mut isolation_failures = 0usize;
        let mut deadlock_failures = 0usize;
        let tx = Transaction::handle();

        loop {
            debug!("TX(worker {}): attempt begins", worker.id());
            let err = match f(&tx) {
                Ok(value) => match commit_prepare() {
                    Ok(tail) => {
                        CURRENT.with(|c| c.borrow_mut().take());
                        commit_finish(tail);
                        debug!("TX(worker {}): committed", worker.id());
                        return Ok(value);
                    }
                    Err(e) => e,
                },
                Err(e) => e,
            };

            rollback_current();
            match err {
                TxError::Isolation => {
                    isolation_failures += 1;
                    debug!(
                        "TX(worker {}): isolation failure #{}",
                        worker.id(),
                        isolation_failures
                    );
                    if isolation_failures >= config.max_isolation_failures {
                        return Err(TxError::Isolation);
                    }
                }
                TxError::Deadlock => {
                    deadlock_failures += 1;
                    debug!(
                        "TX(worker {}): deadlock failure #{}",
                        worker.id(),
                        deadlock_failures
                    );
                    if deadlock_failures >= config.max_deadlock_failures {
                        return Err(TxError::Deadlock);
                    }
                    breaker.spin();
                }
                e => return Err(e),
            }

            CURRENT.with(|c| {
                *c.borrow_mut() = Some(TxState::new(config.isolation));
            });
        }
    }

    /// Runs `f` with both retry budgets set to one.
    pub fn run_non_idempotent<R, F>(isolation: IsolationLevel, f: F) -> Result<R>
    where
        F: FnMut(&Transaction) -> Result<R>,
    {
        Self::run(TxConfig::non_idempotent(isolation), f)
    }

    /// A handle onto the worker's active transaction, if any.
    pub fn current() -> Option<Transaction> {
        if is_active() {
            Some(Transaction::handle())
        } else {
            None
        }
    }

    /// Whether the calling worker runs a transaction.
    pub fn is_active() -> bool {
        is_active()
    }

    pub fn isolation(&self) -> Result<IsolationLevel> {
        with_state(|tx| Ok(tx.isolation))
    }

    /// Inserts a new head savepoint and returns a handle onto the state it
    /// sealed, suitable for [`rollback_to`](Self::rollback_to).
    pub fn savepoint(&self) -> Result<SavepointHandle> {
        with_state(|tx| {
            let sealed = tx.savepoints.last().expect("savepoint chain is never empty").id;
            let id = tx.next_savepoint;
            tx.next_savepoint += 1;
            tx.savepoints.push(Savepoint::new(id));
            Ok(SavepointHandle(sealed))
        })
    }

    /// Discards every savepoint newer than `handle`: cancels their futures,
    /// reverts their lock transitions and re-exposes the sealed state.
    pub fn rollback_to(&self, handle: SavepointHandle) -> Result<()> {
        with_state(|tx| tx.rollback_to(handle))
    }

    /// Requests a rollback of the whole transaction; propagate the returned
    /// error out of the computation to trigger it.
    pub fn rollback(&self) -> TxError {
        TxError::Abort
    }
}

struct UninstallGuard;

impl Drop for UninstallGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| {
            if let Ok(mut slot) = c.try_borrow_mut() {
                if let Some(mut state) = slot.take() {
                    rollback_state(&mut state);
                }
            }
        });
    }
}

pub(crate) fn is_active() -> bool {
    CURRENT.with(|c| c.borrow().is_some())
}

fn with_state<R>(f: impl FnOnce(&mut TxState) -> Result<R>) -> Result<R> {
    CURRENT.with(|c| {
        let mut slot = c.borrow_mut();
        match slot.as_mut() {
            Some(state) => f(state),
            None => Err(TxError::NoTransaction),
        }
    })
}

/// Transactional read of `atom` on behalf of [`TxAtom::get`].
pub(crate) fn read_atom<T: Clone + Send + Sync + 'static>(atom: &TxAtom<T>) -> Result<T> {
    with_state(|tx| {
        if let Some(value) = tx.find_pending::<T>(atom.id()) {
            return Ok(value);
        }
        match tx.isolation {
            IsolationLevel::ReadCommitted => Ok(atom.latest()),
            IsolationLevel::RepeatableRead => {
                let v = tx.pin_read_version();
                atom.read_at(v)
            }
            IsolationLevel::Serializable => {
                let erased: Arc<dyn ErasedAtom> = Arc::new(atom.clone());
                tx.realize_lock(&erased, LockState::Shared)?;
                tx.version_check(atom.latest_version())?;
                let v = tx.pin_read_version();
                atom.read_at(v)
            }
        }
    })
}

/// Transactional write; returns the value the write replaced within this
/// transaction's view.
pub(crate) fn write_atom<T: Clone + Send + Sync + 'static>(atom: &TxAtom<T>, value: T) -> Result<T> {
    with_state(|tx| {
        atom.validate(&value)?;

        let erased: Arc<dyn ErasedAtom> = Arc::new(atom.clone());
        tx.realize_lock(&erased, LockState::Exclusive)?;
        tx.version_check(atom.latest_version())?;

        let previous = match tx.find_pending::<T>(atom.id()) {
            Some(p) => p,
            None => atom.latest(),
        };
        let entry = tx.ensure_entry(&erased);
        entry.pending = Some(Box::new(value));
        entry.dirty = true;
        Ok(previous)
    })
}

/// Queues a commutative update; the returned future settles at commit.
pub(crate) fn commute_atom<T: Clone + Send + Sync + 'static>(
    atom: &TxAtom<T>,
    f: Arc<dyn Fn(&T) -> T + Send + Sync>,
) -> Result<TxFuture<T>> {
    with_state(|tx| {
        let erased: Arc<dyn ErasedAtom> = Arc::new(atom.clone());
        if tx.isolation == IsolationLevel::Serializable {
            tx.realize_lock(&erased, LockState::Exclusive)?;
            tx.version_check(atom.latest_version())?;
        }

        let (promise, future) = promise::pair::<T>();
        let apply = Box::new(move |value: &dyn Any| {
            let typed = value
                .downcast_ref::<T>()
                .expect("commute folds over the atom value type");
            let next = f(typed);
            (
                Box::new(next.clone()) as Box<dyn Any + Send>,
                Box::new(next) as Box<dyn Any + Send>,
            )
        });

        let entry = tx.ensure_entry(&erased);
        entry.commutes.push_back(CommutePending {
            apply,
            promise: Box::new(promise),
        });
        Ok(future)
    })
}

/// Shared-locks `atom` for the rest of the transaction and returns its value;
/// backs [`TxAtom::pin`].
pub(crate) fn pin_atom<T: Clone + Send + Sync + 'static>(atom: &TxAtom<T>) -> Result<T> {
    with_state(|tx| {
        let erased: Arc<dyn ErasedAtom> = Arc::new(atom.clone());
        tx.realize_lock(&erased, LockState::Shared)?;
        tx.version_check(atom.latest_version())?;

        if let Some(value) = tx.find_pending::<T>(atom.id()) {
            return Ok(value);
        }
        match tx.isolation {
            IsolationLevel::ReadCommitted => Ok(atom.latest()),
            _ => {
                let v = tx.pin_read_version();
                atom.read_at(v)
            }
        }
    })
}

/// Buffers a deferred asynchronous mutation on the active savepoint.
pub(crate) fn enqueue_async(action: AsyncAction) -> Result<()> {
    with_state(|tx| {
        tx.savepoints
            .last_mut()
            .expect("savepoint chain is never empty")
            .async_actions
            .push_back(action);
        Ok(())
    })
}

impl TxState {
    fn new(isolation: IsolationLevel) -> Self {
        Self {
            isolation,
            read_version: None,
            savepoints: vec![Savepoint::new(0)],
            locks: HashMap::new(),
            staged_commutes: Vec::new(),
            announcement: None,
            marked: Vec::new(),
            next_savepoint: 1,
        }
    }

    fn pin_read_version(&mut self) -> u64 {
        match self.read_version {
            Some(v) => v,
            None => {
                let v = version::new_pinned_version();
                self.read_version = Some(v);
                v
            }
        }
    }

    fn version_check(&self, atom_version: u64) -> Result<()> {
        match self.read_version {
            Some(v) if atom_version > v => Err(TxError::Isolation),
            _ => Ok(()),
        }
    }

    fn find_pending<T: Clone + 'static>(&self, atom_id: u64) -> Option<T> {
        for sp in self.savepoints.iter().rev() {
            if let Some(entry) = sp.entries.get(&atom_id) {
                if let Some(pending) = &entry.pending {
                    return pending.downcast_ref::<T>().cloned();
                }
            }
        }
        None
    }

    fn current_lock_state(&self, atom_id: u64) -> LockState {
        for sp in self.savepoints.iter().rev() {
            if let Some(entry) = sp.entries.get(&atom_id) {
                return entry.lock_state;
            }
        }
        LockState::None
    }

    fn ensure_entry(&mut self, atom: &Arc<dyn ErasedAtom>) -> &mut AtomEntry {
        let inherited = self.current_lock_state(atom.id());
        self.savepoints
            .last_mut()
            .expect("savepoint chain is never empty")
            .entry_mut(atom.clone(), inherited)
    }

    /// Brings the transaction's hold on `atom` up to `desired`, acquiring or
    /// promoting against the hierarchical lock as needed. The entry's lock
    /// state is the sole record later used to synthesize the inverse
    /// transitions.
    fn realize_lock(&mut self, atom: &Arc<dyn ErasedAtom>, desired: LockState) -> Result<()> {
        let id = atom.id();
        let current = self.current_lock_state(id);
        if current >= desired {
            self.ensure_entry(atom);
            return Ok(());
        }

        match (current, desired) {
            (LockState::None, LockState::Shared) => {
                let handle = atom.lock().acquire_shared()?;
                self.locks.insert(id, handle);
            }
            (LockState::None, LockState::Exclusive) => {
                let handle = atom.lock().acquire_exclusive()?;
                self.locks.insert(id, handle);
            }
            (LockState::Shared, LockState::Exclusive) => {
                let handle = self.locks.get_mut(&id).ok_or_else(|| {
                    TxError::InternalConsistency("no handle for a held lock state".into())
                })?;
                if let Err(e) = handle.promote_to_exclusive() {
                    // the shared token was surrendered and the exclusive race
                    // lost; the entry must reflect that nothing is held
                    self.locks.remove(&id);
                    let entry = self.ensure_entry(atom);
                    entry.lock_state = LockState::None;
                    return Err(e);
                }
            }
            _ => {}
        }

        let entry = self.ensure_entry(atom);
        entry.lock_state = desired;
        Ok(())
    }

    fn revert_lock(&mut self, atom_id: u64, current: LockState, previous: LockState) -> Result<()> {
        if current <= previous {
            return Ok(());
        }
        match (current, previous) {
            (LockState::Exclusive, LockState::Shared) => match self.locks.get_mut(&atom_id) {
                Some(handle) => handle.demote_to_shared(),
                None => Err(TxError::InternalConsistency(
                    "no handle for a held lock state".into(),
                )),
            },
            (_, LockState::None) => {
                if let Some(mut handle) = self.locks.remove(&atom_id) {
                    handle.release()?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn rollback_to(&mut self, handle: SavepointHandle) -> Result<()> {
        let pos = self
            .savepoints
            .iter()
            .position(|sp| sp.id == handle.0)
            .ok_or(TxError::InvalidSavepoint)?;
        if pos == self.savepoints.len() - 1 {
            debug_assert!(false, "rollback_to the active savepoint is a no-op");
            return Ok(());
        }

        while self.savepoints.len() - 1 > pos {
            let mut sp = self.savepoints.pop().expect("chain longer than pos");
            sp.cancel_futures();
            // newest entries carry the authoritative lock state
            for id in sp.touch_order.iter().rev() {
                let entry = sp.entries.get(id).expect("touched entry");
                self.revert_lock(*id, entry.lock_state, entry.prev_lock_state)?;
            }
        }

        let id = self.next_savepoint;
        self.next_savepoint += 1;
        self.savepoints.push(Savepoint::new(id));
        Ok(())
    }

    /// Commit steps 1 through 6; the returned tail runs outside the
    /// transaction state.
    fn commit_prepare(&mut self) -> Result<CommitTail> {
        // 1. fold queued commutes, oldest savepoint first; an atom commuted in
        // several savepoints folds its full queue over one base
        let mut commute_work: Vec<(Arc<dyn ErasedAtom>, Vec<CommutePending>)> = Vec::new();
        let mut commute_index: HashMap<u64, usize> = HashMap::new();
        for sp in &mut self.savepoints {
            for id in sp.touch_order.clone() {
                let entry = sp.entries.get_mut(&id).expect("touched entry");
                if entry.commutes.is_empty() {
                    continue;
                }
                let queued = entry.commutes.drain(..);
                match commute_index.get(&id) {
                    Some(&i) => commute_work[i].1.extend(queued),
                    None => {
                        commute_index.insert(id, commute_work.len());
                        commute_work.push((entry.atom.clone(), queued.collect()));
                    }
                }
            }
        }
        for (atom, commutes) in commute_work {
            self.apply_commutes(atom, commutes)?;
        }

        // 2. the snapshot pin is no longer needed
        if let Some(v) = self.read_version.take() {
            version::unpin(v)?;
        }

        // 3. announce the commit
        let ann = Arc::new(CommitAnnouncement::new());
        self.announcement = Some(ann.clone());

        // 4. mark every distinct dirty atom, newest pending value wins
        let mut dirty: Vec<(Arc<dyn ErasedAtom>, Box<dyn Any + Send>)> = Vec::new();
        let mut dirty_index: HashMap<u64, usize> = HashMap::new();
        for sp in &mut self.savepoints {
            for id in sp.touch_order.clone() {
                let entry = sp.entries.get_mut(&id).expect("touched entry");
                if !entry.dirty {
                    continue;
                }
                if let Some(pending) = entry.pending.take() {
                    match dirty_index.get(&id) {
                        Some(&i) => dirty[i].1 = pending,
                        None => {
                            dirty_index.insert(id, dirty.len());
                            dirty.push((entry.atom.clone(), pending));
                        }
                    }
                }
            }
        }
        for (atom, _) in &dirty {
            atom.mark_for_commit(ann.clone())?;
            self.marked.push(atom.clone());
        }

        // 5. allocate the commit version and publish every new head
        let w = version::new_pinned_version();
        ann.publish_version(w);
        let oldest = version::oldest_pinned();
        let mut notifications = Vec::new();
        for (atom, pending) in &dirty {
            let (old, new) = atom.publish(&**pending, w, oldest)?;
            notifications.push((atom.clone(), old, new));
            atom.unmark();
        }
        self.marked.clear();
        version::unpin(w)?;

        // 6. drop all locks and the savepoint chain
        for (_, mut handle) in self.locks.drain() {
            let _ = handle.release();
        }
        let mut async_actions = Vec::new();
        for sp in &mut self.savepoints {
            async_actions.extend(sp.async_actions.drain(..));
        }
        self.savepoints.clear();
        self.savepoints.push(Savepoint::new(0));
        self.announcement = None;

        Ok(CommitTail {
            staged: std::mem::take(&mut self.staged_commutes),
            async_actions,
            announcement: ann,
            notifications,
        })
    }

    fn apply_commutes(&mut self, atom: Arc<dyn ErasedAtom>, commutes: Vec<CommutePending>) -> Result<()> {
        match self.apply_commutes_inner(&atom, &commutes) {
            Ok(observed) => {
                for (commute, value) in commutes.into_iter().zip(observed) {
                    self.staged_commutes.push((commute.promise, value));
                }
                Ok(())
            }
            Err(e) => {
                for commute in commutes {
                    // validation failures are the caller's fault and reported
                    // as such; recoverable failures leave the futures to the
                    // rollback's cancellation
                    match e {
                        TxError::Validation => commute.promise.fail(e.clone()),
                        _ => commute.promise.cancel(),
                    };
                }
                Err(e)
            }
        }
    }

    fn apply_commutes_inner(
        &mut self,
        atom: &Arc<dyn ErasedAtom>,
        commutes: &[CommutePending],
    ) -> Result<Vec<Box<dyn Any + Send>>> {
        // shared is enough to fold; commutes are snapshot independent so the
        // version gate stays out of the way
        self.realize_lock(atom, LockState::Shared)?;
        let snapshot = match self.isolation {
            IsolationLevel::ReadCommitted => None,
            _ => self.read_version,
        };
        let base_version = atom.latest_version();
        let start = match snapshot {
            Some(v) => atom.read_at_boxed(v)?,
            None => atom.latest_boxed(),
        };
        let (mut final_value, mut observed) = fold_commutes(atom, commutes, start)?;

        self.realize_lock(atom, LockState::Exclusive)?;
        if snapshot.is_none() && atom.latest_version() != base_version {
            // the base moved while only the shared token was held;
            // commutativity lets the whole queue re-fold onto the newer value
            let (value, seen) = fold_commutes(atom, commutes, atom.latest_boxed())?;
            final_value = value;
            observed = seen;
        }

        atom.validate_boxed(&*final_value)?;
        let entry = self.ensure_entry(atom);
        entry.pending = Some(final_value);
        entry.dirty = true;
        Ok(observed)
    }
}

fn fold_commutes(
    atom: &Arc<dyn ErasedAtom>,
    commutes: &[CommutePending],
    start: Box<dyn Any + Send>,
) -> Result<(Box<dyn Any + Send>, Vec<Box<dyn Any + Send>>)> {
    let mut observed = Vec::with_capacity(commutes.len());
    let mut cursor = start;
    for (i, commute) in commutes.iter().enumerate() {
        let (next, copy) = (commute.apply)(&*cursor);
        // the final result is validated by the write-back instead
        if i + 1 < commutes.len() {
            atom.validate_boxed(&*next)?;
        }
        observed.push(copy);
        cursor = next;
    }
    Ok((cursor, observed))
}

fn commit_prepare() -> Result<CommitTail> {
    with_state(|tx| tx.commit_prepare())
}

fn commit_finish(tail: CommitTail) {
    // 7. settle commute futures with the values observed during the fold
    for (promise, value) in tail.staged {
        promise.fulfill_boxed(value);
    }
    // 8. hand buffered asynchronous actions to their executors, in order
    for action in tail.async_actions {
        (action.submit)();
    }
    // 9. open the gate for readers parked on the announcement
    tail.announcement.open_gate();
    // 10. watcher notifications, with every lock already dropped
    for (atom, old, new) in tail.notifications {
        atom.notify_boxed(&*old, &*new);
    }
}

fn rollback_current() {
    CURRENT.with(|c| {
        if let Some(mut state) = c.borrow_mut().take() {
            rollback_state(&mut state);
        }
    });
}

fn rollback_state(state: &mut TxState) {
    while let Some(mut sp) = state.savepoints.pop() {
        sp.cancel_futures();
    }
    for (promise, _) in state.staged_commutes.drain(..) {
        promise.cancel();
    }
    for (_, mut handle) in state.locks.drain() {
        let _ = handle.release();
    }
    if let Some(v) = state.read_version.take() {
        let _ = version::unpin(v);
    }
    if let Some(ann) = state.announcement.take() {
        for atom in state.marked.drain(..) {
            atom.unmark();
        }
        // readers parked on the announcement re-check the mark once released
        ann.open_gate();
    }
    state.savepoints.push(Savepoint::new(0));
}
