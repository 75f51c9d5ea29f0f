// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Savepoints and the per-atom working set.
//!
//! A transaction's buffered state lives in a chain of savepoints, oldest
//! first; the newest is the active one. Each savepoint owns a working-set map
//! keyed by atom id plus the asynchronous actions queued while it was active.
//! Entries shadow older ones for the same atom, so a partial rollback simply
//! discards whole savepoints and re-exposes the state beneath.

use std::{
    any::Any,
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use crate::{atom::ErasedAtom, promise::ErasedPromise};

/// Identifies a savepoint within the transaction that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavepointHandle(pub(crate) u64);

/// Lock escalation level an entry holds on its atom. Within one transaction
/// the level only ever goes up; rollback realizes the inverse transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum LockState {
    None,
    Shared,
    Exclusive,
}

/// A deferred commutative update: the erased application function returns the
/// successor value twice (one copy continues the fold, one settles the
/// caller's future at commit).
pub(crate) struct CommutePending {
    pub(crate) apply: Box<dyn Fn(&dyn Any) -> (Box<dyn Any + Send>, Box<dyn Any + Send>) + Send + Sync>,
    pub(crate) promise: Box<dyn ErasedPromise>,
}

/// A buffered asynchronous mutation; `submit` hands the task to the owning
/// atom's executor at commit.
pub(crate) struct AsyncAction {
    pub(crate) submit: Box<dyn FnOnce() + Send>,
    pub(crate) promise: Box<dyn ErasedPromise>,
}

pub(crate) struct AtomEntry {
    pub(crate) atom: Arc<dyn ErasedAtom>,
    pub(crate) pending: Option<Box<dyn Any + Send>>,
    pub(crate) dirty: bool,
    pub(crate) lock_state: LockState,
    pub(crate) prev_lock_state: LockState,
    pub(crate) commutes: VecDeque<CommutePending>,
}

impl AtomEntry {
    pub(crate) fn new(atom: Arc<dyn ErasedAtom>, inherited: LockState) -> Self {
        Self {
            atom,
            pending: None,
            dirty: false,
            lock_state: inherited,
            prev_lock_state: inherited,
            commutes: VecDeque::new(),
        }
    }
}

pub(crate) struct Savepoint {
    pub(crate) id: u64,
    pub(crate) entries: HashMap<u64, AtomEntry>,
    // first-touch order of `entries`, so commit walks atoms deterministically
    pub(crate) touch_order: Vec<u64>,
    pub(crate) async_actions: VecDeque<AsyncAction>,
}

impl Savepoint {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            entries: HashMap::new(),
            touch_order: Vec::new(),
            async_actions: VecDeque::new(),
        }
    }

    pub(crate) fn entry_mut(&mut self, atom: Arc<dyn ErasedAtom>, inherited: LockState) -> &mut AtomEntry {
        let id = atom.id();
        if !self.entries.contains_key(&id) {
            self.entries.insert(id, AtomEntry::new(atom, inherited));
            self.touch_order.push(id);
        }
        self.entries.get_mut(&id).expect("entry just inserted")
    }

    /// Cancels every future whose fate this savepoint still owns.
    pub(crate) fn cancel_futures(&mut self) {
        for id in &self.touch_order {
            if let Some(entry) = self.entries.get_mut(id) {
                for commute in entry.commutes.drain(..) {
                    commute.promise.cancel();
                }
            }
        }
        for action in self.async_actions.drain(..) {
            action.promise.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{atom::TxAtom, promise};

    fn erased(atom: &TxAtom<usize>) -> Arc<dyn ErasedAtom> {
        Arc::new(atom.clone())
    }

    #[test]
    fn test_entry_is_created_once_in_touch_order() {
        let a = TxAtom::new(1usize);
        let b = TxAtom::new(2usize);
        let mut sp = Savepoint::new(0);

        sp.entry_mut(erased(&b), LockState::None).dirty = true;
        sp.entry_mut(erased(&a), LockState::None);
        sp.entry_mut(erased(&b), LockState::None);

        assert_eq!(sp.touch_order, vec![b.id(), a.id()]);
        assert!(sp.entries.get(&b.id()).expect("entry").dirty);
    }

    #[test]
    fn test_cancel_futures_settles_everything() {
        let a = TxAtom::new(1usize);
        let mut sp = Savepoint::new(0);

        let (promise, future) = promise::pair::<usize>();
        let entry = sp.entry_mut(erased(&a), LockState::None);
        entry.commutes.push_back(CommutePending {
            apply: Box::new(|_| {
                (
                    Box::new(0usize) as Box<dyn Any + Send>,
                    Box::new(0usize) as Box<dyn Any + Send>,
                )
            }),
            promise: Box::new(promise),
        });

        let (a_promise, a_future) = promise::pair::<usize>();
        sp.async_actions.push_back(AsyncAction {
            submit: Box::new(|| {}),
            promise: Box::new(a_promise),
        });

        sp.cancel_futures();
        assert!(future.is_cancelled());
        assert!(a_future.is_cancelled());
    }
}
