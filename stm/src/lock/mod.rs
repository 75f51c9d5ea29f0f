// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Hierarchical reader/writer locks
//!
//! Lock nodes form a tree fixed at creation ([`HierLock::new_child`]). A
//! shared acquisition conflicts with exclusive holders on the node, on any
//! descendant and on any ancestor; an exclusive acquisition conflicts with
//! every holder in the node's subtree and with exclusive holders above it.
//! Holding a child therefore behaves as if each ancestor were held in shared
//! mode, without materializing those tokens.
//!
//! All nodes of one tree share a single state mutex and condition variable.
//! Waiters carry FIFO tickets; in fair mode a queued request only proceeds
//! when nothing older contends, in unfair mode (the default) barging is
//! allowed and only the conflict predicate decides. Every blocking variant
//! registers waits-for edges and runs cycle detection before parking, see
//! [`waits`].

pub(crate) mod waits;

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use log::trace;

use crate::{
    errors::{Result, TxError},
    worker::Worker,
};

const POISONED: &str = "lock tree state poisoned";

// Upper bound on one park interval; bounds the latency of observing an
// interrupt or an expired deadline.
const PARK_SLICE: Duration = Duration::from_millis(5);

/// Mode of a held lock token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, Copy)]
enum Park {
    Block,
    Interruptible,
    Timed(Instant),
}

struct Excl {
    worker: u64,
    count: usize,
}

struct Node {
    parent: Option<u64>,
    children: Vec<u64>,
    shared: HashMap<u64, usize>,
    exclusive: Option<Excl>,
    waiters: VecDeque<Waiter>,
}

struct Waiter {
    ticket: u64,
    exclusive: bool,
}

impl Node {
    fn new(parent: Option<u64>) -> Self {
        Self {
            parent,
            children: Vec::new(),
            shared: HashMap::new(),
            exclusive: None,
            waiters: VecDeque::new(),
        }
    }
}

struct TreeState {
    nodes: HashMap<u64, Node>,
    next_node: u64,
    next_ticket: u64,
}

impl TreeState {
    fn node(&self, id: u64) -> &Node {
        self.nodes.get(&id).expect("lock node missing from tree")
    }

    fn node_mut(&mut self, id: u64) -> &mut Node {
        self.nodes.get_mut(&id).expect("lock node missing from tree")
    }
}

struct Tree {
    state: Mutex<TreeState>,
    cv: Condvar,
    fair: bool,
}

/// One node of a hierarchical lock tree.
pub struct HierLock {
    tree: Arc<Tree>,
    node: u64,
}

impl Clone for HierLock {
    fn clone(&self) -> Self {
        Self {
            tree: self.tree.clone(),
            node: self.node,
        }
    }
}

impl Default for HierLock {
    fn default() -> Self {
        Self::new()
    }
}

impl HierLock {
    /// Creates the root of a new, unfair lock tree.
    pub fn new() -> Self {
        Self::with_fairness(false)
    }

    /// Creates the root of a new lock tree with strictly FIFO queues.
    pub fn new_fair() -> Self {
        Self::with_fairness(true)
    }

    fn with_fairness(fair: bool) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(0, Node::new(None));
        Self {
            tree: Arc::new(Tree {
                state: Mutex::new(TreeState {
                    nodes,
                    next_node: 1,
                    next_ticket: 0,
                }),
                cv: Condvar::new(),
                fair,
            }),
            node: 0,
        }
    }

    /// Creates a lock node whose parent is this one.
    pub fn new_child(&self) -> Self {
        let mut st = self.tree.state.lock().expect(POISONED);
        let id = st.next_node;
        st.next_node += 1;
        st.nodes.insert(id, Node::new(Some(self.node)));
        st.node_mut(self.node).children.push(id);
        Self {
            tree: self.tree.clone(),
            node: id,
        }
    }

    pub fn is_fair(&self) -> bool {
        self.tree.fair
    }

    pub fn acquire_shared(&self) -> Result<LockHandle> {
        self.acquire(false, Park::Block)
    }

    pub fn try_acquire_shared(&self) -> Option<LockHandle> {
        self.try_acquire(false)
    }

    pub fn acquire_shared_timed(&self, d: Duration) -> Result<LockHandle> {
        self.acquire(false, Park::Timed(Instant::now() + d))
    }

    pub fn acquire_shared_interruptible(&self) -> Result<LockHandle> {
        self.acquire(false, Park::Interruptible)
    }

    pub fn acquire_exclusive(&self) -> Result<LockHandle> {
        self.acquire(true, Park::Block)
    }

    pub fn try_acquire_exclusive(&self) -> Option<LockHandle> {
        self.try_acquire(true)
    }

    pub fn acquire_exclusive_timed(&self, d: Duration) -> Result<LockHandle> {
        self.acquire(true, Park::Timed(Instant::now() + d))
    }

    pub fn acquire_exclusive_interruptible(&self) -> Result<LockHandle> {
        self.acquire(true, Park::Interruptible)
    }

    fn handle(&self, exclusive: bool, worker: u64) -> LockHandle {
        LockHandle {
            tree: self.tree.clone(),
            node: self.node,
            worker,
            mode: Some(if exclusive {
                LockMode::Exclusive
            } else {
                LockMode::Shared
            }),
        }
    }

    fn try_acquire(&self, exclusive: bool) -> Option<LockHandle> {
        let me = Worker::current();
        let mut st = self.tree.state.lock().expect(POISONED);
        if eligible_new(&st, self.tree.fair, self.node, me.id(), exclusive) {
            grant(&mut st, self.node, me.id(), exclusive);
            Some(self.handle(exclusive, me.id()))
        } else {
            None
        }
    }

    fn acquire(&self, exclusive: bool, park: Park) -> Result<LockHandle> {
        let me = Worker::current();
        let mut st = self.tree.state.lock().expect(POISONED);

        if eligible_new(&st, self.tree.fair, self.node, me.id(), exclusive) {
            grant(&mut st, self.node, me.id(), exclusive);
            return Ok(self.handle(exclusive, me.id()));
        }

        let ticket = st.next_ticket;
        st.next_ticket += 1;
        st.node_mut(self.node)
            .waiters
            .push_back(Waiter { ticket, exclusive });
        trace!(
            "lock(node {}): worker {} parks for {} (ticket {})",
            self.node,
            me.id(),
            if exclusive { "exclusive" } else { "shared" },
            ticket
        );

        loop {
            let owners = conflict_holders(&st, self.node, me.id(), exclusive);
            if waits::register_and_check(me.id(), &owners) {
                remove_waiter(&mut st, self.node, ticket);
                trace!("lock(node {}): worker {} would deadlock", self.node, me.id());
                return Err(TxError::Deadlock);
            }

            let timeout = match park {
                Park::Timed(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        waits::clear(me.id());
                        remove_waiter(&mut st, self.node, ticket);
                        return Err(TxError::Timeout);
                    }
                    (deadline - now).min(PARK_SLICE)
                }
                _ => PARK_SLICE,
            };
            let (guard, _) = self.tree.cv.wait_timeout(st, timeout).expect(POISONED);
            st = guard;

            if matches!(park, Park::Interruptible) && me.take_interrupt() {
                waits::clear(me.id());
                remove_waiter(&mut st, self.node, ticket);
                return Err(TxError::Interrupted);
            }

            if eligible_queued(&st, self.tree.fair, self.node, me.id(), exclusive, ticket) {
                waits::clear(me.id());
                remove_waiter(&mut st, self.node, ticket);
                grant(&mut st, self.node, me.id(), exclusive);
                drop(st);
                // a granted shared token may unblock shared waiters behind us
                self.tree.cv.notify_all();
                return Ok(self.handle(exclusive, me.id()));
            }
        }
    }
}

/// A held lock token. Dropping a live handle releases it.
pub struct LockHandle {
    tree: Arc<Tree>,
    node: u64,
    worker: u64,
    mode: Option<LockMode>,
}

impl LockHandle {
    /// Current mode, or `None` once released or consumed by a promotion.
    pub fn mode(&self) -> Option<LockMode> {
        self.mode
    }

    /// Releases the token. Fails on a handle that no longer holds one.
    pub fn release(&mut self) -> Result<()> {
        match self.mode.take() {
            Some(mode) => {
                release_token(&self.tree, self.node, self.worker, mode == LockMode::Exclusive);
                Ok(())
            }
            None => Err(TxError::InvalidHandleState),
        }
    }

    /// Atomically converts the exclusive token to a shared one and wakes
    /// readers that were blocked on it.
    pub fn demote_to_shared(&mut self) -> Result<()> {
        match self.mode {
            Some(LockMode::Exclusive) => {
                let mut st = self.tree.state.lock().expect(POISONED);
                let n = st.node_mut(self.node);
                if let Some(ex) = &mut n.exclusive {
                    ex.count -= 1;
                    if ex.count == 0 {
                        n.exclusive = None;
                    }
                }
                *n.shared.entry(self.worker).or_insert(0) += 1;
                drop(st);
                self.tree.cv.notify_all();
                self.mode = Some(LockMode::Shared);
                Ok(())
            }
            _ => Err(TxError::InvalidHandleState),
        }
    }

    pub fn promote_to_exclusive(&mut self) -> Result<()> {
        self.promote(Park::Block)
    }

    pub fn promote_to_exclusive_timed(&mut self, d: Duration) -> Result<()> {
        self.promote(Park::Timed(Instant::now() + d))
    }

    pub fn promote_to_exclusive_interruptible(&mut self) -> Result<()> {
        self.promote(Park::Interruptible)
    }

    /// Attempts the atomic upgrade without surrendering the shared token.
    /// Returns `Ok(false)` when the upgrade would have to block.
    pub fn try_promote_to_exclusive(&mut self) -> Result<bool> {
        match self.mode {
            Some(LockMode::Shared) => {}
            _ => return Err(TxError::InvalidHandleState),
        }
        let mut st = self.tree.state.lock().expect(POISONED);
        if !atomic_promote_possible(&st, self.node, self.worker) {
            return Ok(false);
        }
        convert_shared_to_exclusive(&mut st, self.node, self.worker);
        self.mode = Some(LockMode::Exclusive);
        Ok(true)
    }

    /// Upgrades to exclusive. The upgrade is atomic when this worker is the
    /// only shared holder and no exclusive waiter is queued; otherwise the
    /// shared token is surrendered first and the exclusive acquisition takes
    /// the normal blocking path. A failed non-atomic promotion leaves the
    /// handle released.
    fn promote(&mut self, park: Park) -> Result<()> {
        match self.mode {
            Some(LockMode::Shared) => {}
            _ => return Err(TxError::InvalidHandleState),
        }

        let mut st = self.tree.state.lock().expect(POISONED);
        if atomic_promote_possible(&st, self.node, self.worker) {
            convert_shared_to_exclusive(&mut st, self.node, self.worker);
            self.mode = Some(LockMode::Exclusive);
            return Ok(());
        }

        // surrender the shared token, then race for exclusive
        let n = st.node_mut(self.node);
        if let Some(count) = n.shared.get_mut(&self.worker) {
            *count -= 1;
            if *count == 0 {
                n.shared.remove(&self.worker);
            }
        }
        drop(st);
        self.tree.cv.notify_all();
        self.mode = None;

        let lock = HierLock {
            tree: self.tree.clone(),
            node: self.node,
        };
        match lock.acquire(true, park) {
            Ok(mut won) => {
                // absorb the token into this handle
                won.mode = None;
                self.mode = Some(LockMode::Exclusive);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Some(mode) = self.mode.take() {
            release_token(&self.tree, self.node, self.worker, mode == LockMode::Exclusive);
        }
    }
}

fn atomic_promote_possible(st: &TreeState, node: u64, me: u64) -> bool {
    let n = st.node(node);
    let sole_shared = n.shared.len() == 1 && n.shared.contains_key(&me);
    let no_exclusive_waiter = !n.waiters.iter().any(|w| w.exclusive);
    sole_shared && no_exclusive_waiter && conflict_holders(st, node, me, true).is_empty()
}

fn convert_shared_to_exclusive(st: &mut TreeState, node: u64, me: u64) {
    let n = st.node_mut(node);
    if let Some(count) = n.shared.get_mut(&me) {
        *count -= 1;
        if *count == 0 {
            n.shared.remove(&me);
        }
    }
    match &mut n.exclusive {
        Some(ex) => ex.count += 1,
        None => {
            n.exclusive = Some(Excl {
                worker: me,
                count: 1,
            })
        }
    }
}

/// Holders that conflict with `me` acquiring `node`: exclusive holders in the
/// node's subtree and among its ancestors always conflict; for an exclusive
/// request every foreign holder in the subtree does. The whole subtree is
/// scanned, non-contiguous descendants included.
fn conflict_holders(st: &TreeState, node: u64, me: u64, exclusive: bool) -> Vec<u64> {
    let mut out = Vec::new();

    let mut stack = vec![node];
    while let Some(id) = stack.pop() {
        let n = st.node(id);
        if let Some(ex) = &n.exclusive {
            if ex.worker != me {
                out.push(ex.worker);
            }
        }
        if exclusive {
            for (&w, _) in &n.shared {
                if w != me {
                    out.push(w);
                }
            }
        }
        stack.extend(n.children.iter().copied());
    }

    let mut cur = st.node(node).parent;
    while let Some(id) = cur {
        let n = st.node(id);
        if let Some(ex) = &n.exclusive {
            if ex.worker != me {
                out.push(ex.worker);
            }
        }
        cur = n.parent;
    }

    out
}

fn eligible_new(st: &TreeState, fair: bool, node: u64, me: u64, exclusive: bool) -> bool {
    if !conflict_holders(st, node, me, exclusive).is_empty() {
        return false;
    }
    if !fair {
        return true;
    }
    let n = st.node(node);
    if exclusive {
        n.waiters.is_empty()
    } else {
        !n.waiters.iter().any(|w| w.exclusive)
    }
}

fn eligible_queued(st: &TreeState, fair: bool, node: u64, me: u64, exclusive: bool, ticket: u64) -> bool {
    if !conflict_holders(st, node, me, exclusive).is_empty() {
        return false;
    }
    if !fair {
        return true;
    }
    let n = st.node(node);
    if exclusive {
        n.waiters.iter().all(|w| w.ticket >= ticket)
    } else {
        !n.waiters.iter().any(|w| w.exclusive && w.ticket < ticket)
    }
}

fn grant(st: &mut TreeState, node: u64, me: u64, exclusive: bool) {
    let n = st.node_mut(node);
    if exclusive {
        match &mut n.exclusive {
            Some(ex) => ex.count += 1,
            None => {
                n.exclusive = Some(Excl {
                    worker: me,
                    count: 1,
                })
            }
        }
    } else {
        *n.shared.entry(me).or_insert(0) += 1;
    }
}

fn remove_waiter(st: &mut TreeState, node: u64, ticket: u64) {
    let n = st.node_mut(node);
    if let Some(pos) = n.waiters.iter().position(|w| w.ticket == ticket) {
        n.waiters.remove(pos);
    }
}

fn release_token(tree: &Arc<Tree>, node: u64, worker: u64, exclusive: bool) {
    let mut st = tree.state.lock().expect(POISONED);
    let n = st.node_mut(node);
    if exclusive {
        if let Some(ex) = &mut n.exclusive {
            if ex.worker == worker {
                ex.count -= 1;
                if ex.count == 0 {
                    n.exclusive = None;
                }
            }
        }
    } else if let Some(count) = n.shared.get_mut(&worker) {
        *count -= 1;
        if *count == 0 {
            n.shared.remove(&worker);
        }
    }
    drop(st);
    tree.cv.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_shared_is_reentrant() {
        let lock = HierLock::new();
        let mut a = lock.acquire_shared().expect("first shared");
        let mut b = lock.acquire_shared().expect("reentrant shared");
        a.release().expect("release first");
        b.release().expect("release second");
    }

    #[test]
    fn test_exclusive_is_reentrant() {
        let lock = HierLock::new();
        let mut a = lock.acquire_exclusive().expect("first exclusive");
        let mut b = lock.acquire_exclusive().expect("reentrant exclusive");
        b.release().expect("release inner");
        a.release().expect("release outer");
    }

    #[test]
    fn test_exclusive_excludes_other_workers() {
        let lock = HierLock::new();
        let _held = lock.acquire_exclusive().expect("exclusive");

        let other = lock.clone();
        let blocked = std::thread::spawn(move || other.try_acquire_shared().is_none())
            .join()
            .expect("Failed to join");
        assert!(blocked, "foreign shared must not succeed under exclusive");
    }

    #[test]
    fn test_shared_blocks_foreign_exclusive_only() {
        let lock = HierLock::new();
        let _held = lock.acquire_shared().expect("shared");

        let l1 = lock.clone();
        let (more_shared, no_exclusive) = std::thread::spawn(move || {
            (
                l1.try_acquire_shared().is_some(),
                l1.try_acquire_exclusive().is_none(),
            )
        })
        .join()
        .expect("Failed to join");
        assert!(more_shared);
        assert!(no_exclusive);
    }

    #[test]
    fn test_child_exclusive_blocks_parent_exclusive() {
        let parent = HierLock::new();
        let child = parent.new_child();
        let _held = child.acquire_exclusive().expect("child exclusive");

        let p = parent.clone();
        let blocked = std::thread::spawn(move || p.try_acquire_exclusive().is_none())
            .join()
            .expect("Failed to join");
        assert!(blocked, "parent exclusive must see the held descendant");
    }

    #[test]
    fn test_parent_exclusive_blocks_child_any_mode() {
        let parent = HierLock::new();
        let child = parent.new_child();
        let _held = parent.acquire_exclusive().expect("parent exclusive");

        let c = child.clone();
        let (no_shared, no_exclusive) = std::thread::spawn(move || {
            (
                c.try_acquire_shared().is_none(),
                c.try_acquire_exclusive().is_none(),
            )
        })
        .join()
        .expect("Failed to join");
        assert!(no_shared);
        assert!(no_exclusive);
    }

    #[test]
    fn test_parent_shared_admits_child_exclusive() {
        let parent = HierLock::new();
        let child = parent.new_child();
        let _held = parent.acquire_shared().expect("parent shared");

        let c = child.clone();
        let ok = std::thread::spawn(move || c.try_acquire_exclusive().is_some())
            .join()
            .expect("Failed to join");
        assert!(ok, "a shared ancestor does not exclude the subtree");
    }

    #[test]
    fn test_sibling_subtrees_do_not_conflict() {
        let parent = HierLock::new();
        let left = parent.new_child();
        let right = parent.new_child();
        let _held = left.acquire_exclusive().expect("left exclusive");

        let r = right.clone();
        let ok = std::thread::spawn(move || r.try_acquire_exclusive().is_some())
            .join()
            .expect("Failed to join");
        assert!(ok, "siblings are independent");
    }

    #[test]
    fn test_release_twice_is_invalid() {
        let lock = HierLock::new();
        let mut h = lock.acquire_shared().expect("shared");
        h.release().expect("first release");
        assert_eq!(h.release(), Err(TxError::InvalidHandleState));
    }

    #[test]
    fn test_demote_requires_exclusive() {
        let lock = HierLock::new();
        let mut h = lock.acquire_shared().expect("shared");
        assert_eq!(h.demote_to_shared(), Err(TxError::InvalidHandleState));
        h.release().expect("release");
    }

    #[test]
    fn test_promote_and_demote_round_trip() {
        let lock = HierLock::new();
        let mut h = lock.acquire_shared().expect("shared");

        h.promote_to_exclusive().expect("sole holder promotes atomically");
        assert_eq!(h.mode(), Some(LockMode::Exclusive));

        let l = lock.clone();
        let blocked = std::thread::spawn(move || l.try_acquire_shared().is_none())
            .join()
            .expect("Failed to join");
        assert!(blocked);

        h.demote_to_shared().expect("demote");
        assert_eq!(h.mode(), Some(LockMode::Shared));

        let l = lock.clone();
        let ok = std::thread::spawn(move || l.try_acquire_shared().is_some())
            .join()
            .expect("Failed to join");
        assert!(ok, "readers proceed after demotion");
    }

    #[test]
    fn test_try_promote_fails_with_other_readers() {
        let lock = HierLock::new();
        let mut mine = lock.acquire_shared().expect("shared");

        let l = lock.clone();
        let (tx, rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let holder = std::thread::spawn(move || {
            let mut h = l.acquire_shared().expect("other shared");
            tx.send(()).expect("signal held");
            done_rx.recv().expect("wait for main");
            h.release().expect("release");
        });
        rx.recv().expect("other reader holds");

        assert_eq!(mine.try_promote_to_exclusive(), Ok(false));
        assert_eq!(mine.mode(), Some(LockMode::Shared));

        done_tx.send(()).expect("let holder go");
        holder.join().expect("Failed to join");
        mine.promote_to_exclusive().expect("promotes once alone");
    }

    #[test]
    fn test_exclusive_timed_times_out() {
        let lock = HierLock::new();
        let _held = lock.acquire_exclusive().expect("exclusive");

        let l = lock.clone();
        let res = std::thread::spawn(move || l.acquire_exclusive_timed(Duration::from_millis(40)))
            .join()
            .expect("Failed to join");
        assert_eq!(res.err(), Some(TxError::Timeout));
    }

    #[test]
    fn test_interruptible_acquire_observes_interrupt() {
        let lock = HierLock::new();
        let _held = lock.acquire_exclusive().expect("exclusive");

        let l = lock.clone();
        let (tx, rx) = mpsc::channel();
        let waiter = std::thread::spawn(move || {
            tx.send(Worker::current()).expect("hand out worker handle");
            l.acquire_shared_interruptible()
        });
        let target = rx.recv().expect("worker handle");
        std::thread::sleep(Duration::from_millis(20));
        target.interrupt();

        let res = waiter.join().expect("Failed to join waiter");
        assert_eq!(res.err(), Some(TxError::Interrupted));
    }

    #[test]
    fn test_two_lock_deadlock_is_detected() {
        let a = HierLock::new();
        let b = HierLock::new();

        let (a1, b1) = (a.clone(), b.clone());
        let (a2, b2) = (a.clone(), b.clone());
        let (ready_tx, ready_rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel();

        let first = std::thread::spawn(move || {
            let _ha = a1.acquire_exclusive().expect("a exclusive");
            ready_tx.send(()).expect("ready");
            go_rx.recv().expect("go");
            b1.acquire_exclusive()
        });
        let second = std::thread::spawn(move || {
            let _hb = b2.acquire_exclusive().expect("b exclusive");
            ready_rx.recv().expect("peer ready");
            go_tx.send(()).expect("go");
            a2.acquire_exclusive()
        });

        let r1 = first.join().expect("Failed to join first");
        let r2 = second.join().expect("Failed to join second");
        let failures = [&r1, &r2].iter().filter(|r| r.is_err()).count();
        assert!(failures >= 1, "at least one side must detect the cycle");
        assert!(
            [&r1, &r2]
                .iter()
                .all(|r| r.is_ok() || matches!(r, Err(TxError::Deadlock))),
            "only deadlock failures are acceptable here"
        );
    }

    #[test]
    fn test_fair_queue_blocks_barging_readers() {
        let lock = HierLock::new_fair();
        let _reader = lock.acquire_shared().expect("shared");

        // park a writer so an exclusive waiter is queued
        let l = lock.clone();
        let writer = std::thread::spawn(move || {
            let mut h = l.acquire_exclusive().expect("writer eventually wins");
            h.release().expect("release");
        });
        std::thread::sleep(Duration::from_millis(30));

        let l = lock.clone();
        let barged = std::thread::spawn(move || l.try_acquire_shared().is_some())
            .join()
            .expect("Failed to join");
        assert!(!barged, "fair mode keeps late readers behind a queued writer");

        drop(_reader);
        writer.join().expect("Failed to join writer");
    }

    #[test]
    fn test_unfair_readers_barge_past_queued_writer() {
        let lock = HierLock::new();
        let reader = lock.acquire_shared().expect("shared");

        let l = lock.clone();
        let writer = std::thread::spawn(move || {
            let mut h = l.acquire_exclusive().expect("writer eventually wins");
            h.release().expect("release");
        });
        std::thread::sleep(Duration::from_millis(30));

        let l = lock.clone();
        let barged = std::thread::spawn(move || {
            let h = l.try_acquire_shared();
            h.is_some()
        })
        .join()
        .expect("Failed to join");
        assert!(barged, "unfair mode admits readers regardless of the queue");

        drop(reader);
        writer.join().expect("Failed to join writer");
    }
}
