// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The process-wide waits-for graph.
//!
//! Before a worker parks on a lock it records one edge per current owner of
//! the contended node and runs a depth-first search from itself. Finding
//! itself again means the park would close a cycle, so the acquisition fails
//! with [`crate::TxError::Deadlock`] instead of blocking. Edge registration
//! and the search happen under one mutex, so of two workers racing into a
//! cycle the second always observes the first's edges.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use lazy_static::lazy_static;

lazy_static! {
    static ref GRAPH: Mutex<WaitsFor> = Mutex::new(WaitsFor::default());
}

#[derive(Default)]
struct WaitsFor {
    // waiter -> owners; a Vec keeps parallel edges from reentrant holders
    edges: HashMap<u64, Vec<u64>>,
}

impl WaitsFor {
    fn reaches(&self, from: u64, target: u64, seen: &mut HashSet<u64>) -> bool {
        if !seen.insert(from) {
            return false;
        }
        match self.edges.get(&from) {
            None => false,
            Some(owners) => owners
                .iter()
                .any(|&o| o == target || self.reaches(o, target, seen)),
        }
    }
}

/// Replaces the out-edges of `waiter` and reports whether parking now would
/// close a cycle through it. On detection the edges are removed again.
pub(crate) fn register_and_check(waiter: u64, owners: &[u64]) -> bool {
    let mut graph = GRAPH.lock().expect("waits-for graph poisoned");

    if owners.is_empty() {
        graph.edges.remove(&waiter);
        return false;
    }
    graph.edges.insert(waiter, owners.to_vec());

    let mut seen = HashSet::new();
    let cycles = owners
        .iter()
        .any(|&o| o == waiter || graph.reaches(o, waiter, &mut seen));
    if cycles {
        graph.edges.remove(&waiter);
    }
    cycles
}

/// Removes the out-edges of `waiter`; called on every wake.
pub(crate) fn clear(waiter: u64) {
    let mut graph = GRAPH.lock().expect("waits-for graph poisoned");
    graph.edges.remove(&waiter);
}

#[cfg(test)]
mod tests {
    use super::*;

    // test workers use ids far above anything a real thread gets assigned
    const BASE: u64 = 1 << 40;

    #[test]
    fn test_single_edge_is_no_cycle() {
        let (a, b) = (BASE + 1, BASE + 2);
        assert!(!register_and_check(a, &[b]));
        clear(a);
    }

    #[test]
    fn test_two_party_cycle_detected() {
        let (a, b) = (BASE + 11, BASE + 12);
        assert!(!register_and_check(a, &[b]));
        assert!(register_and_check(b, &[a]));
        clear(a);
        clear(b);
    }

    #[test]
    fn test_three_party_cycle_detected() {
        let (a, b, c) = (BASE + 21, BASE + 22, BASE + 23);
        assert!(!register_and_check(a, &[b]));
        assert!(!register_and_check(b, &[c]));
        assert!(register_and_check(c, &[a]));
        clear(a);
        clear(b);
        clear(c);
    }

    #[test]
    fn test_self_edge_detected() {
        let a = BASE + 31;
        assert!(register_and_check(a, &[a]));
        clear(a);
    }

    #[test]
    fn test_cleared_edges_break_cycles() {
        let (a, b) = (BASE + 41, BASE + 42);
        assert!(!register_and_check(a, &[b]));
        clear(a);
        assert!(!register_and_check(b, &[a]));
        clear(b);
    }
}
