// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Per-atom version chains.
//!
//! An atom's history is a singly linked list of `(value, version)` nodes,
//! newest first, with strictly decreasing versions along the predecessor
//! links. Readers clone the head pointer and walk towards older nodes without
//! taking the atom's lock; [`Chain::append`] prepends a new head and unlinks
//! everything below the garbage collection horizon in the same pass.

use std::sync::{Arc, Mutex};

use crate::errors::{Result, TxError};

struct ChainNode<T> {
    value: T,
    version: u64,
    prev: Mutex<Option<Arc<ChainNode<T>>>>,
}

pub(crate) struct Chain<T> {
    head: Mutex<Arc<ChainNode<T>>>,
}

impl<T: Clone> Chain<T> {
    pub(crate) fn new(value: T, version: u64) -> Self {
        Self {
            head: Mutex::new(Arc::new(ChainNode {
                value,
                version,
                prev: Mutex::new(None),
            })),
        }
    }

    fn head(&self) -> Arc<ChainNode<T>> {
        self.head.lock().expect("chain head poisoned").clone()
    }

    pub(crate) fn latest(&self) -> T {
        self.head().value.clone()
    }

    pub(crate) fn latest_version(&self) -> u64 {
        self.head().version
    }

    /// The value of the most recent node whose version is at or below `v`.
    ///
    /// Querying below every retained node means an unpinned version was
    /// asked for, which the version registry rules out for live readers.
    pub(crate) fn read_at(&self, v: u64) -> Result<T> {
        let mut node = self.head();
        loop {
            if node.version <= v {
                return Ok(node.value.clone());
            }
            let prev = node.prev.lock().expect("chain link poisoned").clone();
            match prev {
                Some(p) => node = p,
                None => {
                    return Err(TxError::InternalConsistency(format!(
                        "no chain node at or below version {}",
                        v
                    )))
                }
            }
        }
    }

    /// Prepends a new head and severs the predecessor link of the first node
    /// whose version is at or below `oldest_pinned`; nodes past it can no
    /// longer be reached by any pinned reader.
    pub(crate) fn append(&self, value: T, version: u64, oldest_pinned: u64) {
        let mut head = self.head.lock().expect("chain head poisoned");
        let node = Arc::new(ChainNode {
            value,
            version,
            prev: Mutex::new(Some(head.clone())),
        });
        *head = node.clone();
        drop(head);

        let mut cursor = node;
        loop {
            if cursor.version <= oldest_pinned {
                let mut prev = cursor.prev.lock().expect("chain link poisoned");
                *prev = None;
                return;
            }
            let next = cursor.prev.lock().expect("chain link poisoned").clone();
            match next {
                Some(p) => cursor = p,
                None => return,
            }
        }
    }

    /// Number of reachable nodes; used by tests to observe collection.
    #[cfg(test)]
    pub(crate) fn depth(&self) -> usize {
        let mut n = 1;
        let mut node = self.head();
        loop {
            let next = node.prev.lock().expect("chain link poisoned").clone();
            match next {
                Some(p) => {
                    node = p;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }
}
