// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The global version registry.
//!
//! All versions in the process are drawn from a single monotonic counter.
//! A version may be *pinned*; while pinned, every transactional atom keeps at
//! least one chain node at or below it, so a reader holding the pin always
//! finds a value. Pin counts live in an ordered map so the garbage collection
//! horizon ([`oldest_pinned`]) is a logarithmic lookup.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use lazy_static::lazy_static;

use crate::errors::{Result, TxError};

static VERSION_COUNTER: AtomicU64 = AtomicU64::new(0);

lazy_static! {
    static ref PINNED: Mutex<BTreeMap<u64, usize>> = Mutex::new(BTreeMap::new());
}

/// Reads the counter without allocating a version.
pub fn current_version() -> u64 {
    VERSION_COUNTER.load(Ordering::SeqCst)
}

/// Allocates the next version and returns it pinned.
///
/// The prior counter value is pinned for the duration of the allocation.
/// Without that bridge pin, a concurrent committer could observe an empty pin
/// map between our increment and our pin of the new value, garbage collect up
/// to the counter, and unlink the very node this caller is about to read.
pub fn new_pinned_version() -> u64 {
    let mut pinned = PINNED.lock().expect("pinned version map poisoned");

    let prior = VERSION_COUNTER.load(Ordering::SeqCst);
    pin_entry(&mut pinned, prior);

    let v = VERSION_COUNTER.fetch_add(1, Ordering::SeqCst) + 1;
    pin_entry(&mut pinned, v);

    unpin_entry(&mut pinned, prior).expect("bridge pin vanished");
    v
}

/// Increments the pin count of `v`.
pub fn pin(v: u64) {
    let mut pinned = PINNED.lock().expect("pinned version map poisoned");
    pin_entry(&mut pinned, v);
}

/// Decrements the pin count of `v`, removing the entry when it reaches zero.
pub fn unpin(v: u64) -> Result<()> {
    let mut pinned = PINNED.lock().expect("pinned version map poisoned");
    unpin_entry(&mut pinned, v)
}

/// The garbage collection horizon: the smallest pinned version, or the
/// current counter when nothing is pinned.
pub fn oldest_pinned() -> u64 {
    let pinned = PINNED.lock().expect("pinned version map poisoned");
    match pinned.keys().next() {
        Some(v) => *v,
        None => current_version(),
    }
}

fn pin_entry(pinned: &mut BTreeMap<u64, usize>, v: u64) {
    *pinned.entry(v).or_insert(0) += 1;
}

fn unpin_entry(pinned: &mut BTreeMap<u64, usize>, v: u64) -> Result<()> {
    match pinned.get_mut(&v) {
        Some(count) if *count > 1 => {
            *count -= 1;
            Ok(())
        }
        Some(_) => {
            pinned.remove(&v);
            Ok(())
        }
        None => Err(TxError::InternalConsistency(format!(
            "unpin of version {} without a matching pin",
            v
        ))),
    }
}
