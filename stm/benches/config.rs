// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Transactional memory stress tests
//!
//! Test subjects:
//! - direct atom updates without a transaction
//! - full transactional read/write round trips
//! - commute queues resolved at commit

use contention::*;
use criterion::{criterion_group, criterion_main};

// all contention benches
criterion_group!(benches, bnc_direct_update, bnc_transactional_update, bnc_commute);

// main
criterion_main!(benches);
