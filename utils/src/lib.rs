// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Shared helpers for the coherence test suites: randomized values and small
//! schedule jitters used to shake out interleavings.

pub mod random;

pub use random::{coinflip, jitter, random, string, usize};
