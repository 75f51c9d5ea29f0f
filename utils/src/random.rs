// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use rand::distributions::{Alphanumeric, Distribution, Standard};
use rand::Rng;

// Random value for `T`.
pub fn random<T>() -> T
where
    Standard: Distribution<T>,
{
    rand::random()
}

// Random usize in range 0..upper_bound (excluding the upper bound).
pub fn usize(upper_bound: usize) -> usize {
    random::<usize>() % upper_bound
}

// Random bool.
pub fn coinflip() -> bool {
    random()
}

// Random alphanumeric string with length in range 1..64.
pub fn string() -> String {
    let l = (random::<usize>() % 63) + 1;
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(l)
        .map(char::from)
        .collect()
}

// Random sleep interval below `max_millis`, for perturbing thread schedules.
pub fn jitter(max_millis: u64) -> Duration {
    Duration::from_millis(random::<u64>() % max_millis.max(1))
}
