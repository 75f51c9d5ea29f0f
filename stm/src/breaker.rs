// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicUsize, Ordering};

const MAX_WAIT_UNITS: usize = 7;

/// # BusyBreaker
/// [`BusyBreaker`] keeps the CPU busy for exponentially growing short delays,
/// up to a fixed bound. The retry loop of [`crate::Transaction::run`] spins it
/// between deadlock retries so two symmetric transactions stop colliding on
/// the same locks; a saturated breaker simply stops adding delay.
#[derive(Default)]
pub struct BusyBreaker {
    unit: AtomicUsize,
}

impl BusyBreaker {
    /// Keeps the CPU busy but hints to the CPU to reschedule the CPU time.
    ///
    /// Returns `false` once the breaker has reached its maximum delay unit.
    pub fn spin(&self) -> bool {
        match self.unit.load(Ordering::Acquire) {
            unit if unit <= MAX_WAIT_UNITS => {
                for _ in 0..(1 << unit) {
                    core::hint::spin_loop();
                }
                self.unit.store(unit + 1, Ordering::Release);
                true
            }
            _ => false,
        }
    }

    /// Resets the breaker to zero.
    pub fn reset(&self) {
        self.unit.store(0, Ordering::Release);
    }
}
