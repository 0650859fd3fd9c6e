// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A single-use countdown latch, analogous to `std::sync::Barrier` but
//! one-shot and without a rendezvous return value.

use crate::wait::Waitable;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counts down from `n` to zero exactly once; every [`Self::wait`] blocks
/// until the count reaches zero.
pub struct Latch {
    remaining: AtomicUsize,
    waitable: Waitable,
}

impl Latch {
    #[must_use]
    pub fn new(n: usize) -> Self {
        let waitable = Waitable::new();
        if n == 0 {
            // Already done; nothing will ever count this down, so latch the
            // gate open up front rather than requiring a caller to do so.
            waitable.set_persistent_awakened();
        }
        Self {
            remaining: AtomicUsize::new(n),
            waitable,
        }
    }

    /// Decrements the count by `k`. Once it reaches zero, every blocked
    /// [`Self::wait`] is woken.
    ///
    /// # Panics
    ///
    /// Panics if `k` exceeds the remaining count.
    pub fn count_down(&self, k: usize) {
        let mut prev = self.remaining.load(Ordering::Relaxed);
        loop {
            assert!(k <= prev, "Latch::count_down would underflow remaining count");
            match self.remaining.compare_exchange_weak(
                prev,
                prev - k,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(cur) => prev = cur,
            }
        }

        if prev == k {
            for waiter in self.waitable.set_persistent_awakened() {
                crate::scheduling_group::ready_fiber(waiter);
            }
        }
    }

    /// Blocks the calling fiber until the count reaches zero.
    pub fn wait(&self) {
        self.waitable.wait();
    }

    /// Returns `true` without blocking if the count has already reached
    /// zero.
    #[must_use]
    pub fn try_wait(&self) -> bool {
        self.remaining.load(Ordering::Acquire) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_count_is_immediately_open() {
        let l = Latch::new(0);
        assert!(l.try_wait());
    }

    #[test]
    fn counts_down_to_zero() {
        let l = Latch::new(3);
        assert!(!l.try_wait());
        l.count_down(2);
        assert!(!l.try_wait());
        l.count_down(1);
        assert!(l.try_wait());
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn overshoot_panics() {
        let l = Latch::new(1);
        l.count_down(2);
    }
}
