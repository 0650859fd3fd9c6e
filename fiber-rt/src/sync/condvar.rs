// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A fiber-blocking condition variable, used together with [`super::Mutex`].

use super::mutex::{Mutex, MutexGuard};
use crate::wait::Waitable;
use std::time::Instant;

/// Classic mutex-paired condition variable. `wait` releases the caller's
/// [`Mutex`] guard before suspending and re-acquires it before returning, so
/// the critical section the caller observes on return is consistent with
/// ordinary lock semantics.
///
/// Spurious wakeups are possible (as with every condvar): a waiter resumed
/// by `notify_one`/`notify_all` must re-check its predicate itself.
pub struct ConditionVariable {
    waitable: Waitable,
}

impl ConditionVariable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            waitable: Waitable::new(),
        }
    }

    /// Atomically releases `guard`'s mutex and suspends the calling fiber
    /// until a notification, then re-acquires the mutex before returning.
    pub fn wait<'a, T: ?Sized>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let mutex = guard.mutex();
        drop(guard);
        self.waitable.wait();
        mutex.lock()
    }

    /// As [`Self::wait`], but also arms a timeout. Returns `false` (and the
    /// re-acquired guard) if `deadline` elapsed before a notification, `true`
    /// otherwise.
    pub fn wait_until<'a, T: ?Sized>(
        &self,
        guard: MutexGuard<'a, T>,
        deadline: Instant,
    ) -> (MutexGuard<'a, T>, bool) {
        let mutex = guard.mutex();
        drop(guard);
        let notified = self.waitable.wait_until(deadline);
        (mutex.lock(), notified)
    }

    /// Wakes one waiter, if any.
    pub fn notify_one(&self) {
        if let Some(waiter) = self.waitable.wake_one() {
            crate::scheduling_group::ready_fiber(waiter);
        }
    }

    /// Wakes every current waiter.
    pub fn notify_all(&self) {
        while let Some(waiter) = self.waitable.wake_one() {
            crate::scheduling_group::ready_fiber(waiter);
        }
    }
}

impl Default for ConditionVariable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber_api::{Fiber, FiberAttrs};
    use crate::sync::{ExitBarrier, Mutex};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn producer_consumer_single_group() {
        crate::runtime::ensure_test_runtime();

        let mutex = Arc::new(Mutex::new(Vec::<i32>::new()));
        let cv = Arc::new(ConditionVariable::new());
        let barrier = ExitBarrier::new(2);

        {
            let mutex = mutex.clone();
            let cv = cv.clone();
            let barrier = barrier.clone();
            Fiber::spawn_detached(FiberAttrs::default(), move || {
                for i in 0..50 {
                    mutex.lock().push(i);
                    cv.notify_one();
                }
                mutex.lock().push(-1);
                cv.notify_one();
                barrier.count_down();
            });
        }

        let sum = Arc::new(Mutex::new(0i64));
        {
            let mutex = mutex.clone();
            let cv = cv.clone();
            let sum = sum.clone();
            let barrier = barrier.clone();
            Fiber::spawn_detached(FiberAttrs::default(), move || {
                loop {
                    let mut guard = mutex.lock();
                    while guard.is_empty() {
                        guard = cv.wait(guard);
                    }
                    let v = guard.remove(0);
                    drop(guard);
                    if v < 0 {
                        break;
                    }
                    *sum.lock() += i64::from(v);
                }
                barrier.count_down();
            });
        }

        barrier.wait();
        assert_eq!(*sum.lock(), (0..50).sum::<i32>() as i64);
    }
}
