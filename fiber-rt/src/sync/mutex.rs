// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A fiber-blocking mutual-exclusion lock.
//!
//! Three-state futex-style mutex (Drepper's `mutex2`): `0` free, `1` held
//! uncontended, `2` held with at least one waiter parked on [`Waitable`].
//! The fast path is a single CAS from `0` to `1`. A contended acquirer
//! `swap`s the state to `2` before waiting, so whichever side currently
//! holds the lock knows a wake is owed on unlock; `unlock` only resets the
//! state to `0` and wakes a waiter when it observes that marker.

use crate::wait::Waitable;
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};

const FREE: u32 = 0;
const HELD: u32 = 1;
const CONTENDED: u32 = 2;

/// A mutual-exclusion lock that suspends the calling fiber instead of
/// spinning or blocking the underlying OS thread.
///
/// Not safe to lock from a plain OS thread that isn't running as a fiber
/// worker: [`Waitable::wait`] requires a current fiber context.
pub struct Mutex<T: ?Sized> {
    state: AtomicU32,
    waitable: Waitable,
    data: UnsafeCell<T>,
}

// Safety: `data` is only ever reachable through `MutexGuard`, which is only
// handed out while `state` is held; the usual mutex argument.
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: AtomicU32::new(FREE),
            waitable: Waitable::new(),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<'_, T> {
        if let Err(prev) =
            self.state
                .compare_exchange(FREE, HELD, Ordering::Acquire, Ordering::Relaxed)
        {
            self.lock_slow(prev);
        }
        MutexGuard { mutex: self }
    }

    #[must_use]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.state
            .compare_exchange(FREE, HELD, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
            .then_some(MutexGuard { mutex: self })
    }

    fn lock_slow(&self, mut prev: u32) {
        if prev != CONTENDED {
            prev = self.state.swap(CONTENDED, Ordering::Acquire);
        }
        while prev != FREE {
            self.waitable.wait();
            // Mark contended again regardless of what we find: if someone
            // else grabbed the lock via the fast path while we were
            // parked, this tells their `unlock` a wake is still owed.
            prev = self.state.swap(CONTENDED, Ordering::Acquire);
        }
    }

    fn unlock(&self) {
        if self.state.fetch_sub(1, Ordering::Release) != HELD {
            self.state.store(FREE, Ordering::Release);
            if let Some(waiter) = self.waitable.wake_one() {
                crate::scheduling_group::ready_fiber(waiter);
            }
        }
    }
}

impl<T: ?Sized + Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// RAII guard returned by [`Mutex::lock`]/[`Mutex::try_lock`]; unlocks on
/// drop.
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    /// Returns the mutex this guard locks, for primitives built on top of
    /// `Mutex` (e.g. [`crate::sync::ConditionVariable`]) that need to drop
    /// and later re-acquire the lock around a suspension.
    pub(crate) fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // Safety: holding the guard means we own the lock.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: holding the guard means we own the lock.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber_api::{Fiber, FiberAttrs};
    use std::sync::Arc;

    #[test]
    fn uncontended_lock_unlock() {
        let m = Mutex::new(5);
        *m.lock() += 1;
        assert_eq!(*m.lock(), 6);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let m = Mutex::new(0);
        let g = m.lock();
        assert!(m.try_lock().is_none());
        drop(g);
        assert!(m.try_lock().is_some());
    }

    #[test]
    fn counter_torture_single_group() {
        crate::runtime::ensure_test_runtime();

        let counter = Arc::new(Mutex::new(0usize));
        let barrier = crate::sync::ExitBarrier::new(200);

        for _ in 0..200 {
            let counter = counter.clone();
            let barrier = barrier.clone();
            Fiber::spawn_detached(FiberAttrs::default(), move || {
                *counter.lock() += 1;
                barrier.count_down();
            });
        }

        barrier.wait();
        assert_eq!(*counter.lock(), 200);
    }
}
