// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A reader/writer lock, writer-preferring to avoid reader starvation under
//! sustained contention.
//!
//! State is packed into one word: the low bit marks a writer active (or
//! waiting to become active), the rest of the word counts active readers.
//! Two `Waitable`s back the slow paths, one per role, so a released writer
//! wakes readers and a released last-reader wakes at most one writer without
//! either side spuriously waking the wrong role.

use crate::wait::Waitable;
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

const WRITER_BIT: usize = 1;
const READER_STEP: usize = 2;

pub struct SharedMutex<T: ?Sized> {
    state: AtomicUsize,
    /// Set while a writer holds or is waiting to take the lock, to make
    /// newly arriving readers queue behind it instead of starving it.
    writer_pending: AtomicUsize,
    readers: Waitable,
    writers: Waitable,
    data: UnsafeCell<T>,
}

// Safety: `data` is only reachable through the guards below, which enforce
// the usual shared-xor-exclusive discipline via `state`.
unsafe impl<T: ?Sized + Send> Send for SharedMutex<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for SharedMutex<T> {}

impl<T> SharedMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: AtomicUsize::new(0),
            writer_pending: AtomicUsize::new(0),
            readers: Waitable::new(),
            writers: Waitable::new(),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SharedMutex<T> {
    pub fn lock(&self) -> SharedMutexWriteGuard<'_, T> {
        loop {
            self.writer_pending.fetch_add(1, Ordering::AcqRel);
            if self
                .state
                .compare_exchange(0, WRITER_BIT, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.writer_pending.fetch_sub(1, Ordering::AcqRel);
                return SharedMutexWriteGuard { lock: self };
            }
            self.writers.wait();
            self.writer_pending.fetch_sub(1, Ordering::AcqRel);
        }
    }

    #[must_use]
    pub fn try_lock(&self) -> Option<SharedMutexWriteGuard<'_, T>> {
        self.state
            .compare_exchange(0, WRITER_BIT, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
            .then_some(SharedMutexWriteGuard { lock: self })
    }

    pub fn lock_shared(&self) -> SharedMutexReadGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock_shared() {
                return guard;
            }
            self.readers.wait();
        }
    }

    #[must_use]
    pub fn try_lock_shared(&self) -> Option<SharedMutexReadGuard<'_, T>> {
        if self.writer_pending.load(Ordering::Acquire) > 0 {
            return None;
        }

        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            if cur & WRITER_BIT != 0 {
                return None;
            }
            match self.state.compare_exchange_weak(
                cur,
                cur + READER_STEP,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(SharedMutexReadGuard { lock: self }),
                Err(actual) => cur = actual,
            }
        }
    }

    fn unlock_write(&self) {
        self.state.store(0, Ordering::Release);
        // Writer-preference: wake a waiting writer before any reader, if one
        // is queued.
        if self.writer_pending.load(Ordering::Acquire) > 0 {
            if let Some(waiter) = self.writers.wake_one() {
                crate::scheduling_group::ready_fiber(waiter);
                return;
            }
        }
        while let Some(waiter) = self.readers.wake_one() {
            crate::scheduling_group::ready_fiber(waiter);
        }
    }

    fn unlock_read(&self) {
        let prev = self.state.fetch_sub(READER_STEP, Ordering::AcqRel);
        if prev == READER_STEP {
            // Last reader out; a writer may be queued behind us.
            if let Some(waiter) = self.writers.wake_one() {
                crate::scheduling_group::ready_fiber(waiter);
            }
        }
    }
}

impl<T: ?Sized + Default> Default for SharedMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

pub struct SharedMutexWriteGuard<'a, T: ?Sized> {
    lock: &'a SharedMutex<T>,
}

impl<T: ?Sized> Deref for SharedMutexWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // Safety: holding the guard means exclusive access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SharedMutexWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: holding the guard means exclusive access.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SharedMutexWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock_write();
    }
}

pub struct SharedMutexReadGuard<'a, T: ?Sized> {
    lock: &'a SharedMutex<T>,
}

impl<T: ?Sized> Deref for SharedMutexReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // Safety: holding a read guard guarantees no writer is active.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SharedMutexReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock_read();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_then_shared() {
        let m = SharedMutex::new(5);
        {
            let mut w = m.lock();
            *w += 1;
        }
        {
            let r1 = m.lock_shared();
            let r2 = m.lock_shared();
            assert_eq!(*r1, 6);
            assert_eq!(*r2, 6);
        }
    }

    #[test]
    fn try_lock_shared_fails_while_written() {
        let m = SharedMutex::new(0);
        let w = m.lock();
        assert!(m.try_lock_shared().is_none());
        drop(w);
        assert!(m.try_lock_shared().is_some());
    }

    #[test]
    fn try_lock_fails_while_read_locked() {
        let m = SharedMutex::new(0);
        let r = m.lock_shared();
        assert!(m.try_lock().is_none());
        drop(r);
        assert!(m.try_lock().is_some());
    }
}
