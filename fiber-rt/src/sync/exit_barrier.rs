// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The latch a [`crate::Fiber`] handle waits on to implement `join`.
//!
//! One [`ExitBarrierInner`] is shared between a spawned fiber's
//! [`crate::entity::FiberDesc`]/[`crate::entity::FiberEntity`] and the
//! `Fiber` handle the spawner holds. The fiber counts it down exactly once,
//! from [`crate::entity::FiberEntity::resume`], after it has already
//! transitioned to `Dead` — so a joiner that observes the count reach zero is
//! guaranteed the fiber's stack has already been torn down.

use crate::wait::{WaitBlock, Waitable};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Public handle around a shared [`ExitBarrierInner`], for fan-out/fan-in
/// patterns where several independently spawned fibers all need to wait for
/// N others to finish (as opposed to the 1:1 barrier a single
/// [`crate::Fiber::join`] uses internally).
#[derive(Clone)]
pub struct ExitBarrier {
    inner: Arc<ExitBarrierInner>,
}

impl ExitBarrier {
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            inner: Arc::new(ExitBarrierInner::new(count)),
        }
    }

    pub fn count_down(&self) {
        self.inner.count_down();
    }

    pub fn wait(&self) {
        self.inner.wait();
    }
}

pub(crate) struct ExitBarrierInner {
    remaining: AtomicUsize,
    waitable: Waitable,
}

impl ExitBarrierInner {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(count),
            waitable: Waitable::new(),
        }
    }

    /// Decrements the count; when it reaches zero, wakes every fiber blocked
    /// in [`Self::wait`].
    pub(crate) fn count_down(&self) {
        let prev = self.remaining.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            for waiter in self.waitable.set_persistent_awakened() {
                crate::scheduling_group::ready_fiber(waiter);
            }
        }
    }

    fn is_zero(&self) -> bool {
        self.remaining.load(Ordering::Acquire) == 0
    }

    /// Blocks the calling fiber until the count reaches zero. A no-op if it
    /// already has.
    pub(crate) fn wait(&self) {
        if self.is_zero() {
            return;
        }

        let Some(entity) = crate::fiber_api::current_entity() else {
            // Called from outside any fiber (e.g. a plain OS thread joining a
            // detached-looking handle in a test); busy-poll instead of
            // suspending, since there is no fiber context to suspend.
            while !self.is_zero() {
                std::hint::spin_loop();
            }
            return;
        };

        let block = WaitBlock::new(entity.clone());
        let guard = entity.lock();
        // Safety: `block` lives on this stack frame until `halt_holding`
        // returns below.
        let added = unsafe { self.waitable.add_waiter(&block) };
        match added {
            Ok(()) => entity.halt_holding(guard),
            Err(_) => drop(guard),
        }
    }
}
