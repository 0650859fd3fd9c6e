// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`Waitable`] and [`WaitBlock`]: the substrate every blocking primitive in
//! [`crate::sync`] is built on.
//!
//! A `WaitBlock` always lives on the suspending fiber's own call stack, for
//! exactly the duration of the suspension: the function that creates it does
//! not return until [`crate::entity::FiberEntity::halt_holding`] has resumed, by which
//! time the block has either been claimed and unlinked, or removed by the
//! fiber itself via [`Waitable::try_remove_waiter`]. This is what makes
//! storing a raw pointer to it in the `Waitable`'s wait list sound.

use crate::entity::FiberEntity;
use spin::Mutex;
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// One-shot, atomically-claimable node linking a suspended fiber into a
/// [`Waitable`]'s wait list.
pub(crate) struct WaitBlock {
    waiter: Arc<FiberEntity>,
    satisfied: AtomicBool,
}

impl WaitBlock {
    pub(crate) fn new(waiter: Arc<FiberEntity>) -> Self {
        Self {
            waiter,
            satisfied: AtomicBool::new(false),
        }
    }

    /// Attempts to claim this block for waking. Only the first caller to
    /// win this race may actually wake the fiber; everyone else must treat
    /// the block as already spoken for (e.g. a timeout racing a notify).
    fn try_claim(&self) -> bool {
        self.satisfied
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    fn is_satisfied(&self) -> bool {
        self.satisfied.load(Ordering::Acquire)
    }

    fn ptr(&self) -> NonNull<WaitBlock> {
        NonNull::from(self)
    }
}

/// Returned by [`Waitable::add_waiter`] when the waitable had already been
/// persistently awakened (e.g. an `Event` that was `Set` before `Wait` was
/// called). Per the error design, this is the one recoverable signal this
/// layer surfaces: the wait was satisfied immediately and the caller must
/// not suspend.
#[derive(Debug)]
pub(crate) struct AlreadySatisfied;

struct Inner {
    waiters: VecDeque<NonNull<WaitBlock>>,
    persistent_awakened: bool,
}

// Safety: `Inner`'s `NonNull` pointers are only ever dereferenced while
// holding `Waitable::lock`, and always point at `WaitBlock`s that are still
// alive (see module docs).
unsafe impl Send for Inner {}

/// Spinlock-guarded wait list backing every synchronization primitive in
/// [`crate::sync`].
pub(crate) struct Waitable {
    inner: Mutex<Inner>,
}

impl Waitable {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                waiters: VecDeque::new(),
                persistent_awakened: false,
            }),
        }
    }

    /// Links `block` into the wait list, unless the waitable has already
    /// been persistently awakened.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that `block` outlives any call that could
    /// observe it in the wait list, i.e. it must not return or be dropped
    /// until it has been unlinked (by a waker or by
    /// [`Self::try_remove_waiter`]).
    pub(crate) unsafe fn add_waiter(&self, block: &WaitBlock) -> Result<(), AlreadySatisfied> {
        let mut inner = self.inner.lock();
        if inner.persistent_awakened {
            return Err(AlreadySatisfied);
        }
        inner.waiters.push_back(block.ptr());
        Ok(())
    }

    /// Removes `block` from the wait list if it is still linked, e.g. when a
    /// timeout wins the race against a notification.
    ///
    /// Returns `true` if `block` was found and unlinked.
    pub(crate) fn try_remove_waiter(&self, block: &WaitBlock) -> bool {
        let mut inner = self.inner.lock();
        let target = block.ptr();
        if let Some(pos) = inner.waiters.iter().position(|p| *p == target) {
            inner.waiters.remove(pos);
            true
        } else {
            false
        }
    }

    /// Wakes (claims) at most one waiter, skipping any that a concurrent
    /// waker (e.g. a timer) already claimed. Returns the fiber to be readied
    /// by the caller; `Waitable` itself never touches the scheduler.
    pub(crate) fn wake_one(&self) -> Option<Arc<FiberEntity>> {
        let mut inner = self.inner.lock();
        while let Some(ptr) = inner.waiters.pop_front() {
            // Safety: still linked, so still alive per the module contract.
            let block = unsafe { ptr.as_ref() };
            if block.try_claim() {
                return Some(block.waiter.clone());
            }
            // Already claimed by someone else (e.g. a racing timeout); drop
            // it from the list and keep looking.
        }
        None
    }

    /// Sets the persistent-awakened flag and drains every remaining waiter,
    /// returning those that could be claimed. Used for "latched open"
    /// semantics: `Event::Set`, `ExitBarrier` reaching zero, timer expiry.
    pub(crate) fn set_persistent_awakened(&self) -> Vec<Arc<FiberEntity>> {
        let mut inner = self.inner.lock();
        inner.persistent_awakened = true;

        let mut woken = Vec::with_capacity(inner.waiters.len());
        while let Some(ptr) = inner.waiters.pop_front() {
            // Safety: still linked, so still alive per the module contract.
            let block = unsafe { ptr.as_ref() };
            if block.try_claim() {
                woken.push(block.waiter.clone());
            }
        }
        woken
    }

    /// Clears the persistent-awakened flag, allowing the waitable to be
    /// waited on again. Used by primitives that reuse one `Waitable` across
    /// multiple wait cycles (e.g. a `ConditionVariable`'s per-wait block is
    /// fresh, but a reusable one-shot gate needs an explicit reset).
    pub(crate) fn reset_awakened(&self) {
        self.inner.lock().persistent_awakened = false;
    }

    pub(crate) fn is_persistently_awakened(&self) -> bool {
        self.inner.lock().persistent_awakened
    }

    /// Blocks the calling fiber until some other party claims its wait
    /// block, e.g. via [`Self::wake_one`] or [`Self::set_persistent_awakened`].
    ///
    /// Must be called from inside a fiber; every [`crate::sync`] primitive
    /// built on `Waitable` documents that it cannot be used from a plain OS
    /// thread.
    pub(crate) fn wait(&self) {
        let entity =
            crate::fiber_api::current_entity().expect("Waitable::wait called outside a fiber");
        let block = WaitBlock::new(entity.clone());

        let guard = entity.lock();
        // Safety: `block` is not dropped or moved until `halt_holding`
        // returns below, by which point it has been unlinked either by a
        // waker or because it was never linked at all.
        match unsafe { self.add_waiter(&block) } {
            Ok(()) => entity.halt_holding(guard),
            Err(AlreadySatisfied) => drop(guard),
        }
    }

    /// Blocks the calling fiber until either it is woken or `deadline`
    /// elapses, racing a timer against the real wakeup. Returns `true` if
    /// woken before the deadline, `false` on timeout.
    ///
    /// Must be called from inside a fiber.
    pub(crate) fn wait_until(&self, deadline: Instant) -> bool {
        let entity = crate::fiber_api::current_entity()
            .expect("Waitable::wait_until called outside a fiber");
        // `block` is `Arc`-allocated rather than stack-local, unlike
        // `Self::wait`'s: a timer callback holds its own clone, so even if
        // this function has already returned (the real wake won the race)
        // by the time the timer fires and loses the CAS, it is still
        // touching a live allocation, not a freed stack frame. This is the
        // "held by a ref-counted pointer" shape every timer-backed waitable
        // in this crate uses.
        let block = Arc::new(WaitBlock::new(entity.clone()));
        let timed_out = Arc::new(AtomicBool::new(false));

        let guard = entity.lock();
        // Safety: `block` outlives the wait list's use of it: either a
        // waker unlinks it before this function returns (the `Ok` arm
        // below), or it is never linked at all (`AlreadySatisfied`), and the
        // timer callback that might outlive this call never touches the
        // wait list, only the block and flag it holds its own `Arc` to.
        match unsafe { self.add_waiter(&block) } {
            Err(AlreadySatisfied) => {
                drop(guard);
                return true;
            }
            Ok(()) => {}
        }

        let timer_block = block.clone();
        let timer_timed_out = timed_out.clone();
        let timer_id = crate::timer::set_timer(deadline, move || {
            if timer_block.try_claim_external() {
                timer_timed_out.store(true, Ordering::Release);
                crate::scheduling_group::ready_fiber(timer_block.waiter().clone());
            }
        });

        entity.halt_holding(guard);

        // We've resumed, so the block was claimed by one of the two racing
        // parties. If the real wake won, the block is already unlinked from
        // this waitable; if the timer is still in flight (lost the race for
        // the CAS but hasn't run its `if` check yet), it simply becomes a
        // no-op. A stale claimed block left linked after a real timeout is
        // harmless: `Self::wake_one` already tolerates and discards
        // already-claimed entries it pops.
        crate::timer::kill_timer(&timer_id);

        !timed_out.load(Ordering::Acquire)
    }
}

impl WaitBlock {
    pub(crate) fn is_claimed(&self) -> bool {
        self.is_satisfied()
    }

    pub(crate) fn try_claim_external(&self) -> bool {
        self.try_claim()
    }

    pub(crate) fn waiter(&self) -> &Arc<FiberEntity> {
        &self.waiter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::FiberEntity;

    fn dummy_entity() -> Arc<FiberEntity> {
        FiberEntity::new_detached_for_test()
    }

    #[test]
    fn add_then_wake() {
        let w = Waitable::new();
        let block = WaitBlock::new(dummy_entity());
        // Safety: block outlives the waitable use below.
        unsafe { w.add_waiter(&block).unwrap() };
        assert!(w.wake_one().is_some());
        assert!(w.wake_one().is_none());
    }

    #[test]
    fn persistent_awaken_rejects_new_waiters() {
        let w = Waitable::new();
        w.set_persistent_awakened();
        let block = WaitBlock::new(dummy_entity());
        // Safety: block outlives the waitable use below.
        let res = unsafe { w.add_waiter(&block) };
        assert!(res.is_err());
    }

    #[test]
    fn remove_before_wake() {
        let w = Waitable::new();
        let block = WaitBlock::new(dummy_entity());
        // Safety: block outlives the waitable use below.
        unsafe { w.add_waiter(&block).unwrap() };
        assert!(w.try_remove_waiter(&block));
        assert!(w.wake_one().is_none());
    }
}

/// Exercises the exact race `wait_until` depends on: a real wake and a
/// timeout both attempting to claim the same `WaitBlock` concurrently.
/// Exactly one must win; this is what lets the loser treat its half of the
/// race as a no-op instead of double-waking or double-timing-out a fiber.
#[cfg(all(loom, test))]
mod loom_tests {
    use super::*;
    use crate::entity::FiberEntity;
    use loom::sync::Arc as LoomArc;
    use loom::thread;

    #[test]
    fn exactly_one_claimant_wins_the_race() {
        loom::model(|| {
            let w = LoomArc::new(Waitable::new());
            let block = LoomArc::new(WaitBlock::new(FiberEntity::new_detached_for_test()));

            // Safety: `block` is kept alive by `LoomArc` until after both
            // threads below have joined.
            unsafe { w.add_waiter(&block).unwrap() };

            let wake_thread = {
                let w = w.clone();
                thread::spawn(move || w.wake_one().is_some())
            };
            let timeout_thread = {
                let block = block.clone();
                thread::spawn(move || block.try_claim_external())
            };

            let woken = wake_thread.join().unwrap();
            let timed_out = timeout_thread.join().unwrap();

            assert_ne!(woken, timed_out, "exactly one side of the race must win");
        });
    }
}
