// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`FiberDesc`], the pre-stack descriptor pushed into a run queue before a
//! stack exists, and [`FiberEntity`], the materialized control block a
//! worker resumes.
//!
//! A run queue slot holds a [`Runnable`]: either variant, because a worker
//! popping a slot doesn't know up front whether it still needs to allocate a
//! stack before it can make progress.

use crate::fls::Storage;
use crate::id::FiberId;
use crate::stack::RuntimeStack;
use crate::sync::exit_barrier::ExitBarrierInner;
use fiber::{Fiber as RawFiber, FiberResult};
use spin::{Mutex as SpinMutex, MutexGuard};
use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::time::Instant;

/// A fiber's lifecycle state. See the invariants in the data model: exactly
/// one worker holds `scheduler_lock` during any transition between these.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FiberState {
    Ready = 0,
    Running = 1,
    Waiting = 2,
    Dead = 3,
}

impl FiberState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Ready,
            1 => Self::Running,
            2 => Self::Waiting,
            3 => Self::Dead,
            _ => unreachable!("invalid fiber state byte {v}"),
        }
    }
}

/// Pre-stack descriptor. Carries everything [`FiberEntity`] eventually will,
/// minus a materialized stack. Destroying one that was never dispatched to a
/// worker is a programming error (it would leak the exit barrier's count and
/// the caller's `start_proc`), so there is deliberately no safe `Drop` story
/// beyond the default one: callers own the invariant that every `FiberDesc`
/// reaches [`FiberEntity::materialize`] exactly once.
pub(crate) struct FiberDesc {
    pub(crate) id: FiberId,
    pub(crate) start_proc: Box<dyn FnOnce() + Send + 'static>,
    pub(crate) stack_size: usize,
    pub(crate) system_fiber: bool,
    pub(crate) scheduling_group_local: bool,
    pub(crate) scheduling_group: usize,
    pub(crate) exit_barrier: Option<Arc<ExitBarrierInner>>,
}

/// Either half of the sum type a run queue slot actually stores.
pub(crate) enum Runnable {
    Desc(Box<FiberDesc>),
    Entity(Arc<FiberEntity>),
}

impl Runnable {
    pub(crate) fn scheduling_group_local(&self) -> bool {
        match self {
            Self::Desc(d) => d.scheduling_group_local,
            Self::Entity(e) => e.scheduling_group_local,
        }
    }
}

type RawStackFiber = RawFiber<(), (), (), (), RuntimeStack>;

/// The control block of a live fiber, co-located conceptually (though not, in
/// this port, physically) with its stack: see `DESIGN.md` for why FLS is the
/// only piece actually kept next to the stack here.
pub(crate) struct FiberEntity {
    pub(crate) id: FiberId,
    state: AtomicU8,
    scheduler_lock: SpinMutex<()>,
    scheduling_group: AtomicUsize,
    pub(crate) scheduling_group_local: bool,
    pub(crate) system_fiber: bool,
    last_ready_tsc: AtomicU64,
    resume_proc: UnsafeCell<Option<Box<dyn FnOnce() + Send>>>,
    pub(crate) exit_barrier: Option<Arc<ExitBarrierInner>>,
    pub(crate) fls: Storage,
    raw: UnsafeCell<Option<RawStackFiber>>,
}

// Safety: `raw` and `resume_proc` are only ever accessed by the single
// worker thread currently resuming this entity (enforced by `scheduler_lock`
// protecting every state transition that hands the entity off), so sharing
// the `Arc` across threads is sound even though the cells themselves are not
// `Sync` on their own.
unsafe impl Sync for FiberEntity {}

pub(crate) enum Resumed {
    Suspended,
    Completed,
}

impl FiberEntity {
    /// Allocates a stack for `desc` and wraps its `start_proc` in a
    /// trampoline that installs the fiber's `Suspend` handle in a
    /// thread-local for the duration of the call, so that
    /// `this_fiber::{yield_now, sleep_*}` work without threading a context
    /// parameter through arbitrary user call stacks.
    pub(crate) fn materialize(desc: FiberDesc, enable_guard_page: bool) -> Arc<Self> {
        let stack_size = if desc.system_fiber {
            crate::stack::SYSTEM_STACK_SIZE
        } else {
            desc.stack_size
        };

        let stack = RuntimeStack::new(stack_size, desc.system_fiber, enable_guard_page)
            .expect("failed to allocate fiber stack");

        let entity = Arc::new(Self {
            id: desc.id,
            state: AtomicU8::new(FiberState::Ready as u8),
            scheduler_lock: SpinMutex::new(()),
            scheduling_group: AtomicUsize::new(desc.scheduling_group),
            scheduling_group_local: desc.scheduling_group_local,
            system_fiber: desc.system_fiber,
            last_ready_tsc: AtomicU64::new(now_tsc()),
            resume_proc: UnsafeCell::new(None),
            exit_barrier: desc.exit_barrier,
            fls: Storage::new(),
            raw: UnsafeCell::new(None),
        });

        let start_proc = desc.start_proc;
        let raw = RawFiber::with_stack(stack, move |(), suspend, _local: &()| {
            crate::fiber_api::install_current_suspend(suspend);
            start_proc();
            crate::fiber_api::clear_current_suspend();
        });

        // Safety: `entity` was just constructed; nothing else can observe
        // `raw` before this function returns it.
        unsafe {
            *entity.raw.get() = Some(raw);
        }
        entity
    }

    #[cfg(test)]
    pub(crate) fn new_detached_for_test() -> Arc<Self> {
        let desc = FiberDesc {
            id: FiberId::next(),
            start_proc: Box::new(|| {}),
            stack_size: crate::stack::SYSTEM_STACK_SIZE,
            system_fiber: true,
            scheduling_group_local: false,
            scheduling_group: 0,
            exit_barrier: None,
        };
        Self::materialize(desc, false)
    }

    /// Resumes this fiber on the calling (worker) thread, blocking until it
    /// either suspends on a waitable or runs to completion.
    pub(crate) fn resume(self: &Arc<Self>) -> Resumed {
        let prev = crate::fiber_api::set_current_entity(Some(self.clone()));
        self.state.store(FiberState::Running as u8, Ordering::Release);
        self.last_ready_tsc.store(now_tsc(), Ordering::Relaxed);

        let result = {
            // Safety: only the worker currently resuming this entity (this
            // call) accesses `raw`, and only for the duration of this block.
            let raw = unsafe { &mut *self.raw.get() };
            raw.as_mut()
                .expect("resumed a fiber whose stack was already released")
                .resume(())
        };

        crate::fiber_api::set_current_entity(prev);

        match result {
            FiberResult::Yield(()) => {
                if let Some(proc) = self.take_resume_proc() {
                    proc();
                }
                Resumed::Suspended
            }
            FiberResult::Return(()) => {
                self.state.store(FiberState::Dead as u8, Ordering::Release);
                if let Some(barrier) = &self.exit_barrier {
                    barrier.count_down();
                }
                // Safety: the fiber has returned from `start_proc` and will
                // never be resumed again; dropping its stack now is sound.
                unsafe {
                    *self.raw.get() = None;
                }
                Resumed::Completed
            }
        }
    }

    pub(crate) fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Acquires this fiber's `scheduler_lock`. Every state transition on this
    /// entity (readying it, halting it, marking it dead) must hold this for
    /// its duration.
    pub(crate) fn lock(&self) -> MutexGuard<'_, ()> {
        self.scheduler_lock.lock()
    }

    pub(crate) fn scheduling_group_index(&self) -> usize {
        self.scheduling_group.load(Ordering::Acquire)
    }

    pub(crate) fn set_scheduling_group_index(&self, idx: usize) {
        self.scheduling_group.store(idx, Ordering::Release);
    }

    pub(crate) fn last_ready_tsc(&self) -> u64 {
        self.last_ready_tsc.load(Ordering::Relaxed)
    }

    /// Sets the callback to run, on the resuming context, immediately after
    /// this fiber's next context switch away. Must be called by the fiber
    /// itself, with `scheduler_lock` held, right before suspending.
    pub(crate) fn set_resume_proc(&self, f: Box<dyn FnOnce() + Send>) {
        // Safety: only the fiber itself, about to suspend, writes this; the
        // worker that resumes the next entity is the only other party that
        // touches it, and only after this fiber has already suspended.
        unsafe {
            *self.resume_proc.get() = Some(f);
        }
    }

    fn take_resume_proc(&self) -> Option<Box<dyn FnOnce() + Send>> {
        // Safety: called by the worker immediately after `resume()` observed
        // this fiber suspend; no one else touches `resume_proc` concurrently.
        unsafe { (*self.resume_proc.get()).take() }
    }

    /// Suspends the calling fiber while holding `guard`, arranging for the
    /// lock to be released only after the context switch away from this
    /// fiber has actually completed.
    ///
    /// There is no literal master fiber in this port: every switch is a
    /// plain call/return through [`Self::resume`], so "after the switch" is
    /// expressed as a `resume_proc` the worker runs right after `resume`
    /// observes `FiberResult::Yield`. `guard` is forgotten here rather than
    /// dropped, and unlocked from that callback instead, so no other worker
    /// can observe this fiber as `Waiting`-but-unlocked while it is still
    /// executing on this stack.
    pub(crate) fn halt_holding(self: &Arc<Self>, guard: MutexGuard<'_, ()>) {
        self.suspend_holding(guard, FiberState::Waiting, |_| {});
    }

    /// Transitions to `Ready` and resumes the worker, arranging for the
    /// fiber to be pushed back onto its own scheduling group's run queue
    /// only after the switch away from it has completed — the same
    /// lock-release-after-switch shape as [`Self::halt_holding`], plus the
    /// re-enqueue [`Self::Yield`] additionally performs.
    pub(crate) fn yield_holding(self: &Arc<Self>, guard: MutexGuard<'_, ()>) {
        self.suspend_holding(guard, FiberState::Ready, |this| {
            crate::scheduling_group::ready_fiber(this);
        });
    }

    fn suspend_holding(
        self: &Arc<Self>,
        guard: MutexGuard<'_, ()>,
        next_state: FiberState,
        after_unlock: impl FnOnce(Arc<Self>) + Send + 'static,
    ) {
        self.set_state(next_state);
        std::mem::forget(guard);

        let this = self.clone();
        self.set_resume_proc(Box::new(move || {
            // Safety: `guard` was forgotten above without being dropped, and
            // no one else can be holding or releasing `scheduler_lock` for
            // this entity until this callback runs.
            unsafe {
                this.scheduler_lock.force_unlock();
            }
            after_unlock(this);
        }));

        crate::fiber_api::suspend_current();
    }
}

fn now_tsc() -> u64 {
    static EPOCH: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let epoch = *EPOCH.get_or_init(Instant::now);
    u64::try_from(Instant::now().saturating_duration_since(epoch).as_nanos()).unwrap_or(u64::MAX)
}
