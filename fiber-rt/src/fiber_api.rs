// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The public fiber handle, spawn attributes, `this_fiber` accessors, and
//! fiber-local storage.
//!
//! This module also owns the small set of thread-locals that let code
//! running inside a fiber find its own context without threading an explicit
//! parameter through arbitrary call stacks: the currently installed
//! [`fiber::Suspend`] handle and the currently resuming [`FiberEntity`]. Both
//! are written exactly once per context switch, from
//! [`FiberEntity::materialize`]'s trampoline and [`FiberEntity::resume`]
//! respectively, and read back by `this_fiber::*` and [`FiberLocal`].
//!
//! The accessor functions are marked `#[inline(never)]` so the compiler can't
//! hoist a load of the thread-local across a suspension point — a suspend
//! switches stacks out from under the optimizer's nose, so a cached value
//! from before the switch would be silently wrong.

use crate::entity::{FiberDesc, FiberEntity, Runnable};
use crate::execution_context::ExecutionContext;
use crate::id::FiberId;
use crate::sync::ExitBarrier;
use fiber::Suspend;
use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

thread_local! {
    static CURRENT_SUSPEND: Cell<*const Suspend<(), ()>> = const { Cell::new(std::ptr::null()) };
    static CURRENT_ENTITY: RefCell<Option<Arc<FiberEntity>>> = const { RefCell::new(None) };
}

#[inline(never)]
pub(crate) fn install_current_suspend(suspend: &Suspend<(), ()>) {
    CURRENT_SUSPEND.with(|c| c.set(std::ptr::from_ref(suspend)));
}

#[inline(never)]
pub(crate) fn clear_current_suspend() {
    CURRENT_SUSPEND.with(|c| c.set(std::ptr::null()));
}

/// Swaps in `entity` as the currently resuming fiber on this worker,
/// returning whatever was previously installed (so a nested `resume` driven
/// from within `resume_proc` can restore it).
#[inline(never)]
pub(crate) fn set_current_entity(entity: Option<Arc<FiberEntity>>) -> Option<Arc<FiberEntity>> {
    CURRENT_ENTITY.with(|c| c.replace(entity))
}

#[inline(never)]
pub(crate) fn current_entity() -> Option<Arc<FiberEntity>> {
    CURRENT_ENTITY.with(|c| c.borrow().clone())
}

/// Suspends the currently running fiber, returning control to the worker
/// thread that resumed it. Panics outside of a fiber's `start_proc`.
#[inline(never)]
pub(crate) fn suspend_current() {
    let ptr = CURRENT_SUSPEND.with(Cell::get);
    assert!(
        !ptr.is_null(),
        "this_fiber:: functions can only be called from inside a running fiber"
    );
    // Safety: `ptr` was installed by the trampoline that is still on this
    // thread's stack below us (we're either inside `start_proc` or inside a
    // nested call it made), so it remains valid for the duration of the
    // `suspend` call below.
    unsafe { (*ptr).suspend(()) };
}

/// How a newly spawned fiber should be handed to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LaunchPolicy {
    /// Enqueue the fiber and return immediately; a worker picks it up later.
    #[default]
    Post,
    /// Run the fiber immediately on the calling thread, up to its first
    /// suspension, before returning to the spawner.
    Dispatch,
}

/// Which scheduling group a fiber should run in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingGroupTarget {
    /// Pin to a specific group index.
    Index(usize),
    /// Let the runtime pick: the calling worker's own group if called from
    /// inside a fiber, otherwise group 0.
    #[default]
    NearestOrUnspecified,
}

/// Spawn-time configuration for a single fiber.
#[derive(Clone)]
pub struct FiberAttrs {
    pub launch_policy: LaunchPolicy,
    pub scheduling_group: SchedulingGroupTarget,
    pub execution_context: Option<ExecutionContext>,
    pub system_fiber: bool,
    pub scheduling_group_local: bool,
    pub stack_size: usize,
}

impl Default for FiberAttrs {
    fn default() -> Self {
        Self {
            launch_policy: LaunchPolicy::default(),
            scheduling_group: SchedulingGroupTarget::default(),
            execution_context: None,
            system_fiber: false,
            scheduling_group_local: false,
            stack_size: crate::stack::DEFAULT_USER_STACK_SIZE,
        }
    }
}

fn wrap_start_proc<F>(ctx: &Option<ExecutionContext>, f: F) -> Box<dyn FnOnce() + Send>
where
    F: FnOnce() + Send + 'static,
{
    match ctx {
        Some(ctx) => {
            let ctx = ctx.clone();
            Box::new(move || ctx.run(f))
        }
        None => Box::new(f),
    }
}

fn resolve_group_index(target: SchedulingGroupTarget) -> usize {
    match target {
        SchedulingGroupTarget::Index(i) => i,
        SchedulingGroupTarget::NearestOrUnspecified => {
            crate::worker::current_group_index().unwrap_or(0)
        }
    }
}

/// A handle to a spawned fiber, analogous to [`std::thread::JoinHandle`].
///
/// Dropping a `Fiber` without calling [`Fiber::join`] or [`Fiber::detach`] is
/// a programming error and panics, for the same reason leaking a
/// `JoinHandle` silently is usually a bug: it almost always means the
/// programmer forgot to decide what should happen to the fiber.
pub struct Fiber {
    exit_barrier: Option<Arc<crate::sync::exit_barrier::ExitBarrierInner>>,
}

impl Fiber {
    /// Spawns a new fiber and returns a joinable handle to it.
    pub fn spawn<F>(attrs: FiberAttrs, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let exit_barrier = Arc::new(crate::sync::exit_barrier::ExitBarrierInner::new(1));
        let group_index = resolve_group_index(attrs.scheduling_group);
        let wrapped = wrap_start_proc(&attrs.execution_context, f);

        let desc = FiberDesc {
            id: FiberId::next(),
            start_proc: wrapped,
            stack_size: attrs.stack_size,
            system_fiber: attrs.system_fiber,
            scheduling_group_local: attrs.scheduling_group_local,
            scheduling_group: group_index,
            exit_barrier: Some(exit_barrier.clone()),
        };

        dispatch_desc(attrs.launch_policy, group_index, desc);

        Self {
            exit_barrier: Some(exit_barrier),
        }
    }

    /// Spawns a fiber and immediately detaches it; equivalent to
    /// `Fiber::spawn(attrs, f).detach()` but without constructing a handle
    /// the caller has no use for.
    pub fn spawn_detached<F>(attrs: FiberAttrs, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let group_index = resolve_group_index(attrs.scheduling_group);
        let wrapped = wrap_start_proc(&attrs.execution_context, f);
        let desc = FiberDesc {
            id: FiberId::next(),
            start_proc: wrapped,
            stack_size: attrs.stack_size,
            system_fiber: attrs.system_fiber,
            scheduling_group_local: attrs.scheduling_group_local,
            scheduling_group: group_index,
            exit_barrier: None,
        };
        dispatch_desc(attrs.launch_policy, group_index, desc);
    }

    /// Blocks the calling fiber until this one completes.
    pub fn join(mut self) {
        let barrier = self
            .exit_barrier
            .take()
            .expect("join() called on a handle that was already joined or detached");
        barrier.wait();
    }

    /// Releases the handle without waiting; the fiber runs to completion on
    /// its own.
    pub fn detach(&mut self) {
        self.exit_barrier = None;
    }

    #[must_use]
    pub fn joinable(&self) -> bool {
        self.exit_barrier.is_some()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        assert!(
            self.exit_barrier.is_none(),
            "Fiber handle dropped without join() or detach()"
        );
    }
}

fn dispatch_desc(policy: LaunchPolicy, group_index: usize, desc: FiberDesc) {
    match policy {
        LaunchPolicy::Post => {
            crate::scheduling_group::post(group_index, Runnable::Desc(Box::new(desc)));
        }
        LaunchPolicy::Dispatch => {
            crate::scheduling_group::dispatch(group_index, desc);
        }
    }
}

/// Spawns `count` detached fibers in a single run-queue operation, avoiding
/// per-fiber enqueue contention when starting a large, uniform batch of
/// work (e.g. fanning a request out across shards).
pub fn batch_spawn_detached<F>(
    attrs: &FiberAttrs,
    count: usize,
    mut make: impl FnMut(usize) -> F,
) where
    F: FnOnce() + Send + 'static,
{
    let group_index = resolve_group_index(attrs.scheduling_group);
    let descs: Vec<Runnable> = (0..count)
        .map(|i| {
            let wrapped = wrap_start_proc(&attrs.execution_context, make(i));
            Runnable::Desc(Box::new(FiberDesc {
                id: FiberId::next(),
                start_proc: wrapped,
                stack_size: attrs.stack_size,
                system_fiber: attrs.system_fiber,
                scheduling_group_local: attrs.scheduling_group_local,
                scheduling_group: group_index,
                exit_barrier: None,
            }))
        })
        .collect();

    crate::scheduling_group::post_batch(group_index, descs);
}

/// A handle to the result of a fiber spawned with [`spawn_async`].
///
/// Built on a capacity-one [`std::sync::mpsc`] channel rather than a
/// bespoke future/promise type: this crate does not define its own future
/// type, and `mpsc` is otherwise the idiomatic way to hand a value from one
/// thread of control to another in this codebase.
pub struct Async<T> {
    rx: std::sync::mpsc::Receiver<T>,
}

impl<T> Async<T> {
    /// Blocks until the spawned fiber's closure returns, then yields its
    /// result.
    ///
    /// # Panics
    ///
    /// Panics if the fiber terminated (e.g. by unwinding) without producing
    /// a result.
    pub fn get(self) -> T {
        self.rx
            .recv()
            .expect("Async fiber exited without producing a result")
    }
}

/// Spawns a detached fiber running `f` and returns a handle that resolves to
/// its return value, so callers can treat "run this on a fiber and get the
/// answer back" as a single expression instead of manual spawn/join
/// plumbing around a shared `Mutex<Option<T>>`.
pub fn spawn_async<F, T>(attrs: FiberAttrs, f: F) -> Async<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = std::sync::mpsc::sync_channel(1);
    Fiber::spawn_detached(attrs, move || {
        let _ = tx.send(f());
    });
    Async { rx }
}

/// Accessors usable only from inside a running fiber's call stack.
pub mod this_fiber {
    use super::{Duration, Instant, current_entity, suspend_current};

    /// Yields the calling fiber back to the scheduler, re-readying it
    /// immediately; other ready work on this group gets a chance to run
    /// first.
    pub fn yield_now() {
        crate::scheduling_group::yield_now();
    }

    /// Suspends the calling fiber for at least `dur`.
    pub fn sleep_for(dur: Duration) {
        sleep_until(Instant::now() + dur);
    }

    /// Suspends the calling fiber until at least `deadline`.
    pub fn sleep_until(deadline: Instant) {
        crate::scheduling_group::sleep_until(deadline);
    }

    /// Returns the id of the calling fiber.
    ///
    /// # Panics
    ///
    /// Panics if called from outside a fiber.
    #[must_use]
    pub fn get_id() -> crate::id::FiberId {
        current_entity()
            .expect("this_fiber::get_id() called outside a fiber")
            .id
    }

    /// Low-level escape hatch equivalent to the suspend call every blocking
    /// primitive in [`crate::sync`] ultimately makes. Exposed for primitives
    /// built outside this crate on top of [`crate::wait`]'s building blocks.
    pub fn park() {
        suspend_current();
    }
}

static NEXT_FLS_SLOT: AtomicUsize = AtomicUsize::new(0);
static NEXT_TRIVIAL_FLS_SLOT: AtomicUsize = AtomicUsize::new(0);

/// Fiber-local storage: one independent value per fiber, default-constructed
/// on first access, analogous to [`std::thread::LocalKey`] but scoped to a
/// fiber's lifetime instead of an OS thread's.
pub struct FiberLocal<T: 'static> {
    slot: std::sync::OnceLock<usize>,
    trivial: bool,
    _marker: PhantomData<fn() -> T>,
}

// Safety: the only state is the lazily-assigned slot index, guarded by
// `OnceLock`; the `T` itself never actually lives in this struct.
unsafe impl<T> Sync for FiberLocal<T> {}

impl<T: Default + 'static> FiberLocal<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slot: std::sync::OnceLock::new(),
            trivial: false,
            _marker: PhantomData,
        }
    }

    /// Like [`Self::new`], but marks the slot as holding a type with no
    /// destructor side effects worth running, so a fiber's exit can skip it.
    /// Only use this for types where dropping late (at process exit, in the
    /// worst case) is truly harmless.
    #[must_use]
    pub const fn new_trivial() -> Self {
        Self {
            slot: std::sync::OnceLock::new(),
            trivial: true,
            _marker: PhantomData,
        }
    }

    fn slot_index(&self) -> usize {
        *self.slot.get_or_init(|| {
            if self.trivial {
                NEXT_TRIVIAL_FLS_SLOT.fetch_add(1, Ordering::Relaxed)
            } else {
                NEXT_FLS_SLOT.fetch_add(1, Ordering::Relaxed)
            }
        })
    }

    /// Runs `f` with a reference to this fiber's copy of the value.
    ///
    /// # Panics
    ///
    /// Panics if called from outside a fiber.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let entity =
            current_entity().expect("FiberLocal accessed from outside a fiber's call stack");
        let value = entity.fls.get_or_init(self.slot_index(), self.trivial, T::default);
        f(value)
    }
}

impl<T: Default + 'static> Default for FiberLocal<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn async_get_returns_closure_result() {
        crate::runtime::ensure_test_runtime();

        let handle = spawn_async(FiberAttrs::default(), || 2 + 2);
        assert_eq!(handle.get(), 4);
    }

    #[test]
    fn fiber_local_is_independent_per_fiber() {
        crate::runtime::ensure_test_runtime();

        static COUNTER: FiberLocal<std::cell::Cell<u32>> = FiberLocal::new_trivial();
        let barrier = crate::sync::ExitBarrier::new(2);
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));

        for start in [10u32, 20u32] {
            let barrier = barrier.clone();
            let seen = seen.clone();
            Fiber::spawn_detached(FiberAttrs::default(), move || {
                COUNTER.with(|c| c.set(start));
                this_fiber::yield_now();
                let value = COUNTER.with(std::cell::Cell::get);
                seen.lock().unwrap().push(value);
                barrier.count_down();
            });
        }

        barrier.wait();
        let mut values = seen.lock().unwrap().clone();
        values.sort_unstable();
        assert_eq!(values, vec![10, 20]);
    }
}
