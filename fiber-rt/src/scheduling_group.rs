// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`SchedulingGroup`]: a run queue, a timer worker, and the spinner/sleeper
//! bookkeeping a group's workers coordinate through, plus the global group
//! registry every other module in this crate reaches into by index.
//!
//! Run-queue overrun is the one place this module can fail outright: a
//! `ReadyFiber` that still can't push after retrying for a bounded window
//! indicates a misconfigured or runaway producer, not a transient condition,
//! so it aborts rather than silently dropping a runnable fiber.

use crate::entity::{FiberDesc, FiberEntity, Runnable};
use crate::run_queue::RunQueue;
use crate::timer::TimerWorker;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// Bounded retry window for a `ReadyFiber` racing a full run queue before it
/// gives up and aborts the process. Hard-coded rather than exposed as
/// configuration, matching the upstream call on this knob.
const READY_RETRY_BUDGET: Duration = Duration::from_secs(5);

pub(crate) struct SchedulingGroup {
    pub(crate) index: usize,
    pub(crate) run_queue: RunQueue<Runnable>,
    pub(crate) wait_slots: Vec<crate::wait_slot::WaitSlot>,
    spinning_mask: AtomicU64,
    sleeping_mask: AtomicU64,
    pub(crate) timer_worker: Arc<TimerWorker>,
    pub(crate) affinity: Vec<usize>,
    pub(crate) numa_node: usize,
    pub(crate) size: usize,
    stopped: AtomicBool,
}

impl SchedulingGroup {
    pub(crate) fn new(
        index: usize,
        size: usize,
        run_queue_size: usize,
        affinity: Vec<usize>,
        numa_node: usize,
    ) -> Arc<Self> {
        let wait_slots = (0..size).map(|_| crate::wait_slot::WaitSlot::new()).collect();
        Arc::new(Self {
            index,
            run_queue: RunQueue::with_capacity(run_queue_size),
            wait_slots,
            spinning_mask: AtomicU64::new(0),
            sleeping_mask: AtomicU64::new(0),
            timer_worker: TimerWorker::spawn(index),
            affinity,
            numa_node,
            size,
            stopped: AtomicBool::new(false),
        })
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Sets the stop sentinel and persistently wakes every worker parked on
    /// this group's wait slots, so each worker loop observes the sentinel on
    /// its next `acquire` attempt and exits.
    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        for slot in &self.wait_slots {
            slot.notify();
        }
    }

    pub(crate) fn set_spinning(&self, worker: usize, on: bool) {
        if on {
            self.spinning_mask.fetch_or(1 << worker, Ordering::AcqRel);
        } else {
            self.spinning_mask.fetch_and(!(1 << worker), Ordering::AcqRel);
        }
    }

    pub(crate) fn spinner_count(&self) -> u32 {
        self.spinning_mask.load(Ordering::Acquire).count_ones()
    }

    pub(crate) fn set_sleeping(&self, worker: usize, on: bool) {
        if on {
            self.sleeping_mask.fetch_or(1 << worker, Ordering::AcqRel);
        } else {
            self.sleeping_mask.fetch_and(!(1 << worker), Ordering::AcqRel);
        }
    }

    /// Wakes at most one worker, preferring one already spinning (cheaper to
    /// rouse than one parked on a wait slot) over a deep sleeper. Also used
    /// to nominate a replacement spinner when a spinning worker finds work:
    /// the replacement is just whichever worker this would wake anyway.
    pub(crate) fn wake_one_worker(&self) {
        let spinning = self.spinning_mask.load(Ordering::Acquire);
        if spinning != 0 {
            // A spinning worker is already polling the queue on its own; no
            // further action needed for it to notice new work.
            return;
        }

        let sleeping = self.sleeping_mask.load(Ordering::Acquire);
        if sleeping == 0 {
            return;
        }
        let worker = sleeping.trailing_zeros() as usize;
        if self
            .sleeping_mask
            .compare_exchange(
                sleeping,
                sleeping & !(1 << worker),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            self.wait_slots[worker].notify();
        }
    }

    /// Transitions `f` to `Ready`, pushes it into the run queue, and wakes a
    /// worker. Aborts if the queue stays full past [`READY_RETRY_BUDGET`].
    pub(crate) fn ready_fiber(self: &Arc<Self>, entity: Arc<FiberEntity>) {
        use crate::entity::FiberState;

        entity.set_state(FiberState::Ready);
        let instealable = entity.scheduling_group_local;
        let mut runnable = Runnable::Entity(entity);

        let deadline = Instant::now() + READY_RETRY_BUDGET;
        loop {
            match self.run_queue.push_runnable(runnable, instealable) {
                Ok(()) => break,
                Err(rejected) => {
                    runnable = rejected;
                    if Instant::now() >= deadline {
                        tracing::error!(
                            group = self.index,
                            "run queue overrun past retry budget, aborting"
                        );
                        std::process::abort();
                    }
                    tracing::warn!(group = self.index, "run queue full, retrying push");
                    std::hint::spin_loop();
                }
            }
        }

        self.wake_one_worker();
    }

    pub(crate) fn post_desc(self: &Arc<Self>, desc: Box<FiberDesc>) {
        let instealable = desc.scheduling_group_local;
        let mut runnable = Runnable::Desc(desc);

        let deadline = Instant::now() + READY_RETRY_BUDGET;
        loop {
            match self.run_queue.push_runnable(runnable, instealable) {
                Ok(()) => break,
                Err(rejected) => {
                    runnable = rejected;
                    if Instant::now() >= deadline {
                        tracing::error!(
                            group = self.index,
                            "run queue overrun past retry budget, aborting"
                        );
                        std::process::abort();
                    }
                    std::hint::spin_loop();
                }
            }
        }

        self.wake_one_worker();
    }

    pub(crate) fn post_batch(self: &Arc<Self>, descs: Vec<Runnable>) {
        let instealable = descs.first().is_some_and(Runnable::scheduling_group_local);
        if let Err(_rejected) = self.run_queue.batch_push(descs, instealable) {
            tracing::warn!(
                group = self.index,
                "batch push rejected, falling back to a one-at-a-time ready retry budget is not \
                 applied to batches"
            );
            std::process::abort();
        }
        self.wake_one_worker();
    }
}

impl RunQueue<Runnable> {
    fn push_runnable(
        &self,
        runnable: Runnable,
        instealable: bool,
    ) -> Result<(), Runnable> {
        self.push(runnable, instealable)
            .map_err(|full| full.0)
    }
}

static GROUPS: OnceLock<Vec<Arc<SchedulingGroup>>> = OnceLock::new();

/// Installs the global group registry. Must be called exactly once, from
/// [`crate::runtime::start_runtime`], before any worker thread starts.
pub(crate) fn install_groups(groups: Vec<Arc<SchedulingGroup>>) {
    GROUPS
        .set(groups)
        .unwrap_or_else(|_| panic!("scheduling groups already installed"));
}

pub(crate) fn groups() -> &'static [Arc<SchedulingGroup>] {
    GROUPS.get().map_or(&[], Vec::as_slice)
}

pub(crate) fn group(index: usize) -> &'static Arc<SchedulingGroup> {
    &groups()[index]
}

pub(crate) fn group_count() -> usize {
    groups().len()
}

pub(crate) fn timer_worker(index: usize) -> Arc<TimerWorker> {
    group(index).timer_worker.clone()
}

/// Posts `runnable` to `group`'s run queue without waking the calling
/// fiber/thread; used for cross-group hand-off (`ready_fiber`) and fresh
/// spawns alike.
pub(crate) fn post(group_index: usize, runnable: Runnable) {
    match runnable {
        Runnable::Desc(desc) => group(group_index).post_desc(desc),
        Runnable::Entity(entity) => group(group_index).ready_fiber(entity),
    }
}

pub(crate) fn post_batch(group_index: usize, descs: Vec<Runnable>) {
    group(group_index).post_batch(descs);
}

/// Runs `desc` immediately on the calling thread up to its first suspension,
/// falling back to a plain post if the caller isn't itself a fiber worker
/// (there is no "current fiber" call stack to materialize onto).
pub(crate) fn dispatch(group_index: usize, desc: FiberDesc) {
    let entity = FiberEntity::materialize(
        desc,
        crate::worker::guard_pages_enabled_for(group_index),
    );
    entity.set_scheduling_group_index(group_index);
    match entity.resume() {
        crate::entity::Resumed::Suspended | crate::entity::Resumed::Completed => {}
    }
}

/// Readies an arbitrary fiber entity on its own scheduling group. Used by
/// wakers (timer callbacks, `Waitable::wake_one` clients) that don't hold
/// any particular group context of their own.
pub(crate) fn ready_fiber(entity: Arc<FiberEntity>) {
    let idx = entity.scheduling_group_index();
    group(idx).ready_fiber(entity);
}

/// Re-readies the calling fiber and returns control to the worker, giving
/// other ready work in the group a chance to run first.
pub(crate) fn yield_now() {
    let entity = crate::fiber_api::current_entity().expect("yield_now called outside a fiber");
    let guard = entity.lock();
    entity.yield_holding(guard);
}

/// Suspends the calling fiber until at least `deadline`, racing a timer
/// against nothing in particular: a sleep is just a wait on a `Waitable`
/// that the fiber itself never links any real waker to, so only the timer
/// side of the CAS can ever win.
pub(crate) fn sleep_until(deadline: Instant) {
    let waitable = crate::wait::Waitable::new();
    waitable.wait_until(deadline);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group_for_test(size: usize) -> Arc<SchedulingGroup> {
        SchedulingGroup::new(0, size, 16, (0..size).collect(), 0)
    }

    #[test]
    fn spinning_and_sleeping_masks_are_independent() {
        let g = group_for_test(4);
        g.set_spinning(1, true);
        g.set_sleeping(2, true);
        assert_eq!(g.spinner_count(), 1);
        g.set_spinning(1, false);
        assert_eq!(g.spinner_count(), 0);
        g.set_sleeping(2, false);
    }

    #[test]
    fn stop_flips_sentinel() {
        let g = group_for_test(2);
        assert!(!g.is_stopped());
        g.stop();
        assert!(g.is_stopped());
    }
}
