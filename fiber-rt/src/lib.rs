// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An M:N cooperative fiber scheduler: a fixed pool of OS worker threads
//! multiplexing many lightweight, stack-carrying fibers, plus the
//! synchronization primitives every fiber suspends on.
//!
//! Start here:
//! - [`start_runtime`] / [`terminate_runtime`] bring the whole thing up and
//!   down; see [`config::RuntimeConfig`] for what's tunable.
//! - [`Fiber::spawn`] / [`Fiber::spawn_detached`] create fibers; [`this_fiber`]
//!   holds the accessors usable only from inside one.
//! - [`sync`] holds the blocking primitives (`Mutex`, `ConditionVariable`,
//!   `Event`, ...) every one of them ultimately suspends through
//!   [`wait::Waitable`].
//! - [`set_timer`] / [`set_timer_periodic`] schedule a callback on a
//!   scheduling group's dedicated timer thread.
//!
//! None of these are usable before [`start_runtime`] has returned, and
//! [`Fiber`], [`this_fiber`], and every [`sync`] primitive additionally
//! require a current fiber context — see each item's docs for which ones
//! are the exception (plain OS thread callable).

mod config;
mod entity;
mod error;
mod execution_context;
mod fiber_api;
mod fls;
mod id;
mod run_queue;
mod runtime;
mod scheduling_group;
mod stack;
pub mod sync;
mod timer;
mod topology;
mod wait;
mod wait_slot;
mod worker;

pub use config::{OptimizeFor, RuntimeConfig};
pub use error::ConfigError;
pub use execution_context::ExecutionContext;
pub use fiber_api::{
    Async, Fiber, FiberAttrs, FiberLocal, LaunchPolicy, SchedulingGroupTarget,
    batch_spawn_detached, spawn_async, this_fiber,
};
pub use id::FiberId;
pub use runtime::{
    current_scheduling_group_index, scheduling_group_assigned_node, scheduling_group_count,
    scheduling_group_size, start_runtime, terminate_runtime,
};
pub use timer::{TimerId, TimerKiller, detach_timer, kill_timer, set_timer, set_timer_periodic};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// S1: a fiber that yields repeatedly completes after exactly that many
    /// yields and observes no scheduler-visible corruption of its own state
    /// across a migration.
    #[test]
    fn yield_preserves_fiber_state() {
        runtime::ensure_test_runtime();

        let barrier = sync::ExitBarrier::new(1);
        let yields_seen = Arc::new(AtomicUsize::new(0));
        let yields_seen2 = yields_seen.clone();
        let barrier2 = barrier.clone();

        Fiber::spawn_detached(FiberAttrs::default(), move || {
            for _ in 0..10 {
                this_fiber::yield_now();
                yields_seen2.fetch_add(1, Ordering::AcqRel);
            }
            barrier2.count_down();
        });

        barrier.wait();
        assert_eq!(yields_seen.load(Ordering::Acquire), 10);
    }

    /// S7: a batch-spawned cohort of detached fibers all run to completion.
    #[test]
    fn batch_spawn_runs_every_fiber() {
        runtime::ensure_test_runtime();

        let counter = Arc::new(AtomicUsize::new(0));
        let barrier = sync::ExitBarrier::new(1_000);

        batch_spawn_detached(&FiberAttrs::default(), 1_000, |_| {
            let counter = counter.clone();
            let barrier = barrier.clone();
            move || {
                counter.fetch_add(1, Ordering::AcqRel);
                barrier.count_down();
            }
        });

        barrier.wait();
        assert_eq!(counter.load(Ordering::Acquire), 1_000);
    }

    /// S8: a group-local fiber's scheduling group index never changes.
    #[test]
    fn group_local_fiber_stays_put() {
        runtime::ensure_test_runtime();

        let target_group = 0;
        let barrier = sync::ExitBarrier::new(1);
        let saw_other_group = Arc::new(AtomicUsize::new(0));
        let saw_other_group2 = saw_other_group.clone();
        let barrier2 = barrier.clone();

        Fiber::spawn_detached(
            FiberAttrs {
                scheduling_group: SchedulingGroupTarget::Index(target_group),
                scheduling_group_local: true,
                ..Default::default()
            },
            move || {
                for _ in 0..50 {
                    if current_scheduling_group_index() != Some(target_group) {
                        saw_other_group2.fetch_add(1, Ordering::AcqRel);
                    }
                    this_fiber::yield_now();
                }
                barrier2.count_down();
            },
        );

        barrier.wait();
        assert_eq!(saw_other_group.load(Ordering::Acquire), 0);
    }

    /// S4 (shrunk): `wait_until` on an unsignalled gate times out and
    /// observes the deadline has actually elapsed.
    #[test]
    fn timeout_path_observes_elapsed_deadline() {
        runtime::ensure_test_runtime();

        let barrier = sync::ExitBarrier::new(1);
        let barrier2 = barrier.clone();

        Fiber::spawn_detached(FiberAttrs::default(), move || {
            let gate = sync::OneshotTimedEvent::new(
                std::time::Instant::now() + Duration::from_millis(1),
            );
            let start = std::time::Instant::now();
            let result = gate.wait();
            assert_eq!(result, sync::WaitResult::TimedOut);
            assert!(start.elapsed() >= Duration::from_millis(1));
            barrier2.count_down();
        });

        barrier.wait();
    }
}
