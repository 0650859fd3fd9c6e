// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`FiberWorker`]: the OS thread that drains one [`crate::scheduling_group::SchedulingGroup`]'s
//! run queue.
//!
//! The loop is acquire-from-local-queue, then a bounded spin (capped across
//! the group at [`MAX_SPINNERS`] concurrent spinners), then a steal attempt
//! against a pre-built victim table with per-victim pacing, then parking on
//! the group's per-worker wait slot. Victim pacing and the spinner cap are
//! both named constants pulled over unchanged, tuned by measurement rather
//! than re-derived here.

use crate::entity::{FiberEntity, Resumed, Runnable};
use crate::scheduling_group::{self, SchedulingGroup};
use fastrand::FastRand;
use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

/// At most this many workers in a group spin-acquire concurrently; the rest
/// either find local work or go straight to stealing/parking.
const MAX_SPINNERS: u32 = 2;

/// Bounded spin budget, in poll iterations, before a spinning worker gives
/// up and moves on to stealing.
const MAX_CYCLES_TO_SPIN: u32 = 10_000;

thread_local! {
    static CURRENT_GROUP: Cell<Option<usize>> = const { Cell::new(None) };
}

/// The scheduling group index the calling OS thread is a worker of, if any.
/// `None` on any thread that isn't a fiber worker (e.g. the thread that
/// called [`crate::runtime::start_runtime`]).
pub(crate) fn current_group_index() -> Option<usize> {
    CURRENT_GROUP.with(Cell::get)
}

static GUARD_PAGES_ENABLED: AtomicBool = AtomicBool::new(true);

pub(crate) fn set_guard_pages_enabled(enabled: bool) {
    GUARD_PAGES_ENABLED.store(enabled, Ordering::Relaxed);
}

pub(crate) fn guard_pages_enabled_for(_group_index: usize) -> bool {
    GUARD_PAGES_ENABLED.load(Ordering::Relaxed)
}

/// One entry in a worker's victim table: a foreign group to steal from, and
/// how often (in local-loop ticks) to try it.
struct Victim {
    group: usize,
    pace: u32,
    next_tick: Cell<u32>,
}

/// Per-thread worker state. Not shared: only the OS thread running
/// [`run`] ever touches one of these.
pub(crate) struct FiberWorker {
    index: usize,
    group: Arc<SchedulingGroup>,
    victims: Vec<Victim>,
    rng: Cell<FastRand>,
    tick: Cell<u32>,
}

impl FiberWorker {
    /// Spawns the OS thread for worker `index` of `group`, binding it to
    /// `cpus` (a single CPU if migration is disallowed, the whole NUMA
    /// node's CPU set otherwise) and wiring up `victims` per the group's
    /// stealing graph.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        index: usize,
        group: Arc<SchedulingGroup>,
        cpus: Vec<usize>,
        victims: Vec<(usize, u32)>,
        seed: u64,
    ) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name(format!("fiber-rt-worker-{}-{}", group.index, index))
            .spawn(move || {
                crate::topology::bind_thread(&cpus);
                CURRENT_GROUP.with(|c| c.set(Some(group.index)));

                let worker = FiberWorker {
                    index,
                    group,
                    victims: victims
                        .into_iter()
                        .map(|(group, pace)| Victim {
                            group,
                            pace: pace.max(1),
                            next_tick: Cell::new(0),
                        })
                        .collect(),
                    rng: Cell::new(FastRand::from_seed(seed)),
                    tick: Cell::new(0),
                };
                worker.run();
            })
            .expect("failed to spawn fiber worker thread")
    }

    fn run(&self) {
        tracing::debug!(group = self.group.index, worker = self.index, "worker starting");

        loop {
            if self.group.is_stopped() {
                break;
            }

            let Some(runnable) = self.acquire() else {
                continue;
            };

            self.execute(runnable);
        }

        tracing::debug!(group = self.group.index, worker = self.index, "worker exiting");
    }

    /// One pass of acquire → spin → steal → sleep. Returns `None` (rather
    /// than looping internally) after a sleep so the caller re-checks the
    /// stop sentinel between attempts.
    fn acquire(&self) -> Option<Runnable> {
        if let Some(r) = self.group.run_queue.pop() {
            return Some(r);
        }

        if self.group.spinner_count() < MAX_SPINNERS {
            if let Some(r) = self.spin_acquire() {
                return Some(r);
            }
        }

        if let Some(r) = self.steal() {
            return Some(r);
        }

        self.sleep();
        None
    }

    fn spin_acquire(&self) -> Option<Runnable> {
        self.mark_spinning();
        let result = (0..MAX_CYCLES_TO_SPIN).find_map(|_| {
            if self.group.is_stopped() {
                return None;
            }
            let popped = self.group.run_queue.pop();
            if popped.is_none() {
                std::hint::spin_loop();
            }
            popped
        });
        self.clear_spinning();

        if result.is_some() {
            // Found work while spinning: nominate another worker to spin in
            // our place, so spinner population tracks load without growing
            // unbounded.
            self.group.wake_one_worker();
        }
        result
    }

    fn steal(&self) -> Option<Runnable> {
        self.tick.set(self.tick.get().wrapping_add(1));
        let tick = self.tick.get();

        for victim in &self.victims {
            if tick < victim.next_tick.get() {
                continue;
            }
            victim.next_tick.set(tick + victim.pace);

            if victim.group == self.group.index {
                continue;
            }
            if let Some(r) = scheduling_group::group(victim.group).run_queue.steal() {
                return Some(r);
            }
        }
        None
    }

    fn sleep(&self) {
        self.mark_sleeping();
        self.group.wait_slots[self.index].wait();
        self.clear_sleeping();
    }

    fn mark_spinning(&self) {
        self.group.set_spinning(self.index, true);
    }

    fn clear_spinning(&self) {
        self.group.set_spinning(self.index, false);
    }

    fn mark_sleeping(&self) {
        self.group.set_sleeping(self.index, true);
    }

    fn clear_sleeping(&self) {
        self.group.set_sleeping(self.index, false);
    }

    fn execute(&self, runnable: Runnable) {
        let entity = match runnable {
            Runnable::Entity(entity) => entity,
            Runnable::Desc(desc) => {
                FiberEntity::materialize(*desc, guard_pages_enabled_for(self.group.index))
            }
        };

        entity.set_scheduling_group_index(self.group.index);
        match entity.resume() {
            Resumed::Suspended | Resumed::Completed => {}
        }
    }
}
