// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! `StartRuntime` / `TerminateRuntime`: topology discovery, group/worker
//! construction, and the teardown ordering the rest of the crate depends on.
//!
//! Teardown order matters: groups are stopped (waking every parked worker),
//! timer workers are joined first since a timer callback may touch
//! fiber-worker state, and only then are the fiber worker threads joined.

use crate::config::{Plan, RuntimeConfig};
#[cfg(test)]
use crate::config::OptimizeFor;
use crate::error::ConfigError;
use crate::scheduling_group::{self, SchedulingGroup};
use crate::topology::Topology;
use crate::worker::FiberWorker;
use std::sync::{Mutex, Once, OnceLock};
use std::thread::JoinHandle;

struct Handles {
    workers: Vec<JoinHandle<()>>,
}

static HANDLES: OnceLock<Mutex<Option<Handles>>> = OnceLock::new();

/// Installs a `tracing-subscriber` `fmt` subscriber driven by `log_filter`
/// (or `RUST_LOG` if unset), once per process. Later calls are no-ops: a
/// global subscriber can only be installed once, and whichever runtime
/// configuration happens to call [`start_runtime`] first wins.
fn init_logging(log_filter: Option<&str>) {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = log_filter.map_or_else(
            tracing_subscriber::EnvFilter::from_default_env,
            tracing_subscriber::EnvFilter::new,
        );
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}

/// Starts the runtime: discovers topology, validates `config` against it,
/// builds every scheduling group and its workers, and returns once all
/// threads are up.
///
/// # Errors
///
/// Returns [`ConfigError`] if `config` is invalid for the discovered
/// topology. This is the only fallible step in the crate's happy path; it
/// runs before a single worker thread or fiber exists.
///
/// # Panics
///
/// Panics if called more than once in a process.
pub fn start_runtime(config: &RuntimeConfig) -> Result<(), ConfigError> {
    init_logging(config.log_filter.as_deref());

    let topology = Topology::discover()?;
    let plan = config.validate(&topology)?;

    crate::worker::set_guard_pages_enabled(plan.enable_guard_page);

    let groups = build_groups(&plan, &topology);
    scheduling_group::install_groups(groups.clone());

    let workers = build_workers(&plan, &groups);

    HANDLES
        .set(Mutex::new(Some(Handles { workers })))
        .unwrap_or_else(|_| panic!("start_runtime called more than once"));

    tracing::info!(
        groups = plan.groups,
        workers_per_group = plan.workers_per_group,
        numa_aware = plan.numa_aware,
        "runtime started"
    );

    Ok(())
}

/// Stops every scheduling group, joins all timer workers, then all fiber
/// workers, in that order.
///
/// # Panics
///
/// Panics if [`start_runtime`] was never called, or if called more than
/// once.
pub fn terminate_runtime() {
    for group in scheduling_group::groups() {
        group.stop();
    }

    for group in scheduling_group::groups() {
        group.timer_worker.shutdown();
    }

    let handles = HANDLES
        .get()
        .expect("terminate_runtime called before start_runtime")
        .lock()
        .unwrap()
        .take()
        .expect("terminate_runtime called more than once");

    for worker in handles.workers {
        let _ = worker.join();
    }

    tracing::info!("runtime terminated");
}

/// Total number of scheduling groups the runtime was started with.
#[must_use]
pub fn scheduling_group_count() -> usize {
    scheduling_group::group_count()
}

/// The scheduling group index the calling worker thread belongs to, or
/// `None` if the caller isn't a fiber worker thread.
#[must_use]
pub fn current_scheduling_group_index() -> Option<usize> {
    crate::worker::current_group_index()
}

/// Number of workers assigned to scheduling group `index`.
///
/// # Panics
///
/// Panics if `index` is out of range.
#[must_use]
pub fn scheduling_group_size(index: usize) -> usize {
    scheduling_group::group(index).size
}

/// NUMA node scheduling group `index` is bound to.
///
/// # Panics
///
/// Panics if `index` is out of range.
#[must_use]
pub fn scheduling_group_assigned_node(index: usize) -> usize {
    scheduling_group::group(index).numa_node
}

/// Starts a single, process-wide runtime the first time any test calls this,
/// and is a no-op on every subsequent call.
///
/// `start_runtime`/`terminate_runtime` are one-shot per process (see the
/// module docs on global state), but `cargo test` runs every `#[test]` in
/// one process, so tests that need a live runtime share this one instead of
/// each starting and tearing down their own. Nothing in this crate's test
/// suite calls [`terminate_runtime`]; the runtime simply lives for the rest
/// of the test binary.
#[cfg(test)]
pub(crate) fn ensure_test_runtime() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        start_runtime(&RuntimeConfig {
            concurrency_hint: Some(16),
            fiber_scheduling_optimize_for: OptimizeFor::Customized,
            scheduling_group_size: Some(16),
            ..Default::default()
        })
        .expect("test runtime configuration should always be valid");
    });
}

fn build_groups(plan: &Plan, topology: &Topology) -> Vec<std::sync::Arc<SchedulingGroup>> {
    let mut groups = Vec::with_capacity(plan.groups);
    let mut cpu_cursor = 0;

    for g in 0..plan.groups {
        let affinity: Vec<usize> = if plan.numa_aware && !topology.nodes.is_empty() {
            let node = &topology.nodes[g % topology.nodes.len()];
            node.cpus.clone()
        } else {
            let take = plan.workers_per_group.min(plan.accessible_cpus.len());
            let slice = plan
                .accessible_cpus
                .iter()
                .cycle()
                .skip(cpu_cursor)
                .take(take)
                .copied()
                .collect();
            cpu_cursor += take;
            slice
        };

        let numa_node = affinity.first().map_or(0, |&cpu| topology.node_of(cpu));

        groups.push(SchedulingGroup::new(
            g,
            plan.workers_per_group,
            plan.run_queue_size,
            affinity,
            numa_node,
        ));
    }

    groups
}

/// Builds a victim table for group `g`: every other group in the same NUMA
/// node paced by `work_stealing_ratio`, plus (if `cross_numa_work_stealing_ratio`
/// is nonzero) every group in a different node paced by that ratio.
fn victim_table(plan: &Plan, groups: &[std::sync::Arc<SchedulingGroup>], g: usize) -> Vec<(usize, u32)> {
    let my_node = groups[g].numa_node;
    let mut victims = Vec::new();

    for (other, group) in groups.iter().enumerate() {
        if other == g {
            continue;
        }
        if group.numa_node == my_node {
            victims.push((other, plan.work_stealing_ratio));
        } else if plan.cross_numa_work_stealing_ratio > 0 {
            victims.push((other, plan.cross_numa_work_stealing_ratio));
        }
    }

    victims
}

fn build_workers(
    plan: &Plan,
    groups: &[std::sync::Arc<SchedulingGroup>],
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(plan.groups * plan.workers_per_group);
    let mut seed_cursor: u64 = 0x9E37_79B9_7F4A_7C15;

    for (g, group) in groups.iter().enumerate() {
        let victims = victim_table(plan, groups, g);

        for w in 0..plan.workers_per_group {
            let cpus = if plan.disallow_cpu_migration {
                group
                    .affinity
                    .get(w)
                    .copied()
                    .into_iter()
                    .collect::<Vec<_>>()
            } else {
                group.affinity.clone()
            };

            seed_cursor = seed_cursor.wrapping_mul(0x2545_F491_4F6C_DD1D).wrapping_add(1);

            handles.push(FiberWorker::spawn(
                w,
                group.clone(),
                cpus,
                victims.clone(),
                seed_cursor,
            ));
        }
    }

    handles
}
