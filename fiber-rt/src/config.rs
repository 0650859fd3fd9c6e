// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Runtime configuration surface.
//!
//! Every field here is validated once, in [`RuntimeConfig::validate`], before
//! [`crate::start_runtime`] creates a single worker thread. Nothing past that
//! point consults `RuntimeConfig` again: the resolved [`Plan`] is what the
//! runtime actually builds from.

use crate::error::ConfigError;
use crate::topology::Topology;

/// Named sizing profile for `fiber_scheduling_optimize_for`.
///
/// Each profile picks a `(groups, workers_per_group, numa_aware)` triple from
/// the discovered topology. `Customized` defers entirely to
/// [`RuntimeConfig::scheduling_group_size`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptimizeFor {
    /// One scheduling group per NUMA node, one worker per physical core.
    ComputeHeavy,
    /// One scheduling group per NUMA node, sized for typical compute workloads.
    #[default]
    Compute,
    /// A balance between compute and I/O bound workloads.
    Neutral,
    /// Favors many small groups to reduce tail latency on blocking I/O.
    Io,
    /// Still more, smaller groups than `Io`.
    IoHeavy,
    /// Use `scheduling_group_size` verbatim; `numa_aware` is honored as given.
    Customized,
}

/// User-facing runtime configuration.
///
/// Field names intentionally mirror the options table callers already know
/// from the configuration file: `concurrency_hint`, `numa_aware`, and so on.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub concurrency_hint: Option<usize>,
    pub scheduling_group_size: Option<usize>,
    pub numa_aware: bool,
    pub fiber_worker_accessible_cpus: Option<String>,
    pub fiber_worker_inaccessible_cpus: Option<String>,
    pub fiber_worker_disallow_cpu_migration: bool,
    pub work_stealing_ratio: u32,
    pub cross_numa_work_stealing_ratio: u32,
    pub fiber_scheduling_optimize_for: OptimizeFor,
    pub fiber_run_queue_size: usize,
    pub fiber_stack_enable_guard_page: bool,
    /// `tracing-subscriber` `EnvFilter` directive string for this runtime's
    /// own diagnostic logging, e.g. `"fiber_rt=debug,warn"`. `None` falls
    /// back to the `RUST_LOG` environment variable. Only the first call to
    /// [`crate::start_runtime`] in a process actually installs a subscriber;
    /// later calls' `log_filter` is ignored, matching `tracing`'s
    /// one-subscriber-per-process rule.
    pub log_filter: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            concurrency_hint: None,
            scheduling_group_size: None,
            numa_aware: false,
            fiber_worker_accessible_cpus: None,
            fiber_worker_inaccessible_cpus: None,
            fiber_worker_disallow_cpu_migration: false,
            work_stealing_ratio: 16,
            cross_numa_work_stealing_ratio: 0,
            fiber_scheduling_optimize_for: OptimizeFor::default(),
            fiber_run_queue_size: 4096,
            fiber_stack_enable_guard_page: true,
            log_filter: None,
        }
    }
}

/// A fully resolved, validated plan for how many groups and workers to start.
///
/// Produced once by [`RuntimeConfig::validate`] and consumed by
/// [`crate::runtime::start_runtime`]; nothing downstream re-derives these
/// numbers from the raw config.
#[derive(Debug, Clone)]
pub(crate) struct Plan {
    pub(crate) groups: usize,
    pub(crate) workers_per_group: usize,
    pub(crate) numa_aware: bool,
    pub(crate) disallow_cpu_migration: bool,
    pub(crate) accessible_cpus: Vec<usize>,
    pub(crate) run_queue_size: usize,
    pub(crate) work_stealing_ratio: u32,
    pub(crate) cross_numa_work_stealing_ratio: u32,
    pub(crate) enable_guard_page: bool,
}

pub(crate) const MAX_WORKERS_PER_GROUP: usize = 64;

impl RuntimeConfig {
    /// Validates the configuration against the discovered topology, returning
    /// a [`Plan`] the runtime can build groups and workers from.
    ///
    /// This is the *only* fallible step in the whole crate's happy path.
    /// Every configuration error named in §7 of the design is caught here,
    /// before a single worker thread exists.
    pub(crate) fn validate(&self, topology: &Topology) -> Result<Plan, ConfigError> {
        if !self.fiber_run_queue_size.is_power_of_two() {
            return Err(ConfigError::RunQueueCapacityNotPowerOfTwo(
                self.fiber_run_queue_size,
            ));
        }

        if self.fiber_worker_accessible_cpus.is_some()
            && self.fiber_worker_inaccessible_cpus.is_some()
        {
            return Err(ConfigError::AccessibleAndInaccessibleBothSpecified);
        }

        let accessible_cpus = self.resolve_accessible_cpus(topology)?;

        let concurrency = self
            .concurrency_hint
            .unwrap_or(accessible_cpus.len())
            .max(1);
        if concurrency == 0 {
            return Err(ConfigError::ZeroWorkers);
        }

        let (groups, workers_per_group, numa_aware) =
            self.resolve_sizing(topology, concurrency)?;

        if workers_per_group == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if workers_per_group > MAX_WORKERS_PER_GROUP {
            return Err(ConfigError::TooManyWorkersInGroup(workers_per_group));
        }

        if self.fiber_worker_disallow_cpu_migration {
            let needed = groups * workers_per_group;
            if accessible_cpus.len() != needed {
                return Err(ConfigError::InsufficientAccessibleCpusForPinning {
                    workers: needed,
                    accessible: accessible_cpus.len(),
                });
            }
        }

        Ok(Plan {
            groups,
            workers_per_group,
            numa_aware,
            disallow_cpu_migration: self.fiber_worker_disallow_cpu_migration,
            accessible_cpus,
            run_queue_size: self.fiber_run_queue_size,
            work_stealing_ratio: self.work_stealing_ratio.max(1),
            cross_numa_work_stealing_ratio: self.cross_numa_work_stealing_ratio,
            enable_guard_page: self.fiber_stack_enable_guard_page,
        })
    }

    fn resolve_accessible_cpus(&self, topology: &Topology) -> Result<Vec<usize>, ConfigError> {
        let total = topology.cpus.len();

        if let Some(spec) = &self.fiber_worker_accessible_cpus {
            return parse_cpu_list(spec, total);
        }

        if let Some(spec) = &self.fiber_worker_inaccessible_cpus {
            let excluded = parse_cpu_list(spec, total)?;
            return Ok((0..total).filter(|cpu| !excluded.contains(cpu)).collect());
        }

        Ok((0..total).collect())
    }

    fn resolve_sizing(
        &self,
        topology: &Topology,
        concurrency: usize,
    ) -> Result<(usize, usize, bool), ConfigError> {
        use OptimizeFor::{Compute, ComputeHeavy, Customized, Io, IoHeavy, Neutral};

        if matches!(self.fiber_scheduling_optimize_for, Customized) {
            let size = self.scheduling_group_size.unwrap_or(concurrency).max(1);
            let groups = concurrency.div_ceil(size).max(1);
            return Ok((groups, size, self.numa_aware));
        }

        let nodes = topology.nodes.len().max(1);
        let per_node = (concurrency / nodes).max(1);

        let (groups, workers_per_group, numa_aware) = match self.fiber_scheduling_optimize_for {
            ComputeHeavy => (nodes, per_node, true),
            Compute => (nodes, per_node, self.numa_aware || nodes > 1),
            Neutral => (nodes.max(1), (per_node / 2).max(1), self.numa_aware),
            Io => (nodes * 2, (per_node / 2).max(1), false),
            IoHeavy => (nodes * 4, (per_node / 4).max(1), false),
            Customized => unreachable!("handled above"),
        };

        Ok((groups, workers_per_group, numa_aware))
    }
}

/// Parses a comma-separated CPU list, supporting `a-b` ranges and negative,
/// reverse-from-end indices (`-1` is the last CPU).
fn parse_cpu_list(spec: &str, total: usize) -> Result<Vec<usize>, ConfigError> {
    let mut out = Vec::new();

    for part in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        // The range separator is a `-` preceded by a digit, which is what
        // distinguishes "0-3" (a range) from "-1" (a negative index) and
        // "-2--1" (a range between two negative indices) without ambiguity.
        let sep = part
            .char_indices()
            .skip(1)
            .find(|&(i, c)| c == '-' && part.as_bytes()[i - 1].is_ascii_digit())
            .map(|(i, _)| i);

        if let Some(i) = sep {
            let lo = resolve_index(&part[..i], total)?;
            let hi = resolve_index(&part[i + 1..], total)?;
            if lo > hi {
                #[allow(clippy::cast_possible_wrap, reason = "cpu indices never approach isize::MAX")]
                return Err(ConfigError::CpuIndexOutOfRange(lo as isize));
            }
            out.extend(lo..=hi);
        } else {
            out.push(resolve_index(part, total)?);
        }
    }

    out.sort_unstable();
    out.dedup();
    Ok(out)
}

fn resolve_index(raw: &str, total: usize) -> Result<usize, ConfigError> {
    let idx: isize = raw
        .parse()
        .map_err(|_| ConfigError::CpuIndexOutOfRange(0))?;

    #[allow(clippy::cast_possible_wrap, reason = "cpu counts never approach isize::MAX")]
    let resolved = if idx < 0 {
        total as isize + idx
    } else {
        idx
    };

    #[allow(clippy::cast_sign_loss, reason = "checked non-negative on the line above")]
    if resolved < 0 || resolved as usize >= total {
        return Err(ConfigError::CpuIndexOutOfRange(idx));
    }

    #[allow(clippy::cast_sign_loss, reason = "checked non-negative above")]
    Ok(resolved as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_list() {
        assert_eq!(parse_cpu_list("0,1,2", 8).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn parses_ranges() {
        assert_eq!(parse_cpu_list("0-3", 8).unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn parses_negative_indices() {
        assert_eq!(parse_cpu_list("-1", 8).unwrap(), vec![7]);
        assert_eq!(parse_cpu_list("-2--1", 8).unwrap(), vec![6, 7]);
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(parse_cpu_list("99", 8).is_err());
    }

    #[test]
    fn rejects_non_power_of_two_queue() {
        let cfg = RuntimeConfig {
            fiber_run_queue_size: 100,
            ..Default::default()
        };
        let topo = Topology::for_test(4, 1);
        assert_eq!(
            cfg.validate(&topo),
            Err(ConfigError::RunQueueCapacityNotPowerOfTwo(100))
        );
    }

    #[test]
    fn rejects_pinning_with_mismatched_cpu_count() {
        let cfg = RuntimeConfig {
            fiber_worker_disallow_cpu_migration: true,
            concurrency_hint: Some(4),
            fiber_worker_accessible_cpus: Some("0-1".to_string()),
            ..Default::default()
        };
        let topo = Topology::for_test(8, 1);
        assert!(matches!(
            cfg.validate(&topo),
            Err(ConfigError::InsufficientAccessibleCpusForPinning { .. })
        ));
    }
}
