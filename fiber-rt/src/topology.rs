// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! CPU topology discovery.
//!
//! Discovery is deliberately shallow: we need a CPU count and, when
//! `numa_aware` is set, a grouping of those CPUs into NUMA nodes. Binding a
//! thread to the result happens in [`crate::worker`]; this module only
//! describes what's there.

use crate::error::ConfigError;

/// A single NUMA node and the CPU indices that belong to it.
#[derive(Debug, Clone)]
pub(crate) struct NumaNode {
    pub(crate) cpus: Vec<usize>,
}

/// The host's CPU topology, as far as this crate cares about it.
#[derive(Debug, Clone)]
pub(crate) struct Topology {
    pub(crate) cpus: Vec<usize>,
    pub(crate) nodes: Vec<NumaNode>,
}

impl Topology {
    /// Discovers the current host's topology.
    ///
    /// On Linux this walks `/sys/devices/system/node/node*/cpulist` to build
    /// NUMA groupings; everywhere else (and if that fails) all CPUs are
    /// reported as a single node, which degrades `numa_aware` to a no-op.
    pub(crate) fn discover() -> Result<Self, ConfigError> {
        let cpus: Vec<usize> = (0..available_parallelism()?).collect();

        let nodes = discover_numa_nodes(&cpus).unwrap_or_else(|| {
            vec![NumaNode {
                cpus: cpus.clone(),
            }]
        });

        Ok(Self { cpus, nodes })
    }

    #[cfg(test)]
    pub(crate) fn for_test(num_cpus: usize, num_nodes: usize) -> Self {
        let cpus: Vec<usize> = (0..num_cpus).collect();
        let per_node = num_cpus.div_ceil(num_nodes.max(1));
        let nodes = cpus
            .chunks(per_node.max(1))
            .map(|chunk| NumaNode {
                cpus: chunk.to_vec(),
            })
            .collect();
        Self { cpus, nodes }
    }

    /// Returns the NUMA node index that owns `cpu`, defaulting to node 0.
    pub(crate) fn node_of(&self, cpu: usize) -> usize {
        self.nodes
            .iter()
            .position(|node| node.cpus.contains(&cpu))
            .unwrap_or(0)
    }
}

fn available_parallelism() -> Result<usize, ConfigError> {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .map_err(|e| ConfigError::TopologyUnavailable(e.to_string()))
}

#[cfg(target_os = "linux")]
fn discover_numa_nodes(cpus: &[usize]) -> Option<Vec<NumaNode>> {
    let mut nodes = Vec::new();
    let mut node_idx = 0;

    loop {
        let path = format!("/sys/devices/system/node/node{node_idx}/cpulist");
        let Ok(contents) = std::fs::read_to_string(&path) else {
            break;
        };

        let node_cpus: Vec<usize> = contents
            .trim()
            .split(',')
            .flat_map(|part| {
                let mut bounds = part.splitn(2, '-');
                let lo: usize = bounds.next()?.parse().ok()?;
                let hi: usize = bounds.next().map_or(Ok(lo), str::parse).ok()?;
                Some(lo..=hi)
            })
            .flatten()
            .filter(|c| cpus.contains(c))
            .collect();

        if !node_cpus.is_empty() {
            nodes.push(NumaNode { cpus: node_cpus });
        }
        node_idx += 1;
    }

    if nodes.is_empty() { None } else { Some(nodes) }
}

#[cfg(not(target_os = "linux"))]
fn discover_numa_nodes(_cpus: &[usize]) -> Option<Vec<NumaNode>> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_test_splits_cpus_evenly_across_nodes() {
        let topo = Topology::for_test(8, 2);
        assert_eq!(topo.cpus.len(), 8);
        assert_eq!(topo.nodes.len(), 2);
        assert_eq!(topo.node_of(0), 0);
        assert_eq!(topo.node_of(7), 1);
    }

    #[test]
    fn node_of_unknown_cpu_defaults_to_zero() {
        let topo = Topology::for_test(4, 1);
        assert_eq!(topo.node_of(999), 0);
    }

    #[test]
    fn discover_reports_at_least_one_cpu_and_node() {
        let topo = Topology::discover().unwrap();
        assert!(!topo.cpus.is_empty());
        assert!(!topo.nodes.is_empty());
    }
}

/// Pins the calling thread to a single CPU, or binds it to the set of CPUs
/// belonging to a NUMA node. A no-op on platforms without an affinity API.
pub(crate) fn bind_thread(cpus: &[usize]) {
    #[cfg(target_os = "linux")]
    {
        // Safety: `set` is a plain stack value whose address we pass to libc
        // and do not retain past the call.
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            for &cpu in cpus {
                libc::CPU_SET(cpu, &mut set);
            }
            let ret = libc::sched_setaffinity(
                0,
                size_of::<libc::cpu_set_t>(),
                std::ptr::addr_of!(set),
            );
            if ret != 0 {
                tracing::warn!(
                    ?cpus,
                    error = %std::io::Error::last_os_error(),
                    "failed to bind worker thread to cpu set"
                );
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = cpus;
    }
}
