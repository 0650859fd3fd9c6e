//! Error types surfaced at the boundary of the runtime.
//!
//! Everything past startup either succeeds, retries silently, or is a
//! programming error that aborts with a diagnostic (see the module docs on
//! [`crate::scheduling_group`] for the run-queue overrun policy). The only
//! recoverable [`Result`] in the whole crate is [`ConfigError`], returned from
//! [`crate::config::RuntimeConfig::validate`] before any worker thread or fiber
//! exists.

use std::fmt;

/// A configuration value was invalid or mutually exclusive with another.
///
/// Returned by [`crate::config::RuntimeConfig::validate`] and
/// [`crate::runtime::start_runtime`]. All of these are caught before a single
/// worker thread is spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// `fiber_run_queue_size` was not a power of two.
    RunQueueCapacityNotPowerOfTwo(usize),
    /// More than 64 workers were requested for a single scheduling group.
    TooManyWorkersInGroup(usize),
    /// Both `fiber_worker_accessible_cpus` and `fiber_worker_inaccessible_cpus`
    /// were specified; only one may be set at a time.
    AccessibleAndInaccessibleBothSpecified,
    /// `fiber_worker_disallow_cpu_migration` was set, but the number of
    /// accessible CPUs did not match the requested worker count.
    InsufficientAccessibleCpusForPinning { workers: usize, accessible: usize },
    /// An accessible/inaccessible CPU index (after resolving negative,
    /// reverse-from-end indices) fell outside the topology's CPU range.
    CpuIndexOutOfRange(isize),
    /// `concurrency_hint` or `scheduling_group_size` was zero.
    ZeroWorkers,
    /// The host's CPU topology could not be read.
    TopologyUnavailable(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunQueueCapacityNotPowerOfTwo(n) => {
                write!(f, "fiber_run_queue_size ({n}) must be a power of two")
            }
            Self::TooManyWorkersInGroup(n) => {
                write!(f, "scheduling group requested {n} workers, limit is 64")
            }
            Self::AccessibleAndInaccessibleBothSpecified => write!(
                f,
                "fiber_worker_accessible_cpus and fiber_worker_inaccessible_cpus are mutually exclusive"
            ),
            Self::InsufficientAccessibleCpusForPinning { workers, accessible } => write!(
                f,
                "fiber_worker_disallow_cpu_migration requires exactly {workers} accessible cpus, found {accessible}"
            ),
            Self::CpuIndexOutOfRange(i) => write!(f, "cpu index {i} is out of range"),
            Self::ZeroWorkers => write!(f, "requested a scheduling group with zero workers"),
            Self::TopologyUnavailable(msg) => write!(f, "failed to read cpu topology: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
