// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An [`Event`](super::Event)-like gate that can additionally be opened by
//! an explicit [`OneshotTimedEvent::set`], whichever happens first.

use crate::timer::TimerId;
use crate::wait::Waitable;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Whether [`OneshotTimedEvent::wait`] returned because someone called
/// [`OneshotTimedEvent::set`] or because the deadline passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Set,
    TimedOut,
}

struct Shared {
    waitable: Waitable,
    opened_by_set: AtomicBool,
}

/// A one-shot gate that opens either when [`Self::set`] is called or when
/// `deadline` (given at construction) passes, whichever comes first.
///
/// Built on a ref-counted inner so the timer callback that may auto-open it
/// can hold its own `Arc` independent of this handle's lifetime.
pub struct OneshotTimedEvent {
    shared: Arc<Shared>,
    timer: TimerId,
}

impl OneshotTimedEvent {
    #[must_use]
    pub fn new(deadline: Instant) -> Self {
        let shared = Arc::new(Shared {
            waitable: Waitable::new(),
            opened_by_set: AtomicBool::new(false),
        });

        let timer_shared = shared.clone();
        let timer = crate::timer::set_timer(deadline, move || {
            for waiter in timer_shared.waitable.set_persistent_awakened() {
                crate::scheduling_group::ready_fiber(waiter);
            }
        });

        Self { shared, timer }
    }

    /// Opens the gate immediately. A no-op if the gate is already open
    /// (whether from a previous `set` or because the deadline already
    /// passed).
    pub fn set(&self) {
        self.shared.opened_by_set.store(true, Ordering::Release);
        for waiter in self.shared.waitable.set_persistent_awakened() {
            crate::scheduling_group::ready_fiber(waiter);
        }
        crate::timer::kill_timer(&self.timer);
    }

    /// Blocks the calling fiber until the gate opens, returning which side
    /// opened it. A `set` racing the deadline so closely that both would be
    /// a correct answer may report either; see `Waitable`'s CAS-arbitrated
    /// wake for why that ambiguity is inherent, not a bug.
    pub fn wait(&self) -> WaitResult {
        self.shared.waitable.wait();
        if self.shared.opened_by_set.load(Ordering::Acquire) {
            WaitResult::Set
        } else {
            WaitResult::TimedOut
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.shared.waitable.is_persistently_awakened()
    }
}

impl Drop for OneshotTimedEvent {
    fn drop(&mut self) {
        crate::timer::kill_timer(&self.timer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_open_reflects_set() {
        let e = OneshotTimedEvent::new(Instant::now() + std::time::Duration::from_secs(3600));
        assert!(!e.is_open());
        e.set();
        assert!(e.is_open());
    }
}
