// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A manual-reset event: `wait()` blocks until `set()`, after which every
//! past and future `wait()` returns immediately.

use crate::wait::Waitable;

/// Latched-open wakeup gate. Calling [`Self::set`] more than once is
/// equivalent to calling it once.
pub struct Event {
    waitable: Waitable,
}

impl Event {
    #[must_use]
    pub fn new() -> Self {
        Self {
            waitable: Waitable::new(),
        }
    }

    /// Blocks the calling fiber until [`Self::set`] has been (or is)
    /// called.
    pub fn wait(&self) {
        self.waitable.wait();
    }

    /// Latches the event open, waking every fiber currently blocked in
    /// [`Self::wait`]. Idempotent: calling this again is a no-op.
    pub fn set(&self) {
        if self.waitable.is_persistently_awakened() {
            return;
        }
        for waiter in self.waitable.set_persistent_awakened() {
            crate::scheduling_group::ready_fiber(waiter);
        }
    }

    /// Clears the latch, allowing the event to be waited on again.
    pub fn reset(&self) {
        self.waitable.reset_awakened();
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.waitable.is_persistently_awakened()
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_is_idempotent() {
        let e = Event::new();
        e.set();
        e.set();
        assert!(e.is_set());
    }

    #[test]
    fn reset_allows_rewaiting() {
        let e = Event::new();
        e.set();
        assert!(e.is_set());
        e.reset();
        assert!(!e.is_set());
    }
}
