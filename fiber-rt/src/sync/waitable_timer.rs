// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`WaitableTimer`]: like [`super::OneshotTimedEvent`] but with no explicit
//! `set` — the only way it opens is the timer firing.

use crate::timer::TimerId;
use crate::wait::Waitable;
use std::sync::Arc;
use std::time::Instant;

struct Shared {
    waitable: Waitable,
}

/// A gate that opens exclusively when `deadline` (given at construction)
/// passes. Unlike [`super::OneshotTimedEvent`] there is no way to open it
/// early; it exists for callers that want a waitable handle to a future
/// instant without the bookkeeping an explicit `set` would need.
pub struct WaitableTimer {
    shared: Arc<Shared>,
    timer: TimerId,
}

impl WaitableTimer {
    #[must_use]
    pub fn new(deadline: Instant) -> Self {
        let shared = Arc::new(Shared {
            waitable: Waitable::new(),
        });

        let timer_shared = shared.clone();
        let timer = crate::timer::set_timer(deadline, move || {
            for waiter in timer_shared.waitable.set_persistent_awakened() {
                crate::scheduling_group::ready_fiber(waiter);
            }
        });

        Self { shared, timer }
    }

    /// Blocks the calling fiber until `deadline` passes.
    pub fn wait(&self) {
        self.shared.waitable.wait();
    }

    #[must_use]
    pub fn has_fired(&self) -> bool {
        self.shared.waitable.is_persistently_awakened()
    }
}

impl Drop for WaitableTimer {
    fn drop(&mut self) {
        crate::timer::kill_timer(&self.timer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn has_not_fired_before_deadline() {
        let t = WaitableTimer::new(Instant::now() + Duration::from_secs(3600));
        assert!(!t.has_fired());
    }
}
