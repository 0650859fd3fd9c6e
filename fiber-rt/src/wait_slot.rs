// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A tiny, one-shot counting wakeup primitive used by deep-sleeping workers.
//!
//! The counter starts at 1, so the first [`WaitSlot::wait`] a worker performs
//! never blocks: a freshly started group shouldn't have to pay for a park
//! round-trip before its first queue check. After that credit is spent,
//! `wait` parks, and `notify` is guaranteed to observe and wake a parked
//! thread: the state transition always happens before the parked thread is
//! consulted, so a `notify` racing a `wait` can never be lost. This plays the
//! role the design's futex-backed wait slot does; parking the thread via
//! [`std::thread::park`] is this codebase's stand-in for a raw futex wait.

use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::thread::Thread;

pub(crate) struct WaitSlot {
    state: AtomicI64,
    parked: Mutex<Option<Thread>>,
}

impl WaitSlot {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicI64::new(1),
            parked: Mutex::new(None),
        }
    }

    /// Wakes the worker waiting on this slot, if any. Never loses a wakeup:
    /// if no one is currently parked, the credit is simply banked for the
    /// next `wait`.
    pub(crate) fn notify(&self) {
        let prev = self.state.fetch_add(1, Ordering::AcqRel);
        if prev < 0 {
            if let Some(thread) = self.parked.lock().unwrap().take() {
                thread.unpark();
            }
        }
    }

    /// Consumes one credit, blocking the calling thread if none was
    /// available.
    pub(crate) fn wait(&self) {
        let prev = self.state.fetch_sub(1, Ordering::AcqRel);
        if prev > 0 {
            // There was a banked credit; return immediately.
            return;
        }

        *self.parked.lock().unwrap() = Some(std::thread::current());
        loop {
            if self.state.load(Ordering::Acquire) >= 0 {
                break;
            }
            std::thread::park();
        }
        *self.parked.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn first_wait_does_not_block() {
        let slot = WaitSlot::new();
        slot.wait();
    }

    #[test]
    fn notify_before_wait_is_not_lost() {
        let slot = Arc::new(WaitSlot::new());
        slot.wait(); // consume the initial credit
        slot.notify();
        slot.wait(); // must return immediately, not park forever
    }

    #[test]
    fn notify_wakes_parked_thread() {
        let slot = Arc::new(WaitSlot::new());
        slot.wait(); // consume the initial credit

        let waiter = {
            let slot = slot.clone();
            std::thread::spawn(move || slot.wait())
        };

        std::thread::sleep(Duration::from_millis(20));
        slot.notify();
        waiter.join().unwrap();
    }
}
