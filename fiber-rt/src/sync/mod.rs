// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fiber-blocking synchronization primitives.
//!
//! Everything here is built on [`crate::wait::Waitable`] and
//! [`crate::entity::FiberEntity::halt_holding`]/[`crate::scheduling_group::ready_fiber`]:
//! a fiber that can't make progress suspends instead of spinning, and the
//! thread it was running on goes straight back to the scheduler to find other
//! work. None of these types are safe to use from a plain OS thread that
//! isn't running as a fiber worker; see each type's docs.

mod condvar;
pub(crate) mod exit_barrier;
mod event;
mod latch;
mod mutex;
mod oneshot_timed_event;
mod semaphore;
mod shared_mutex;
mod waitable_timer;

pub use condvar::ConditionVariable;
pub use event::Event;
pub use latch::Latch;
pub use mutex::Mutex;
pub use oneshot_timed_event::{OneshotTimedEvent, WaitResult};
pub use semaphore::CountingSemaphore;
pub use shared_mutex::SharedMutex;
pub use waitable_timer::WaitableTimer;

pub use exit_barrier::ExitBarrier;
