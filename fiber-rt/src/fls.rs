// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fiber-local storage.
//!
//! Slots are indexed by a process-wide counter handed out in
//! [`crate::fiber_api::FiberLocal::new`]. The first [`INLINE_SLOTS`] slots of
//! each kind live inline in [`Storage`]; anything past that overflows into a
//! `HashMap`. Trivial and non-trivial slots use separate index spaces (and
//! separate arrays/maps) purely so a fiber exiting can skip running
//! destructors over the trivial half.
//!
//! A `Storage` is only ever touched by the fiber that owns it, so none of
//! this needs synchronization.

use std::any::Any;
use std::cell::UnsafeCell;
use std::collections::HashMap;

pub(crate) const INLINE_SLOTS: usize = 8;

#[derive(Default)]
pub(crate) struct Storage {
    inline: [UnsafeCell<Option<Box<dyn Any>>>; INLINE_SLOTS],
    inline_trivial: [UnsafeCell<Option<Box<dyn Any>>>; INLINE_SLOTS],
    overflow: UnsafeCell<HashMap<usize, Box<dyn Any>>>,
    overflow_trivial: UnsafeCell<HashMap<usize, Box<dyn Any>>>,
}

impl Storage {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns the slot at `index`, default-constructing it on first access.
    ///
    /// Only the fiber that owns this `Storage` may call this; there is no
    /// synchronization here because fiber-local storage is never touched
    /// from any other fiber or worker.
    pub(crate) fn get_or_init<T: 'static>(
        &self,
        index: usize,
        trivial: bool,
        init: impl FnOnce() -> T,
    ) -> &T {
        if index < INLINE_SLOTS {
            let cell = if trivial {
                &self.inline_trivial[index]
            } else {
                &self.inline[index]
            };

            // Safety: single-fiber access, see module docs.
            let slot = unsafe { &mut *cell.get() };
            slot.get_or_insert_with(|| Box::new(init()))
                .downcast_ref::<T>()
                .expect("fiber-local slot type mismatch, this is a bug")
        } else {
            let map = if trivial {
                &self.overflow_trivial
            } else {
                &self.overflow
            };

            // Safety: single-fiber access, see module docs.
            let map = unsafe { &mut *map.get() };
            map.entry(index)
                .or_insert_with(|| Box::new(init()))
                .downcast_ref::<T>()
                .expect("fiber-local slot type mismatch, this is a bug")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_slot_initializes_once() {
        let s = Storage::new();
        assert_eq!(*s.get_or_init(0, false, || 7u32), 7);
        assert_eq!(*s.get_or_init(0, false, || 99u32), 7);
    }

    #[test]
    fn overflow_slot_past_inline_range_works() {
        let s = Storage::new();
        let idx = INLINE_SLOTS + 3;
        assert_eq!(*s.get_or_init(idx, false, || String::from("hi")), "hi");
        assert_eq!(*s.get_or_init(idx, false, || String::from("bye")), "hi");
    }

    #[test]
    fn trivial_and_non_trivial_slots_are_independent() {
        let s = Storage::new();
        assert_eq!(*s.get_or_init(0, false, || 1u32), 1);
        assert_eq!(*s.get_or_init(0, true, || 2u32), 2);
    }
}
