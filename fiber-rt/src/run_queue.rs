// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A bounded, power-of-two-sized MPMC ring buffer of runnable entities.
//!
//! This is Dmitry Vyukov's [bounded MPMC queue], adapted to additionally
//! carry a per-slot "non-stealable" bit: a fiber pushed with
//! `instealable = true` can only ever leave the queue through [`RunQueue::pop`],
//! never through [`RunQueue::steal`]. The bit is decided at push time because
//! [`RunQueue::steal`] cannot inspect the entity without first taking
//! ownership of the slot.
//!
//! [bounded MPMC queue]: https://www.1024cores.net/home/lock-free-algorithms/queues/bounded-mpmc-queue

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use util::CachePadded;

struct Slot<T> {
    seq: AtomicUsize,
    instealable: AtomicBool,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// The run queue was full; the payload is handed back to the caller so it
/// can be retried or surfaced as a bounded-retry-then-abort condition.
#[derive(Debug)]
pub(crate) struct Full<T>(pub(crate) T);

pub(crate) struct RunQueue<T> {
    buffer: Box<[Slot<T>]>,
    mask: usize,
    enqueue_pos: CachePadded<AtomicUsize>,
    dequeue_pos: CachePadded<AtomicUsize>,
}

// Safety: `RunQueue` only ever exposes `T` by-value across the slot's
// sequence-number handshake, which establishes the acquire/release edges
// needed to move `T` between threads.
unsafe impl<T: Send> Send for RunQueue<T> {}
unsafe impl<T: Send> Sync for RunQueue<T> {}

impl<T> RunQueue<T> {
    /// Creates a queue with the given capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not a power of two. Callers are expected to
    /// have validated this already via [`crate::config::RuntimeConfig::validate`].
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "run queue capacity must be a power of two");

        let buffer = (0..capacity)
            .map(|i| Slot {
                seq: AtomicUsize::new(i),
                instealable: AtomicBool::new(false),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();

        Self {
            buffer,
            mask: capacity - 1,
            enqueue_pos: CachePadded::from(AtomicUsize::new(0)),
            dequeue_pos: CachePadded::from(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Pushes a single value, marking it non-stealable if requested.
    pub(crate) fn push(&self, value: T, instealable: bool) -> Result<(), Full<T>> {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let slot = &self.buffer[pos & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            #[allow(clippy::cast_possible_wrap, reason = "queue positions never approach isize::MAX")]
            let diff = seq as isize - pos as isize;

            match diff.cmp(&0) {
                std::cmp::Ordering::Equal => {
                    match self.enqueue_pos.compare_exchange_weak(
                        pos,
                        pos.wrapping_add(1),
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => {
                            // Safety: we own this slot exclusively until the
                            // release-store below re-arms it for a consumer.
                            unsafe { (*slot.value.get()).write(value) };
                            slot.instealable.store(instealable, Ordering::Relaxed);
                            slot.seq.store(pos.wrapping_add(1), Ordering::Release);
                            return Ok(());
                        }
                        Err(cur) => pos = cur,
                    }
                }
                std::cmp::Ordering::Less => return Err(Full(value)),
                std::cmp::Ordering::Greater => pos = self.enqueue_pos.load(Ordering::Relaxed),
            }
        }
    }

    /// Atomically claims `values.len()` consecutive slots and fills them all,
    /// or claims none at all.
    ///
    /// # Errors
    ///
    /// Returns the values back to the caller if there was not enough
    /// contiguous free space at the moment of the attempt. Callers that need
    /// an eventual guarantee should retry, same as [`Self::push`].
    pub(crate) fn batch_push(
        &self,
        values: Vec<T>,
        instealable: bool,
    ) -> Result<(), Full<Vec<T>>> {
        let n = values.len();
        if n == 0 {
            return Ok(());
        }
        if n > self.capacity() {
            return Err(Full(values));
        }

        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let all_free = (0..n).all(|i| {
                let slot = &self.buffer[pos.wrapping_add(i) & self.mask];
                slot.seq.load(Ordering::Acquire) == pos.wrapping_add(i)
            });

            if !all_free {
                return Err(Full(values));
            }

            match self.enqueue_pos.compare_exchange_weak(
                pos,
                pos.wrapping_add(n),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(cur) => pos = cur,
            }
        }

        for (i, value) in values.into_iter().enumerate() {
            let slot = &self.buffer[pos.wrapping_add(i) & self.mask];
            // Safety: this span was exclusively claimed by the CAS above.
            unsafe { (*slot.value.get()).write(value) };
            slot.instealable.store(instealable, Ordering::Relaxed);
            slot.seq.store(pos.wrapping_add(i).wrapping_add(1), Ordering::Release);
        }

        Ok(())
    }

    /// Pops the oldest entry, regardless of its non-stealable bit.
    ///
    /// Used by workers draining their own group's queue.
    pub(crate) fn pop(&self) -> Option<T> {
        self.dequeue(false)
    }

    /// Pops the oldest entry, refusing entries marked non-stealable.
    ///
    /// Used by foreign workers stealing from another group's queue. Because
    /// the queue has a single consumer cursor shared by local pops and
    /// steals, refusing a slot simply leaves it in place for a local
    /// `pop()` to claim later; it does not skip ahead in the ring.
    pub(crate) fn steal(&self) -> Option<T> {
        self.dequeue(true)
    }

    fn dequeue(&self, refuse_instealable: bool) -> Option<T> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        loop {
            let slot = &self.buffer[pos & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            #[allow(clippy::cast_possible_wrap, reason = "queue positions never approach isize::MAX")]
            let diff = seq as isize - pos.wrapping_add(1) as isize;

            match diff.cmp(&0) {
                std::cmp::Ordering::Equal => {
                    if refuse_instealable && slot.instealable.load(Ordering::Relaxed) {
                        return None;
                    }

                    match self.dequeue_pos.compare_exchange_weak(
                        pos,
                        pos.wrapping_add(1),
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => {
                            // Safety: we own this slot exclusively now; it
                            // was initialized by the matching push.
                            let value = unsafe { (*slot.value.get()).assume_init_read() };
                            slot.seq
                                .store(pos.wrapping_add(self.capacity()), Ordering::Release);
                            return Some(value);
                        }
                        Err(cur) => pos = cur,
                    }
                }
                std::cmp::Ordering::Less => return None,
                std::cmp::Ordering::Greater => pos = self.dequeue_pos.load(Ordering::Relaxed),
            }
        }
    }
}

impl<T> Drop for RunQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_single_producer_single_consumer() {
        let q = RunQueue::with_capacity(16);
        for i in 0..10 {
            q.push(i, false).unwrap();
        }
        for i in 0..10 {
            assert_eq!(q.pop(), Some(i));
        }
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn overrun_returns_err() {
        let q = RunQueue::with_capacity(2);
        q.push(1, false).unwrap();
        q.push(2, false).unwrap();
        assert!(q.push(3, false).is_err());
    }

    #[test]
    fn steal_skips_instealable() {
        let q = RunQueue::with_capacity(4);
        q.push(1, true).unwrap();
        assert_eq!(q.steal(), None);
        assert_eq!(q.pop(), Some(1));
    }

    #[test]
    fn no_double_delivery_under_contention() {
        let q = Arc::new(RunQueue::with_capacity(1024));
        for i in 0..512 {
            q.push(i, false).unwrap();
        }

        let seen: Arc<std::sync::Mutex<Vec<i32>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let q = q.clone();
                let seen = seen.clone();
                thread::spawn(move || {
                    let mut local = Vec::new();
                    while let Some(v) = q.pop() {
                        local.push(v);
                    }
                    seen.lock().unwrap().extend(local);
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        let mut seen = seen.lock().unwrap();
        seen.sort_unstable();
        assert_eq!(seen.len(), 512);
        seen.dedup();
        assert_eq!(seen.len(), 512);
    }
}

/// A small number of interleavings too subtle to trust to `#[test]` alone:
/// two concurrent poppers racing a single producer on a tiny queue. `loom`
/// explores every thread interleaving at this scale rather than relying on
/// luck to hit the narrow window between the sequence-number CAS and the
/// slot write.
#[cfg(all(loom, test))]
mod loom_tests {
    use super::*;
    use loom::sync::Arc;
    use loom::thread;

    #[test]
    fn no_double_delivery_two_producers_two_consumers() {
        loom::model(|| {
            let q = Arc::new(RunQueue::with_capacity(4));

            let producers: Vec<_> = (0..2)
                .map(|t| {
                    let q = q.clone();
                    thread::spawn(move || {
                        let _ = q.push(t, false);
                    })
                })
                .collect();

            let consumers: Vec<_> = (0..2)
                .map(|_| {
                    let q = q.clone();
                    thread::spawn(move || {
                        let mut popped = Vec::new();
                        for _ in 0..2 {
                            if let Some(v) = q.pop() {
                                popped.push(v);
                            }
                        }
                        popped
                    })
                })
                .collect();

            for p in producers {
                p.join().unwrap();
            }

            let mut total = Vec::new();
            for c in consumers {
                total.extend(c.join().unwrap());
            }

            total.sort_unstable();
            total.dedup();
            assert!(total.len() <= 2);
        });
    }
}
