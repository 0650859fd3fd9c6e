// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Stack selection for materialized fibers.
//!
//! System fibers (those spawned internally by the runtime itself, e.g. the
//! timer worker's helper fibers) get a small stack with no guard page. User
//! fibers get a configurable stack, with a guard page unless
//! `fiber_stack_enable_guard_page` was turned off. Both variants are
//! unified behind [`RuntimeStack`] so [`crate::entity::FiberEntity`] does not
//! need to be generic over the stack type.

use fiber::stack::{DefaultFiberStack, FiberStack, StackPointer};

/// Stack size used for fibers marked `system_fiber = true`.
pub(crate) const SYSTEM_STACK_SIZE: usize = 64 * 1024;

/// Default stack size for ordinary user fibers.
pub(crate) const DEFAULT_USER_STACK_SIZE: usize = 1024 * 1024;

/// A plain `mmap`'d stack with no guard page below it, used for system
/// fibers and whenever `fiber_stack_enable_guard_page` is disabled.
pub(crate) struct BareStack {
    top: StackPointer,
    len: usize,
}

impl BareStack {
    fn new(size: usize) -> std::io::Result<Self> {
        let size = size.max(fiber::stack::MIN_STACK_SIZE);
        let page_size = page_size();
        let len = size.div_ceil(page_size) * page_size;

        // Safety: `mmap` is called with a fixed, page-aligned length and the
        // returned mapping is only ever read/written as stack memory; it is
        // unmapped in `Drop`.
        unsafe {
            let addr = libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            );
            if addr == libc::MAP_FAILED {
                return Err(std::io::Error::last_os_error());
            }

            Ok(Self {
                top: StackPointer::new(addr as usize + len).expect("mmap returned a null stack"),
                len,
            })
        }
    }
}

impl Drop for BareStack {
    fn drop(&mut self) {
        // Safety: `self.top - self.len` is exactly the address returned by
        // the `mmap` call that created this stack, of the same length.
        unsafe {
            let base = self.top.get() - self.len;
            libc::munmap(base as *mut libc::c_void, self.len);
        }
    }
}

// Safety: delegates to `DefaultFiberStack`'s own (identical) contract: the
// mapping is exclusively owned by this `BareStack` and outlives any fiber
// resumed on top of it.
unsafe impl FiberStack for BareStack {
    fn top(&self) -> StackPointer {
        self.top
    }

    fn bottom(&self) -> StackPointer {
        StackPointer::new(self.top.get() - self.len).unwrap()
    }
}

fn page_size() -> usize {
    // Safety: `sysconf` with `_SC_PAGESIZE` has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).expect("page size fits in usize")
}

/// The stack backing a materialized [`crate::entity::FiberEntity`].
pub(crate) enum RuntimeStack {
    Guarded(DefaultFiberStack),
    Bare(BareStack),
}

impl RuntimeStack {
    pub(crate) fn new(
        size: usize,
        system_fiber: bool,
        enable_guard_page: bool,
    ) -> std::io::Result<Self> {
        if system_fiber {
            return Ok(Self::Bare(BareStack::new(SYSTEM_STACK_SIZE)?));
        }

        if enable_guard_page {
            Ok(Self::Guarded(DefaultFiberStack::new(size)?))
        } else {
            Ok(Self::Bare(BareStack::new(size)?))
        }
    }
}

// Safety: both variants independently satisfy `FiberStack`'s contract, and
// dispatch never mixes the two.
unsafe impl FiberStack for RuntimeStack {
    fn top(&self) -> StackPointer {
        match self {
            Self::Guarded(s) => s.top(),
            Self::Bare(s) => s.top(),
        }
    }

    fn bottom(&self) -> StackPointer {
        match self {
            Self::Guarded(s) => s.bottom(),
            Self::Bare(s) => s.bottom(),
        }
    }
}
