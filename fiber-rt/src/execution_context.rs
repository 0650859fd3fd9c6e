// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`ExecutionContext`]: a ref-counted bag of caller-defined state that, when
//! attached to a [`crate::FiberAttrs`], is installed for the duration of the
//! fiber's `start_proc` and reachable from anywhere in that call tree via
//! [`ExecutionContext::current`].
//!
//! This is how external collaborators (request-scoped tracing context,
//! tenant identifiers, deadline propagation) ride along with a fiber without
//! the core needing to know anything about their shape.

use std::any::Any;
use std::cell::RefCell;
use std::sync::Arc;

thread_local! {
    static CURRENT: RefCell<Option<ExecutionContext>> = const { RefCell::new(None) };
}

/// Opaque, cloneable handle to a bag of execution-scoped state.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<dyn Any + Send + Sync>,
}

impl ExecutionContext {
    /// Wraps `value` in a new execution context.
    pub fn new<T: Any + Send + Sync + 'static>(value: T) -> Self {
        Self {
            inner: Arc::new(value),
        }
    }

    /// Returns the currently installed execution context, if any fiber
    /// further up the call stack installed one.
    #[must_use]
    pub fn current() -> Option<ExecutionContext> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// Downcasts to the concrete type the context was created with.
    #[must_use]
    pub fn downcast_ref<T: Any + Send + Sync + 'static>(&self) -> Option<&T> {
        self.inner.downcast_ref()
    }

    /// Installs `self` as the current execution context for the duration of
    /// `f`. Used by [`crate::Fiber::spawn`] to wrap a fiber's `start_proc`.
    pub(crate) fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let prev = CURRENT.with(|c| c.replace(Some(self.clone())));
        let result = f();
        CURRENT.with(|c| *c.borrow_mut() = prev);
        result
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_installs_and_restores_previous_context() {
        assert!(ExecutionContext::current().is_none());

        let outer = ExecutionContext::new(1u32);
        outer.run(|| {
            assert_eq!(ExecutionContext::current().unwrap().downcast_ref::<u32>(), Some(&1));

            let inner = ExecutionContext::new("nested");
            inner.run(|| {
                assert_eq!(
                    ExecutionContext::current().unwrap().downcast_ref::<&str>(),
                    Some(&"nested")
                );
            });

            assert_eq!(ExecutionContext::current().unwrap().downcast_ref::<u32>(), Some(&1));
        });

        assert!(ExecutionContext::current().is_none());
    }

    #[test]
    fn downcast_ref_fails_for_wrong_type() {
        let ctx = ExecutionContext::new(1u32);
        assert!(ctx.downcast_ref::<String>().is_none());
    }
}
