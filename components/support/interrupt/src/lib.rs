/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

#![allow(unknown_lints)]
#![warn(rust_2018_idioms)]

//! Cooperative interruption for long-running database work.
//!
//! A `SqlInterruptHandle` can be cloned off a connection and poked from any
//! thread; code doing the work holds a `SqlInterruptScope` and calls
//! `err_if_interrupted()` at its suspension points. Interrupting aborts any
//! in-flight sqlite statement *and* flips the scope, so loops between
//! statements notice too.

use rusqlite::{Connection, InterruptHandle};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// The error returned by `err_if_interrupted`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("The operation was interrupted")]
pub struct Interrupted;

/// A trait for things that can check if an operation should abort.
pub trait Interruptee {
    fn was_interrupted(&self) -> bool;

    #[inline]
    fn err_if_interrupted(&self) -> Result<(), Interrupted> {
        if self.was_interrupted() {
            return Err(Interrupted);
        }
        Ok(())
    }
}

/// A convenience implementation for code which takes an `&dyn Interruptee`
/// but has no caller that ever interrupts.
pub struct NeverInterrupts;

impl Interruptee for NeverInterrupts {
    #[inline]
    fn was_interrupted(&self) -> bool {
        false
    }
}

/// Owned by whoever wants to be able to interrupt database work.
pub struct SqlInterruptHandle {
    db_handle: InterruptHandle,
    generation: Arc<AtomicUsize>,
}

impl SqlInterruptHandle {
    pub fn new(conn: &Connection) -> Self {
        Self {
            db_handle: conn.get_interrupt_handle(),
            generation: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Abort the current statement (if any) and mark every outstanding scope
    /// interrupted.
    pub fn interrupt(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.db_handle.interrupt();
    }

    /// Begin a scope for one logical operation.
    pub fn begin_interrupt_scope(&self) -> SqlInterruptScope {
        SqlInterruptScope {
            start_generation: self.generation.load(Ordering::SeqCst),
            generation: Arc::clone(&self.generation),
        }
    }
}

/// Held by the code doing the work; checked at suspension points.
pub struct SqlInterruptScope {
    start_generation: usize,
    generation: Arc<AtomicUsize>,
}

impl Interruptee for SqlInterruptScope {
    #[inline]
    fn was_interrupted(&self) -> bool {
        self.generation.load(Ordering::SeqCst) != self.start_generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_interrupts() {
        assert!(NeverInterrupts.err_if_interrupted().is_ok());
    }

    #[test]
    fn test_scope_sees_interrupt() {
        let conn = Connection::open_in_memory().unwrap();
        let handle = SqlInterruptHandle::new(&conn);
        let scope = handle.begin_interrupt_scope();
        assert!(scope.err_if_interrupted().is_ok());
        handle.interrupt();
        assert_eq!(scope.err_if_interrupted(), Err(Interrupted));
        // A scope begun after the interrupt starts clean.
        let fresh = handle.begin_interrupt_scope();
        assert!(fresh.err_if_interrupted().is_ok());
    }
}
