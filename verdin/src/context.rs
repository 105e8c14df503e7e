//! Thread-local scheduler singleton.
//!
//! The scheduler is reached through a raw pointer rather than a `RefCell`:
//! stack switches freeze frames mid-call, so borrow guards taken before a
//! switch would still be live when a resumed task re-enters the scheduler.
//! Call sites reborrow through the pointer in short, switch-free sections
//! instead (the same discipline the original keeps with its thread-local
//! singleton pointer).

use crate::runtime::scheduler::Scheduler;
use anyhow::{Result, anyhow};
use std::cell::Cell;
use std::ptr::NonNull;

thread_local! {
    static SCHEDULER: Cell<Option<NonNull<Scheduler>>> = const { Cell::new(None) };
}

/// Installs the scheduler for this OS thread. Fails if one is already
/// active (double-init is a programmer contract violation surfaced as an
/// error from `try_init`).
pub(crate) fn init(scheduler: Box<Scheduler>) -> Result<()> {
    SCHEDULER.with(|cell| {
        if cell.get().is_some() {
            return Err(anyhow!(
                "a scheduler is already active on this OS thread"
            ));
        }

        let ptr = Box::into_raw(scheduler);
        // Safety: Box::into_raw never returns null.
        cell.set(Some(unsafe { NonNull::new_unchecked(ptr) }));
        Ok(())
    })
}

pub(crate) fn is_initialized() -> bool {
    SCHEDULER.with(|cell| cell.get().is_some())
}

/// The scheduler of the current OS thread.
///
/// # Panics
///
/// Panics when called outside an initialized runtime thread.
#[track_caller]
pub(crate) fn scheduler_ptr() -> *mut Scheduler {
    SCHEDULER.with(|cell| {
        cell.get()
            .expect("no scheduler is active on this OS thread")
            .as_ptr()
    })
}

pub(crate) fn try_scheduler_ptr() -> Option<*mut Scheduler> {
    SCHEDULER.with(|cell| cell.get().map(NonNull::as_ptr))
}

/// Uninstalls and returns the scheduler. Used by runtime teardown; the
/// caller drops it after deregistering from the global registry.
pub(crate) fn teardown() -> Option<Box<Scheduler>> {
    SCHEDULER.with(|cell| {
        cell.take()
            // Safety: the pointer came from Box::into_raw in init().
            .map(|ptr| unsafe { Box::from_raw(ptr.as_ptr()) })
    })
}
