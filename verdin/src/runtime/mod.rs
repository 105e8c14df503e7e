//! Runtime assembly: builder and config, the per-thread scheduler, the
//! global registry and the clock daemon, plus the free functions tasks call
//! while running.

use crate::Status;
use crate::context;
use crate::poll::{EventKind, FdEvent};
use crate::stream::RingId;
use crate::task::TaskId;
use std::ffi::c_void;
use std::os::fd::RawFd;

// Public API
pub mod builder;
pub use builder::{Builder, Runtime};

pub mod clock;

// Exports
pub(crate) mod registry;
pub use registry::thread_queue;

pub(crate) mod scheduler;

#[cfg(test)]
mod tests;

/// Immutable configuration a `Builder` resolves into; consumed by the
/// scheduler and its mailbox.
#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) thread_id: u64,
    pub(crate) queue_capacity: usize,
    pub(crate) entry_size: usize,
    pub(crate) default_stack_size: usize,
    pub(crate) pop_spin_limit: usize,
}

/// Spawns a task running `f` with the configured default stack size.
/// Never suspends; the task runs once the scheduler dispatches it.
pub fn spawn<F>(f: F) -> TaskId
where
    F: FnOnce() + 'static,
{
    let stack_size = unsafe { (*context::scheduler_ptr()).cfg.default_stack_size };
    spawn_with_stack(stack_size, f)
}

pub fn spawn_with_stack<F>(stack_size: usize, f: F) -> TaskId
where
    F: FnOnce() + 'static,
{
    extern "C" fn closure_entry<F: FnOnce() + 'static>(arg: *mut c_void) {
        // Safety: `arg` is the box leaked below; the trampoline calls the
        // entry exactly once.
        let f = unsafe { Box::from_raw(arg as *mut F) };
        f();
    }

    let arg = Box::into_raw(Box::new(f)) as *mut c_void;
    unsafe { spawn_entry(closure_entry::<F>, arg, stack_size) }
}

/// Spawn from a bare entry function and argument (the C-ABI flavor).
///
/// # Safety
///
/// `entry` must be safe to call with `arg` on a fresh stack.
pub unsafe fn spawn_entry(
    entry: extern "C" fn(*mut c_void),
    arg: *mut c_void,
    stack_size: usize,
) -> TaskId {
    unsafe { (*context::scheduler_ptr()).spawn_raw(entry, arg, stack_size) }
}

/// Composite wait: suspends the calling task until any registered wake-up
/// fires (fd readiness, stream readability, thread-queue content, timeout).
/// `timeout_ms == 0` means no timeout. With no registrations at all this is
/// a plain yield.
///
/// On return, read the outcome through [`fds_ready`], [`streams_ready`],
/// [`is_timeout`] and [`is_thread_queue_ready`].
pub fn select(fds: &[(RawFd, EventKind)], streams: &[RingId], wait_thq: bool, timeout_ms: u64) {
    unsafe {
        (*context::scheduler_ptr()).register_select(fds, streams, wait_thq, timeout_ms);
        scheduler::schedule();
    }
}

/// Requeues the calling task behind everything currently runnable.
pub fn yield_now() {
    select(&[], &[], false, 0);
}

fn with_running_task<R>(f: impl FnOnce(&crate::task::Task) -> R) -> R {
    unsafe {
        let task = (*context::scheduler_ptr())
            .running()
            .expect("readiness read-outs require a running task");
        f(&*task.as_ptr())
    }
}

/// The fd events that woke the calling task's last `select`.
pub fn fds_ready() -> Vec<FdEvent> {
    with_running_task(|task| task.fired_fds.to_vec())
}

/// The streams that became readable during the calling task's last `select`.
pub fn streams_ready() -> Vec<RingId> {
    with_running_task(|task| task.fired_streams.to_vec())
}

/// Whether the calling task's last `select` ended in its timeout.
pub fn is_timeout() -> bool {
    with_running_task(|task| task.fired_timeout)
}

/// Whether the thread-queue became nonempty during the calling task's last
/// `select`.
pub fn is_thread_queue_ready() -> bool {
    with_running_task(|task| task.fired_thq)
}

/// Pops one entry from this thread's mailbox. Consumer side only; `entry`
/// must be exactly the configured entry size.
pub fn pop_thread_queue(entry: &mut [u8]) -> Status {
    unsafe { (*context::scheduler_ptr()).queue.pop(entry) }
}

/// The user-supplied id this thread's scheduler registered under.
pub fn current_thread_id() -> u64 {
    unsafe { (*context::scheduler_ptr()).cfg.thread_id }
}
