//! Task records and their execution-state machine.

use crate::poll::{EvKey, FdEvent};
use crate::stream::RingId;
use bitflags::bitflags;
use smallvec::SmallVec;
use std::ptr::NonNull;

// Exports
pub mod id;
pub use id::TaskId;

pub(crate) mod stack;
pub(crate) use stack::Stack;

pub(crate) mod switch;
pub(crate) use switch::Snapshot;

/// Most composite waits cover a handful of registrations; spill to the heap
/// only past this.
pub(crate) const INLINE_EVENTS: usize = 4;

bitflags! {
    /// Execution state of a task. Exactly one of RUNNING, STOP, SUSPENDING
    /// or a nonempty WAITING_* subset is set at any moment; READY is the
    /// transient initial flavor of SUSPENDING a task carries between spawn
    /// and its first dispatch.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub(crate) struct TaskState: u32 {
        const READY           = 0x0001;
        const RUNNING         = 0x0002;
        const SUSPENDING      = 0x0004;
        const WAITING_FD      = 0x0008;
        const WAITING_STREAM  = 0x0010;
        const WAITING_THQ     = 0x0020;
        const WAITING_TIMEOUT = 0x0040;
        const STOP            = 0x0080;
    }
}

/// One cooperative execution: stack, saved registers, and the wait/wake
/// bookkeeping the scheduler reads when the task is dispatched.
///
/// Task records are owned by the scheduler's id table (boxed, so their
/// address is stable); every other structure holds a [`TaskRef`].
#[derive(Debug)]
pub(crate) struct Task {
    pub(crate) state: TaskState,
    pub(crate) id: TaskId,
    pub(crate) snapshot: Snapshot,
    pub(crate) stack: Stack,

    // Registrations placed by the current select.
    pub(crate) waiting_fds: SmallVec<[EvKey; INLINE_EVENTS]>,
    pub(crate) waiting_streams: SmallVec<[RingId; INLINE_EVENTS]>,

    // What actually fired; read back by the task after it resumes.
    pub(crate) fired_fds: SmallVec<[FdEvent; INLINE_EVENTS]>,
    pub(crate) fired_streams: SmallVec<[RingId; INLINE_EVENTS]>,
    pub(crate) fired_thq: bool,
    pub(crate) fired_timeout: bool,
}

impl Task {
    pub(crate) fn new(id: TaskId, stack: Stack) -> Self {
        Self {
            state: TaskState::READY,
            id,
            snapshot: Snapshot::new(),
            stack,
            waiting_fds: SmallVec::new(),
            waiting_streams: SmallVec::new(),
            fired_fds: SmallVec::new(),
            fired_streams: SmallVec::new(),
            fired_thq: false,
            fired_timeout: false,
        }
    }

    /// Resets the wake indicators at the top of a fresh select.
    pub(crate) fn clear_fired(&mut self) {
        self.fired_fds.clear();
        self.fired_streams.clear();
        self.fired_thq = false;
        self.fired_timeout = false;
    }
}

/// Address-identity handle to a task record owned by the scheduler.
///
/// Ready deque, wait tables and the timeout index store these instead of
/// owning references, breaking the ownership cycle between scheduler, tasks
/// and tables. Hashing, equality and ordering are by address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct TaskRef(NonNull<Task>);

impl TaskRef {
    pub(crate) fn new(task: &mut Task) -> Self {
        Self(NonNull::from(task))
    }

    pub(crate) fn as_ptr(&self) -> *mut Task {
        self.0.as_ptr()
    }

    /// # Safety
    ///
    /// The record must still be owned by the scheduler's task table, and the
    /// caller must be the owning OS thread. Both hold for every table in the
    /// scheduler: records are reaped only after their handle has left all of
    /// them, and the tables are never touched cross-thread.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn as_mut(&self) -> &mut Task {
        unsafe { &mut *self.0.as_ptr() }
    }
}
