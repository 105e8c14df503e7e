use std::fmt;
use std::num::NonZeroU64;

/// Identifier of a task, unique within its owning scheduler.
///
/// Ids are chosen from a per-scheduler counter and are positive; an id may
/// be reused only after the task holding it was reaped (the counter skips
/// ids still present in the task table when it wraps).
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct TaskId(NonZeroU64);

impl TaskId {
    pub(crate) fn new(id: u64) -> Option<Self> {
        NonZeroU64::new(id).map(Self)
    }

    pub fn as_u64(&self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
