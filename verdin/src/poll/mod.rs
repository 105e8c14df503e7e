//! Kernel readiness integration.
//!
//! Two backends behind one interface: a level-triggered kqueue flavor
//! (macOS/BSD) and an epoll flavor (Linux). The scheduler owns the wait-fd
//! table and tells the backend what the remaining interest for a descriptor
//! is; the backend translates that into kqueue changelists or epoll ctl
//! calls.
//
// TODO: support EVFILT_VNODE and EVFILT_SIGNAL registrations on the kqueue
// backend; only read/write readiness is wired through today.

use std::os::fd::RawFd;

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "linux")]
pub(crate) use epoll::Poller;

#[cfg(not(target_os = "linux"))]
mod kqueue;
#[cfg(not(target_os = "linux"))]
pub(crate) use kqueue::Poller;

/// Number of readiness events we expect per wake before spilling to the heap.
pub(crate) const INLINE_WAKE_EVENTS: usize = 16;

pub(crate) type EventSet = smallvec::SmallVec<[FdEvent; INLINE_WAKE_EVENTS]>;

/// Direction of readiness a task can wait for. The wait-fd table is keyed by
/// a single direction, never the union.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Read = 1,
    Write = 2,
}

/// Key of the wait-fd table: `(ident, filter)` on kqueue, `(fd, event-bit)`
/// on epoll.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EvKey {
    pub fd: RawFd,
    pub kind: EventKind,
}

/// One delivered readiness event, as reported back through `fds_ready`.
///
/// `flags`, `fflags` and `data` carry the kqueue kevent payload; the epoll
/// backend reports them as zero.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdEvent {
    pub fd: RawFd,
    pub kind: EventKind,
    pub flags: u16,
    pub fflags: u32,
    pub data: i64,
}

impl FdEvent {
    pub(crate) fn bare(fd: RawFd, kind: EventKind) -> Self {
        Self {
            fd,
            kind,
            flags: 0,
            fflags: 0,
            data: 0,
        }
    }
}
