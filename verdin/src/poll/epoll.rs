//! epoll readiness backend.
//!
//! Interest is registered level-triggered and reference-managed against the
//! wait-fd table: ADD on the first interest for a descriptor, MOD to the
//! union when the second direction appears, MOD/DEL back down as interests
//! disappear. Any `epoll_ctl` failure other than `EINTR` is fatal.

use super::{EventKind, EventSet, FdEvent};
use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

#[derive(Debug)]
pub(crate) struct Poller {
    epoll: Epoll,
}

fn flags_for(read: bool, write: bool) -> EpollFlags {
    let mut flags = EpollFlags::empty();
    if read {
        flags |= EpollFlags::EPOLLIN;
    }
    if write {
        flags |= EpollFlags::EPOLLOUT;
    }
    flags
}

impl Poller {
    pub(crate) fn try_new() -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::empty())
            .context("could not create the epoll readiness handle")?;
        Ok(Self { epoll })
    }

    /// Registers `kind` interest for `fd`. `has_read`/`has_write` reflect
    /// the wait-fd table before this registration.
    pub(crate) fn register(&mut self, fd: RawFd, kind: EventKind, has_read: bool, has_write: bool) {
        // Safety: the caller keeps the descriptor open for the lifetime of
        // the registration; the scheduler drops interest before resuming the
        // waiting task.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };

        match (kind, has_read, has_write) {
            // Another task already subscribed this direction.
            (EventKind::Read, true, _) | (EventKind::Write, _, true) => {}

            // First interest for this descriptor.
            (_, false, false) => {
                let event = EpollEvent::new(flags_for(kind == EventKind::Read, kind == EventKind::Write), fd as u64);
                retry_eintr(|| self.epoll.add(borrowed, event));
            }

            // The other direction exists: widen to the union.
            _ => {
                let mut event = EpollEvent::new(flags_for(true, true), fd as u64);
                retry_eintr(|| self.epoll.modify(borrowed, &mut event));
            }
        }
    }

    /// Drops the kernel subscription down to whatever interest remains in
    /// the wait-fd table after the entry for `(fd, kind)` went away.
    pub(crate) fn unregister(
        &mut self,
        fd: RawFd,
        _kind: EventKind,
        want_read: bool,
        want_write: bool,
    ) {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };

        if !want_read && !want_write {
            retry_eintr(|| self.epoll.delete(borrowed));
        } else {
            let mut event = EpollEvent::new(flags_for(want_read, want_write), fd as u64);
            retry_eintr(|| self.epoll.modify(borrowed, &mut event));
        }
    }

    /// Flushes staged changes. The epoll backend applies every change
    /// eagerly, so this is a no-op; the kqueue backend batches.
    pub(crate) fn commit(&mut self) {}

    pub(crate) fn arm_pipe(&mut self, fd: RawFd) {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let event = EpollEvent::new(EpollFlags::EPOLLIN, fd as u64);
        retry_eintr(|| self.epoll.add(borrowed, event));
    }

    pub(crate) fn disarm_pipe(&mut self, fd: RawFd) {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        retry_eintr(|| self.epoll.delete(borrowed));
    }

    /// Post-delivery cleanup of the notification pipe subscription. kqueue
    /// removes a fired ONESHOT filter by itself; epoll has to delete.
    pub(crate) fn pipe_fired_cleanup(&mut self, fd: RawFd) {
        self.disarm_pipe(fd);
    }

    /// Re-syncs interest after events for `fd` were distributed and their
    /// table entries erased.
    pub(crate) fn rearm_after_fire(&mut self, fd: RawFd, want_read: bool, want_write: bool) {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };

        if !want_read && !want_write {
            retry_eintr(|| self.epoll.delete(borrowed));
        } else {
            let mut event = EpollEvent::new(flags_for(want_read, want_write), fd as u64);
            retry_eintr(|| self.epoll.modify(borrowed, &mut event));
        }
    }

    /// Blocks for readiness. `timeout` of `None` blocks indefinitely;
    /// `Some(ms)` bounds the wait. `EINTR` is retried.
    ///
    /// An epoll event carrying both directions is split into one record per
    /// direction so distribution sees single-direction keys only.
    pub(crate) fn wait(&mut self, timeout: Option<u64>, capacity: usize) -> EventSet {
        let timeout_ms = match timeout {
            None => -1i32,
            Some(ms) => ms.min(i32::MAX as u64) as i32,
        };

        let mut buf = vec![libc::epoll_event { events: 0, u64: 0 }; capacity.max(1)];

        let n = loop {
            let rc = unsafe {
                libc::epoll_wait(
                    self.epoll.0.as_raw_fd(),
                    buf.as_mut_ptr(),
                    buf.len() as i32,
                    timeout_ms,
                )
            };

            if rc >= 0 {
                break rc as usize;
            }

            match Errno::last() {
                Errno::EINTR => continue,
                err => panic!("FATAL: epoll_wait failed: {err}"),
            }
        };

        let mut events = EventSet::new();
        for raw in &buf[..n] {
            let fd = raw.u64 as RawFd;

            if raw.events & libc::EPOLLIN as u32 != 0 {
                events.push(FdEvent::bare(fd, EventKind::Read));
            }
            if raw.events & libc::EPOLLOUT as u32 != 0 {
                events.push(FdEvent::bare(fd, EventKind::Write));
            }
        }

        events
    }
}

fn retry_eintr(mut ctl: impl FnMut() -> nix::Result<()>) {
    loop {
        match ctl() {
            Ok(()) => return,
            Err(Errno::EINTR) => continue,
            Err(err) => panic!("FATAL: epoll_ctl failed: {err}"),
        }
    }
}
