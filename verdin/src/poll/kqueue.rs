//! kqueue readiness backend.
//!
//! Filters are registered `EV_ADD | EV_ENABLE | EV_ONESHOT`, so a fired
//! filter is removed by the kernel and distribution only has to erase the
//! table entry. Registrations staged by one select and cancellations staged
//! by one dispatch are each flushed in a single batched `kevent` call. Any
//! change-list failure other than `EINTR` is fatal.

use super::{EventKind, EventSet, FdEvent};
use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::event::{EventFilter, EventFlag, FilterFlag, KEvent, Kqueue};
use std::os::fd::RawFd;
use std::time::Duration;

#[derive(Debug)]
pub(crate) struct Poller {
    kq: Kqueue,
    changes: Vec<KEvent>,
}

fn filter_for(kind: EventKind) -> EventFilter {
    match kind {
        EventKind::Read => EventFilter::EVFILT_READ,
        EventKind::Write => EventFilter::EVFILT_WRITE,
    }
}

fn kind_for(filter: EventFilter) -> Option<EventKind> {
    match filter {
        EventFilter::EVFILT_READ => Some(EventKind::Read),
        EventFilter::EVFILT_WRITE => Some(EventKind::Write),
        _ => None,
    }
}

fn change(fd: RawFd, kind: EventKind, flags: EventFlag) -> KEvent {
    KEvent::new(
        fd as usize,
        filter_for(kind),
        flags,
        FilterFlag::empty(),
        0,
        0,
    )
}

impl Poller {
    pub(crate) fn try_new() -> Result<Self> {
        let kq = Kqueue::new().context("could not create the kqueue readiness handle")?;
        Ok(Self {
            kq,
            changes: Vec::new(),
        })
    }

    /// Stages `kind` interest for `fd`. kqueue keys kernel filters by
    /// `(ident, filter)` already, so re-adding an existing key just updates
    /// it; the table state arguments exist for epoll and are unused here.
    pub(crate) fn register(
        &mut self,
        fd: RawFd,
        kind: EventKind,
        _has_read: bool,
        _has_write: bool,
    ) {
        self.changes.push(change(
            fd,
            kind,
            EventFlag::EV_ADD | EventFlag::EV_ENABLE | EventFlag::EV_ONESHOT,
        ));
    }

    /// Stages removal of a filter whose table entry went away before firing.
    /// The remaining-interest arguments exist for epoll; each kqueue filter
    /// is independent.
    pub(crate) fn unregister(
        &mut self,
        fd: RawFd,
        kind: EventKind,
        _want_read: bool,
        _want_write: bool,
    ) {
        self.changes.push(change(fd, kind, EventFlag::EV_DELETE));
    }

    /// Flushes staged changes in one `kevent` call.
    pub(crate) fn commit(&mut self) {
        if self.changes.is_empty() {
            return;
        }

        let mut none: [KEvent; 0] = [];
        loop {
            match self.kq.kevent(&self.changes, &mut none, Some(Duration::ZERO)) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(err) => panic!("FATAL: kevent change list failed: {err}"),
            }
        }

        self.changes.clear();
    }

    pub(crate) fn arm_pipe(&mut self, fd: RawFd) {
        self.changes.push(change(
            fd,
            EventKind::Read,
            EventFlag::EV_ADD | EventFlag::EV_ENABLE | EventFlag::EV_ONESHOT,
        ));
        self.commit();
    }

    pub(crate) fn disarm_pipe(&mut self, fd: RawFd) {
        self.changes.push(change(fd, EventKind::Read, EventFlag::EV_DELETE));
        self.commit();
    }

    /// A fired ONESHOT filter is already gone from the kernel.
    pub(crate) fn pipe_fired_cleanup(&mut self, _fd: RawFd) {}

    /// Nothing to re-sync: fired filters were ONESHOT.
    pub(crate) fn rearm_after_fire(&mut self, _fd: RawFd, _want_read: bool, _want_write: bool) {}

    /// Blocks for readiness, carrying the kevent payload through to the
    /// fired-fd records. `EINTR` is retried; `EV_ERROR` events are reported
    /// and skipped.
    pub(crate) fn wait(&mut self, timeout: Option<u64>, capacity: usize) -> EventSet {
        self.commit();

        let timeout = timeout.map(Duration::from_millis);

        let placeholder = KEvent::new(
            0,
            EventFilter::EVFILT_READ,
            EventFlag::empty(),
            FilterFlag::empty(),
            0,
            0,
        );
        let mut buf = vec![placeholder; capacity.max(1)];

        let n = loop {
            match self.kq.kevent(&[], &mut buf, timeout) {
                Ok(n) => break n,
                Err(Errno::EINTR) => continue,
                Err(err) => panic!("FATAL: kevent wait failed: {err}"),
            }
        };

        let mut events = EventSet::new();
        for kev in &buf[..n] {
            if kev.flags().contains(EventFlag::EV_ERROR) {
                tracing::error!(ident = kev.ident(), "kevent reported EV_ERROR");
                continue;
            }

            let Ok(filter) = kev.filter() else { continue };
            let Some(kind) = kind_for(filter) else {
                continue;
            };

            events.push(FdEvent {
                fd: kev.ident() as RawFd,
                kind,
                flags: kev.flags().bits() as u16,
                fflags: kev.fflags().bits(),
                data: kev.data() as i64,
            });
        }

        events
    }
}
