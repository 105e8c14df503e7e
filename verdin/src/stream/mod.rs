//! Intra-thread typed streams.
//!
//! A stream is a bounded ring over `T` with an EOF marker, shared by one
//! readable endpoint and any number of writable endpoints, all on the same
//! OS thread. The endpoints are `Rc`-based and therefore `!Send`; the
//! single-OS-thread rule of the data model holds by construction.
//!
//! Nothing here blocks. A reader that runs dry registers the ring identity
//! with the scheduler via `select`; a successful push (or a push that
//! observes the stream closed) wakes that reader.

use crate::Status;
use crate::context;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

mod ring;
use ring::Ring;

/// Identity of a stream's shared ring, as used by `select`, the wait-stream
/// table and the fired-stream list. Derived from the address of the shared
/// block, so it is unique while any endpoint is alive.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RingId(usize);

impl RingId {
    pub fn as_usize(&self) -> usize {
        self.0
    }

    /// Rehydrates an identity previously obtained from `ring_id` (the C-ABI
    /// select path hands identities through as plain words).
    pub fn from_usize(raw: usize) -> Self {
        Self(raw)
    }
}

struct Shared<T> {
    ring: RefCell<Ring<T>>,
    closed_read: Cell<bool>,
    closed_write: Cell<bool>,
}

/// Why a push did not take the value. The value travels back to the caller.
pub enum PushError<T> {
    /// The ring is at capacity; retry after the reader catches up.
    Full(T),
    /// The read side is closed or EOF was already pushed.
    Closed(T),
}

impl<T> PushError<T> {
    pub fn status(&self) -> Status {
        match self {
            PushError::Full(_) => Status::NoVacancy,
            PushError::Closed(_) => Status::Closed,
        }
    }

    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(value) | PushError::Closed(value) => value,
        }
    }
}

impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Full(_) => f.write_str("PushError::Full"),
            PushError::Closed(_) => f.write_str("PushError::Closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PopError {
    /// Nothing buffered right now; compose with `select` to wait.
    #[error("stream has no more data")]
    Empty,
    /// EOF was pushed and everything before it has been drained.
    #[error("stream is closed")]
    Closed,
}

impl PopError {
    pub fn status(&self) -> Status {
        match self {
            PopError::Empty => Status::NoMoreData,
            PopError::Closed => Status::Closed,
        }
    }
}

/// Creates a stream of capacity `capacity`, returning the sole readable
/// endpoint and a cloneable writable endpoint.
pub fn stream<T>(capacity: usize) -> (StreamReader<T>, StreamWriter<T>) {
    let shared = Rc::new(Shared {
        ring: RefCell::new(Ring::new(capacity)),
        closed_read: Cell::new(false),
        closed_write: Cell::new(false),
    });

    (
        StreamReader {
            shared: Rc::clone(&shared),
        },
        StreamWriter { shared },
    )
}

/// The single readable endpoint of a stream. Not cloneable; dropping it
/// closes the read side and subsequent pushes observe `Closed`.
pub struct StreamReader<T> {
    shared: Rc<Shared<T>>,
}

/// A writable endpoint of a stream. Cloneable; all clones feed the same ring.
pub struct StreamWriter<T> {
    shared: Rc<Shared<T>>,
}

impl<T> StreamReader<T> {
    pub fn ring_id(&self) -> RingId {
        ring_id(&self.shared)
    }

    /// Non-blocking pop. `Empty` asks the caller to `select` on
    /// [`ring_id`](Self::ring_id); `Closed` means EOF has been drained.
    pub fn pop(&self) -> Result<T, PopError> {
        let mut ring = self.shared.ring.borrow_mut();
        match ring.pop() {
            Some(value) => Ok(value),
            None if ring.is_eof() => Err(PopError::Closed),
            None => Err(PopError::Empty),
        }
    }

    /// All-or-nothing batched pop: fills `out` completely or takes nothing.
    pub fn pop_n(&self, out: &mut [T]) -> Result<(), PopError>
    where
        T: Copy,
    {
        let mut ring = self.shared.ring.borrow_mut();

        if ring.len() < out.len() {
            return if ring.is_eof() {
                Err(PopError::Closed)
            } else {
                Err(PopError::Empty)
            };
        }

        for slot in out.iter_mut() {
            *slot = ring.pop().expect("length was checked above");
        }
        Ok(())
    }
}

impl<T> Drop for StreamReader<T> {
    fn drop(&mut self) {
        self.shared.closed_read.set(true);
    }
}

impl<T> StreamWriter<T> {
    pub fn ring_id(&self) -> RingId {
        ring_id(&self.shared)
    }

    /// Non-blocking push. On success, and on a `Closed` failure, a reader
    /// registered in the wait-stream table is woken so it can observe the
    /// new item or the close.
    pub fn push(&self, value: T) -> Result<(), PushError<T>> {
        if self.is_closed() {
            self.notify_reader();
            return Err(PushError::Closed(value));
        }

        let result = self.shared.ring.borrow_mut().push(value);
        match result {
            Ok(()) => {
                self.notify_reader();
                Ok(())
            }
            Err(value) => Err(PushError::Full(value)),
        }
    }

    /// All-or-nothing batched push: either every element fits or none is
    /// taken.
    pub fn push_slice(&self, values: &[T]) -> Status
    where
        T: Copy,
    {
        if self.is_closed() {
            self.notify_reader();
            return Status::Closed;
        }

        {
            let mut ring = self.shared.ring.borrow_mut();
            if ring.free() < values.len() {
                return Status::NoVacancy;
            }
            for &value in values {
                let _ = ring.push(value);
            }
        }

        self.notify_reader();
        Status::Success
    }

    /// Marks EOF and closes the write side; wakes a registered reader.
    pub fn push_eof(&self) {
        self.shared.ring.borrow_mut().push_eof();
        self.shared.closed_write.set(true);
        self.notify_reader();
    }

    fn is_closed(&self) -> bool {
        self.shared.closed_read.get() || self.shared.ring.borrow().is_eof()
    }

    fn notify_reader(&self) {
        // Outside a scheduler (plain unit tests, setup code) there is no
        // wait-stream table and thus nobody to wake.
        if let Some(scheduler) = context::try_scheduler_ptr() {
            unsafe { (*scheduler).notify_stream(self.ring_id()) };
        }
    }
}

impl<T> Clone for StreamWriter<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
        }
    }
}

fn ring_id<T>(shared: &Rc<Shared<T>>) -> RingId {
    RingId(Rc::as_ptr(shared) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_not_impl_any;

    assert_not_impl_any!(StreamReader<u32>: Send, Sync);
    assert_not_impl_any!(StreamWriter<u32>: Send, Sync);

    #[test]
    fn test_roundtrip_preserves_sequence() {
        let (reader, writer) = stream::<u32>(8);

        for i in 0..8 {
            writer.push(i).unwrap();
        }
        for i in 0..8 {
            assert_eq!(reader.pop(), Ok(i));
        }
        assert_eq!(reader.pop(), Err(PopError::Empty));
    }

    #[test]
    fn test_push_past_capacity_reports_full() {
        let (_reader, writer) = stream::<u32>(2);

        writer.push(0).unwrap();
        writer.push(1).unwrap();
        assert!(matches!(writer.push(2), Err(PushError::Full(2))));
    }

    #[test]
    fn test_eof_semantics() {
        let (reader, writer) = stream::<u32>(4);

        writer.push(1).unwrap();
        writer.push_eof();

        // Push after EOF fails closed; buffered data still drains.
        assert!(matches!(writer.push(2), Err(PushError::Closed(2))));
        assert_eq!(reader.pop(), Ok(1));
        assert_eq!(reader.pop(), Err(PopError::Closed));
        assert_eq!(reader.pop(), Err(PopError::Closed));
    }

    #[test]
    fn test_dropping_reader_closes_stream() {
        let (reader, writer) = stream::<u32>(4);
        drop(reader);

        assert!(matches!(writer.push(1), Err(PushError::Closed(1))));
    }

    #[test]
    fn test_batched_flavors_are_all_or_nothing() {
        let (reader, writer) = stream::<u32>(4);

        assert_eq!(writer.push_slice(&[1, 2, 3]), Status::Success);
        assert_eq!(writer.push_slice(&[4, 5]), Status::NoVacancy);

        let mut out = [0u32; 4];
        assert_eq!(reader.pop_n(&mut out), Err(PopError::Empty));

        let mut out = [0u32; 3];
        reader.pop_n(&mut out).unwrap();
        assert_eq!(out, [1, 2, 3]);
    }

    #[test]
    fn test_writer_clones_share_the_ring() {
        let (reader, writer) = stream::<u32>(4);
        let second = writer.clone();

        assert_eq!(writer.ring_id(), second.ring_id());
        assert_eq!(writer.ring_id(), reader.ring_id());

        writer.push(1).unwrap();
        second.push(2).unwrap();
        assert_eq!(reader.pop(), Ok(1));
        assert_eq!(reader.pop(), Ok(2));
    }
}
