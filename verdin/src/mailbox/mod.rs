//! Cross-thread bounded mailbox ("thread-queue").
//!
//! One instance per scheduler. Producers on any OS thread push fixed-width
//! entries; the sole consumer is the owning scheduler. A spin lock guards
//! the ring state; blocking is layered on top through one of two
//! notification paths the consumer arms while holding the spin lock:
//!
//! * `COND` — the scheduler has nothing else to wait for and parks the OS
//!   thread on a condition variable.
//! * `PIPE` — fd or timeout waits coexist, so the producer's wake-up must go
//!   through the readiness handle; a byte written to a pipe makes the
//!   blocked `epoll_wait`/`kevent` return.
//!
//! The `notified` flag collapses notification storms: only the push that
//! transitions the queue from "not notified" to "notified" pays for a
//! signal.

use crate::Status;
use crate::utils::SpinLock;
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::unistd;
use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

/// How the consumer is currently blocked, if at all. Written by the consumer
/// under the spin lock; read by producers after they release it.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitMode {
    None = 0,
    Cond = 1,
    Pipe = 2,
}

impl WaitMode {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => WaitMode::Cond,
            2 => WaitMode::Pipe,
            _ => WaitMode::None,
        }
    }
}

/// Outcome of the consumer-side arming step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArmOutcome {
    /// Entries are already queued; no blocking needed.
    Ready,
    /// Mode is COND; follow up with [`ThreadQueue::cond_wait`].
    CondArmed,
    /// Mode is PIPE; register the read end with the readiness handle.
    PipeArmed,
}

/// Bounded circular buffer of fixed-width byte entries.
pub struct ThreadQueue {
    capacity: usize,
    entry_size: usize,
    spin_limit: usize,

    buf: UnsafeCell<Box<[u8]>>,
    /// Byte offset of the next slot to read. Consumer only.
    head: UnsafeCell<usize>,
    /// Byte offset of the next slot to write. Producers, under the lock.
    tail: UnsafeCell<usize>,
    len: AtomicUsize,

    notified: AtomicBool,
    wait_mode: AtomicU8,
    closed: AtomicBool,

    lock: SpinLock,
    mutex: Mutex<()>,
    cond: Condvar,

    pipe_r: OwnedFd,
    pipe_w: OwnedFd,
}

// Safety: the raw ring state (buf, head, tail) is only touched under the
// spin lock or from the single consumer thread per the protocol above; all
// remaining fields are atomics, locks or immutable.
unsafe impl Send for ThreadQueue {}
unsafe impl Sync for ThreadQueue {}

impl ThreadQueue {
    pub(crate) fn new(capacity: usize, entry_size: usize, spin_limit: usize) -> Self {
        let (pipe_r, pipe_w) = match unistd::pipe() {
            Ok(fds) => fds,
            Err(err) => panic!("FATAL: could not create the notification pipe: {err}"),
        };

        // Only the read end is nonblocking; a one-byte notification write
        // practically never blocks.
        if let Err(err) = fcntl(&pipe_r, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)) {
            panic!("FATAL: could not make the notification pipe nonblocking: {err}");
        }

        Self {
            capacity,
            entry_size,
            spin_limit,
            buf: UnsafeCell::new(vec![0u8; capacity * entry_size].into_boxed_slice()),
            head: UnsafeCell::new(0),
            tail: UnsafeCell::new(0),
            len: AtomicUsize::new(0),
            // Starts notified so the very first push does not signal a
            // consumer that was never armed.
            notified: AtomicBool::new(true),
            wait_mode: AtomicU8::new(WaitMode::None as u8),
            closed: AtomicBool::new(false),
            lock: SpinLock::new(),
            mutex: Mutex::new(()),
            cond: Condvar::new(),
            pipe_r,
            pipe_w,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Producer side; callable from any OS thread.
    pub fn push(&self, entry: &[u8]) -> Status {
        assert_eq!(
            entry.len(),
            self.entry_size,
            "mailbox entry must be exactly entry_size bytes"
        );

        // Unlocked fast-path rejections; both are rechecked or benign under
        // the lock. A capacity of zero lands here on every push.
        if self.len.load(Ordering::Relaxed) == self.capacity {
            return Status::NoVacancy;
        }
        if self.closed.load(Ordering::Relaxed) {
            return Status::Closed;
        }

        self.lock.lock();

        if self.len.load(Ordering::Relaxed) == self.capacity {
            self.lock.unlock();
            return Status::NoVacancy;
        }

        unsafe {
            let tail = &mut *self.tail.get();
            let buf = &mut *self.buf.get();
            buf[*tail..*tail + self.entry_size].copy_from_slice(entry);
            *tail += self.entry_size;
            if *tail == buf.len() {
                *tail = 0;
            }
        }

        // Release pairs with the consumer's acquire load of `len`, making
        // the slot write visible before the entry is observed.
        self.len.fetch_add(1, Ordering::Release);

        if !self.notified.load(Ordering::Relaxed) {
            self.notified.store(true, Ordering::Relaxed);
            self.lock.unlock();

            match self.wait_mode() {
                WaitMode::Cond => {
                    let _guard = self.mutex.lock();
                    self.cond.notify_one();
                }
                WaitMode::Pipe => self.write_pipe_byte(),
                WaitMode::None => {}
            }

            return Status::Success;
        }

        self.lock.unlock();
        Status::Success
    }

    /// Consumer side only. Spins a bounded number of iterations on an empty
    /// queue before giving up with `NoMoreData`.
    pub(crate) fn pop(&self, entry: &mut [u8]) -> Status {
        assert_eq!(
            entry.len(),
            self.entry_size,
            "mailbox entry must be exactly entry_size bytes"
        );

        let mut spins = 0;
        while self.len.load(Ordering::Acquire) == 0 {
            spins += 1;
            if spins > self.spin_limit {
                return Status::NoMoreData;
            }
            std::hint::spin_loop();
        }

        // The head slot is stable without the lock: producers never touch
        // unconsumed slots and there is a single consumer.
        unsafe {
            let head = &mut *self.head.get();
            let buf = &*self.buf.get();
            entry.copy_from_slice(&buf[*head..*head + self.entry_size]);

            self.lock.lock();
            self.len.fetch_sub(1, Ordering::Relaxed);
            self.lock.unlock();

            *head += self.entry_size;
            if *head == buf.len() {
                *head = 0;
            }
        }

        Status::Success
    }

    /// Consumer-side wait arbitration. Length check, notified
    /// reset and mode change happen under the spin lock so a concurrent
    /// push cannot slip between them unnoticed.
    pub(crate) fn consumer_arm(&self, other_waits: bool) -> ArmOutcome {
        self.lock.lock();

        if self.len.load(Ordering::Acquire) > 0 {
            self.lock.unlock();
            return ArmOutcome::Ready;
        }

        self.notified.store(false, Ordering::Relaxed);

        if other_waits {
            self.set_wait_mode(WaitMode::Pipe);
            self.lock.unlock();
            ArmOutcome::PipeArmed
        } else {
            self.set_wait_mode(WaitMode::Cond);
            self.lock.unlock();
            ArmOutcome::CondArmed
        }
    }

    /// Parks the OS thread until a producer signals the condvar. The length
    /// recheck under the mutex closes the race with a push that ran between
    /// arming and parking. Resets the mode before returning.
    pub(crate) fn cond_wait(&self) {
        let mut guard = self.mutex.lock();
        if self.len.load(Ordering::Acquire) == 0 {
            self.cond.wait(&mut guard);
        }
        self.set_wait_mode(WaitMode::None);
    }

    /// Cancels a PIPE-mode wait, if one is armed. Returns `Some(pending)`
    /// when the mode was PIPE, where `pending` says whether entries were
    /// queued at cancellation time; residual notification bytes are always
    /// drained.
    pub(crate) fn cancel_pipe_wait(&self) -> Option<bool> {
        self.lock.lock();
        let was_pipe = self.wait_mode() == WaitMode::Pipe;
        if was_pipe {
            self.set_wait_mode(WaitMode::None);
        }
        self.lock.unlock();

        if !was_pipe {
            return None;
        }

        let pending = self.len.load(Ordering::Acquire) > 0;
        self.drain_pipe();
        Some(pending)
    }

    /// Consumer side only. Reads and discards queued notification bytes;
    /// nonblocking, stops on `EAGAIN`.
    pub(crate) fn drain_pipe(&self) {
        let mut buf = [0u8; 32];
        loop {
            match unistd::read(&self.pipe_r, &mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => break,
                Err(err) => panic!("FATAL: could not drain the notification pipe: {err}"),
            }
        }
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.pipe_r.as_raw_fd()
    }

    pub(crate) fn wait_mode(&self) -> WaitMode {
        WaitMode::from_u8(self.wait_mode.load(Ordering::Relaxed))
    }

    pub(crate) fn set_wait_mode(&self, mode: WaitMode) {
        self.wait_mode.store(mode as u8, Ordering::Relaxed);
    }

    /// Marks the queue closed; subsequent pushes observe `Closed`. Called
    /// when the owning scheduler tears down.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    fn write_pipe_byte(&self) {
        loop {
            match unistd::write(&self.pipe_w, &[0u8]) {
                Ok(_) => return,
                Err(Errno::EINTR) => continue,
                Err(err) => panic!("FATAL: could not write to the notification pipe: {err}"),
            }
        }
    }
}

impl std::fmt::Debug for ThreadQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadQueue")
            .field("capacity", &self.capacity)
            .field("entry_size", &self.entry_size)
            .field("len", &self.len())
            .field("wait_mode", &self.wait_mode())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use static_assertions::assert_impl_all;
    use std::sync::Arc;
    use std::thread;

    assert_impl_all!(ThreadQueue: Send, Sync);

    const SPIN_LIMIT: usize = 1000;

    fn entry(v: u64) -> [u8; 8] {
        v.to_le_bytes()
    }

    #[rstest]
    #[case(1)]
    #[case(4)]
    #[case(64)]
    fn test_push_pop_fifo(#[case] capacity: usize) {
        let q = ThreadQueue::new(capacity, 8, SPIN_LIMIT);

        for round in 0..3u64 {
            for i in 0..capacity as u64 {
                assert_eq!(q.push(&entry(round * 1000 + i)), Status::Success);
            }
            assert_eq!(q.push(&entry(9999)), Status::NoVacancy);

            let mut out = [0u8; 8];
            for i in 0..capacity as u64 {
                assert_eq!(q.pop(&mut out), Status::Success);
                assert_eq!(u64::from_le_bytes(out), round * 1000 + i);
            }
        }
    }

    #[test]
    fn test_zero_capacity_always_full() {
        let q = ThreadQueue::new(0, 8, SPIN_LIMIT);
        for _ in 0..10 {
            assert_eq!(q.push(&entry(1)), Status::NoVacancy);
        }
    }

    #[test]
    fn test_pop_empty_spins_out() {
        let q = ThreadQueue::new(4, 8, 10);
        let mut out = [0u8; 8];
        assert_eq!(q.pop(&mut out), Status::NoMoreData);
    }

    #[test]
    fn test_push_after_close() {
        let q = ThreadQueue::new(4, 8, SPIN_LIMIT);
        q.close();
        assert_eq!(q.push(&entry(1)), Status::Closed);
    }

    #[test]
    fn test_multi_producer_no_loss_no_duplication() {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 500;

        let q = Arc::new(ThreadQueue::new(16, 8, SPIN_LIMIT));

        let handles: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let e = entry(p * PER_PRODUCER + i);
                        while q.push(&e) == Status::NoVacancy {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let mut seen = vec![0u32; (PRODUCERS * PER_PRODUCER) as usize];
        let mut last_per_producer = vec![None::<u64>; PRODUCERS as usize];
        let mut received = 0;

        let mut out = [0u8; 8];
        while received < PRODUCERS * PER_PRODUCER {
            if q.pop(&mut out) == Status::Success {
                let v = u64::from_le_bytes(out);
                seen[v as usize] += 1;
                received += 1;

                // Entries from one producer arrive in that producer's order.
                let p = (v / PER_PRODUCER) as usize;
                let i = v % PER_PRODUCER;
                assert!(last_per_producer[p].is_none_or(|prev| prev < i));
                last_per_producer[p] = Some(i);
            }
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(seen.iter().all(|&count| count == 1));
    }

    #[test]
    fn test_consumer_arm_sees_queued_entries() {
        let q = ThreadQueue::new(4, 8, SPIN_LIMIT);
        assert_eq!(q.push(&entry(7)), Status::Success);
        assert_eq!(q.consumer_arm(false), ArmOutcome::Ready);
        assert_eq!(q.wait_mode(), WaitMode::None);
    }

    #[test]
    fn test_cond_notification_unparks_consumer() {
        let q = Arc::new(ThreadQueue::new(4, 8, SPIN_LIMIT));

        assert_eq!(q.consumer_arm(false), ArmOutcome::CondArmed);

        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                thread::sleep(std::time::Duration::from_millis(20));
                assert_eq!(q.push(&entry(42)), Status::Success);
            })
        };

        q.cond_wait();
        assert_eq!(q.wait_mode(), WaitMode::None);
        assert_eq!(q.len(), 1);

        producer.join().unwrap();
    }

    #[test]
    fn test_pipe_notification_and_drain() {
        let q = ThreadQueue::new(4, 8, SPIN_LIMIT);

        assert_eq!(q.consumer_arm(true), ArmOutcome::PipeArmed);
        assert_eq!(q.push(&entry(1)), Status::Success);

        // The transition push wrote exactly one byte.
        let mut buf = [0u8; 4];
        assert_eq!(unistd::read(&q.pipe_r, &mut buf), Ok(1));

        // Cancellation drains whatever is left and reports pending data.
        assert_eq!(q.consumer_arm(true), ArmOutcome::Ready);
        q.set_wait_mode(WaitMode::Pipe);
        assert_eq!(q.cancel_pipe_wait(), Some(true));
        assert_eq!(
            unistd::read(&q.pipe_r, &mut buf),
            Err(Errno::EAGAIN),
            "pipe must be empty after cancellation"
        );
    }
}
