use std::sync::atomic::{AtomicBool, Ordering};

/// A minimal test-and-test-and-set spin lock.
///
/// The mailbox holds this lock only for a handful of loads and stores (slot
/// copy, cursor bumps, notification bookkeeping), so spinning beats parking.
/// Locking and unlocking are split on purpose: the notification protocol
/// releases the lock *before* signaling the condvar or writing to the pipe.
#[derive(Debug, Default)]
pub(crate) struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    pub(crate) const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    pub(crate) fn lock(&self) {
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }

            while self.locked.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
    }

    pub(crate) fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_spin_lock_mutual_exclusion() {
        const THREADS: usize = 8;
        const ITERS: usize = 10_000;

        struct Shared {
            lock: SpinLock,
            counter: std::cell::UnsafeCell<usize>,
        }
        unsafe impl Sync for Shared {}

        let shared = Arc::new(Shared {
            lock: SpinLock::new(),
            counter: std::cell::UnsafeCell::new(0),
        });

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    for _ in 0..ITERS {
                        shared.lock.lock();
                        unsafe { *shared.counter.get() += 1 };
                        shared.lock.unlock();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(unsafe { *shared.counter.get() }, THREADS * ITERS);
    }
}
