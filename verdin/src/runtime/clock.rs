//! Coarse monotonic millisecond clock.
//!
//! A single daemon thread, started at first scheduler init, bumps a shared
//! cell roughly every millisecond. Schedulers read it racily to stamp
//! timeout deadlines; millisecond-scale jitter is within semantics. The
//! relaxed atomic gives the same cheap read the original's plain cell did,
//! without torn values.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

static CLOCK_MS: AtomicU64 = AtomicU64::new(0);
static DAEMON: OnceLock<()> = OnceLock::new();

const TICK: Duration = Duration::from_millis(1);

/// Milliseconds since the clock daemon started. Monotonic, nondecreasing.
pub fn now_ms() -> u64 {
    CLOCK_MS.load(Ordering::Relaxed)
}

/// Starts the daemon thread on first call; later calls are no-ops.
pub(crate) fn ensure_daemon() {
    DAEMON.get_or_init(|| {
        tracing::debug!("starting the monotonic clock daemon");

        thread::Builder::new()
            .name("verdin-clock".into())
            .spawn(|| {
                let start = Instant::now();
                loop {
                    CLOCK_MS.store(start.elapsed().as_millis() as u64, Ordering::Relaxed);
                    thread::sleep(TICK);
                }
            })
            .expect("FATAL: could not spawn the clock daemon thread");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances_monotonically() {
        ensure_daemon();

        let first = now_ms();
        thread::sleep(Duration::from_millis(25));
        let second = now_ms();

        assert!(second >= first + 10, "clock barely moved: {first} -> {second}");

        thread::sleep(Duration::from_millis(5));
        assert!(now_ms() >= second);
    }
}
