//! End-to-end scheduler scenarios. Each test runs on its own OS thread
//! (the default harness behavior), so every one gets a fresh thread-local
//! scheduler; thread ids come from a shared counter to keep the global
//! registry collision-free.

use super::*;
use crate::runtime::clock;
use crate::stream::{PopError, PushError, stream};
use crate::{Builder, Status};
use anyhow::Result;
use static_assertions::assert_not_impl_any;
use std::cell::{Cell, RefCell};
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

assert_not_impl_any!(Runtime: Send, Sync);

fn next_thread_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(7_000);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

#[test]
fn test_round_robin_yield_order() -> Result<()> {
    let runtime = Builder::new(next_thread_id()).try_init()?;
    let log = Rc::new(RefCell::new(Vec::new()));

    for id in 1..=3u32 {
        let log = Rc::clone(&log);
        runtime.spawn(move || {
            for _ in 0..3 {
                log.borrow_mut().push(id);
                yield_now();
            }
        });
    }

    runtime.run();

    assert_eq!(*log.borrow(), vec![1, 2, 3, 1, 2, 3, 1, 2, 3]);
    Ok(())
}

#[test]
fn test_run_with_no_tasks_returns() -> Result<()> {
    let runtime = Builder::new(next_thread_id()).try_init()?;
    runtime.run();
    Ok(())
}

#[test]
fn test_spawned_task_ids_are_unique_and_positive() -> Result<()> {
    let runtime = Builder::new(next_thread_id()).try_init()?;

    let ids: Vec<_> = (0..5).map(|_| runtime.spawn(|| {})).collect();
    let mut deduped = ids.clone();
    deduped.sort();
    deduped.dedup();

    assert_eq!(deduped.len(), ids.len());
    assert!(ids.iter().all(|id| id.as_u64() > 0));

    runtime.run();
    Ok(())
}

#[test]
fn test_timeout_fires_after_deadline() -> Result<()> {
    let runtime = Builder::new(next_thread_id()).try_init()?;
    let observed = Rc::new(Cell::new(None));

    let out = Rc::clone(&observed);
    runtime.spawn(move || {
        let start = clock::now_ms();
        select(&[], &[], false, 200);
        out.set(Some((is_timeout(), clock::now_ms() - start)));
    });

    let wall = Instant::now();
    runtime.run();

    let (timed_out, elapsed_ms) = observed.get().unwrap();
    assert!(timed_out);
    assert!(elapsed_ms >= 200, "resumed after {elapsed_ms}ms");
    assert!(wall.elapsed() < Duration::from_millis(400));
    Ok(())
}

#[test]
fn test_stream_flow_with_eof() -> Result<()> {
    let runtime = Builder::new(next_thread_id()).try_init()?;
    let (reader, writer) = stream::<u32>(4);

    let received = Rc::new(RefCell::new(Vec::new()));
    let closed = Rc::new(Cell::new(false));

    {
        let received = Rc::clone(&received);
        let closed = Rc::clone(&closed);
        runtime.spawn(move || {
            loop {
                match reader.pop() {
                    Ok(value) => received.borrow_mut().push(value),
                    Err(PopError::Empty) => select(&[], &[reader.ring_id()], false, 0),
                    Err(PopError::Closed) => {
                        closed.set(true);
                        break;
                    }
                }
            }
        });
    }

    runtime.spawn(move || {
        for i in 0..10u32 {
            let mut value = i;
            loop {
                match writer.push(value) {
                    Ok(()) => break,
                    Err(PushError::Full(rejected)) => {
                        value = rejected;
                        yield_now();
                    }
                    Err(PushError::Closed(_)) => panic!("reader closed early"),
                }
            }
        }
        writer.push_eof();
    });

    runtime.run();

    assert!(closed.get());
    assert_eq!(*received.borrow(), (0..10).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_cross_thread_mailbox_fifo() -> Result<()> {
    const ENTRIES: u64 = 1000;

    let thid = next_thread_id();
    let runtime = Builder::new(thid)
        .queue_capacity(64)
        .entry_size(8)
        .try_init()?;

    let received = Rc::new(RefCell::new(Vec::new()));
    {
        let received = Rc::clone(&received);
        runtime.spawn(move || {
            let mut buf = [0u8; 8];
            while (received.borrow().len() as u64) < ENTRIES {
                match pop_thread_queue(&mut buf) {
                    Status::Success => received.borrow_mut().push(u64::from_le_bytes(buf)),
                    Status::NoMoreData => select(&[], &[], true, 0),
                    status => panic!("unexpected mailbox status: {status:?}"),
                }
            }
        });
    }

    let producer = thread::spawn(move || {
        let queue = thread_queue(thid).expect("consumer registered before producers start");
        for i in 0..ENTRIES {
            let entry = i.to_le_bytes();
            while queue.push(&entry) == Status::NoVacancy {
                thread::yield_now();
            }
        }
    });

    runtime.run();
    producer.join().unwrap();

    assert_eq!(*received.borrow(), (0..ENTRIES).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_fd_readiness_beats_timeout() -> Result<()> {
    let runtime = Builder::new(next_thread_id()).try_init()?;
    let (pipe_r, pipe_w) = nix::unistd::pipe()?;
    let read_fd = pipe_r.as_raw_fd();

    let observed = Rc::new(Cell::new(None));
    {
        let observed = Rc::clone(&observed);
        runtime.spawn(move || {
            let _keep_open = &pipe_r;
            select(&[(read_fd, EventKind::Read)], &[], false, 500);
            observed.set(Some((fds_ready(), is_timeout())));
        });
    }

    runtime.spawn(move || {
        select(&[], &[], false, 100);
        nix::unistd::write(&pipe_w, b"x").unwrap();
    });

    let wall = Instant::now();
    runtime.run();

    let (events, timed_out) = observed.take().unwrap();
    assert!(!timed_out);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].fd, read_fd);
    assert_eq!(events[0].kind, EventKind::Read);
    assert!(
        wall.elapsed() < Duration::from_millis(400),
        "the reader must wake on the write, not the timeout"
    );
    Ok(())
}

#[test]
fn test_composite_wake_reports_stream_only() -> Result<()> {
    let runtime = Builder::new(next_thread_id()).try_init()?;
    let (pipe_r, _pipe_w) = nix::unistd::pipe()?;
    let read_fd = pipe_r.as_raw_fd();

    let (reader, writer) = stream::<u8>(4);
    let ring = reader.ring_id();

    let observed = Rc::new(Cell::new(None));
    {
        let observed = Rc::clone(&observed);
        runtime.spawn(move || {
            let _keep_open = &pipe_r;
            select(&[(read_fd, EventKind::Read)], &[ring], false, 1000);

            let tables = unsafe {
                let s = crate::context::scheduler_ptr();
                ((*s).wait_fd_len(), (*s).wait_stream_len(), (*s).timeout_len())
            };
            observed.set(Some((
                streams_ready(),
                fds_ready(),
                is_timeout(),
                is_thread_queue_ready(),
                tables,
                reader.pop(),
            )));
        });
    }

    runtime.spawn(move || {
        select(&[], &[], false, 50);
        writer.push(7).unwrap();
    });

    runtime.run();

    let (streams, fds, timed_out, thq, tables, popped) = observed.take().unwrap();
    assert_eq!(streams, vec![ring]);
    assert!(fds.is_empty());
    assert!(!timed_out);
    assert!(!thq);
    // Every registration the select placed is gone again.
    assert_eq!(tables, (0, 0, 0));
    assert_eq!(popped, Ok(7));
    Ok(())
}

#[test]
fn test_cancelled_fd_registration_leaves_tables_clean() -> Result<()> {
    let runtime = Builder::new(next_thread_id()).try_init()?;
    let (pipe_r, _pipe_w) = nix::unistd::pipe()?;
    let read_fd = pipe_r.as_raw_fd();

    let observed = Rc::new(Cell::new(None));
    {
        let observed = Rc::clone(&observed);
        runtime.spawn(move || {
            let _keep_open = &pipe_r;
            select(&[(read_fd, EventKind::Read)], &[], false, 20);

            let tables = unsafe {
                let s = crate::context::scheduler_ptr();
                ((*s).wait_fd_len(), (*s).timeout_len())
            };
            observed.set(Some((is_timeout(), fds_ready(), tables)));
        });
    }

    runtime.run();

    let (timed_out, events, tables) = observed.take().unwrap();
    assert!(timed_out);
    assert!(events.is_empty());
    assert_eq!(tables, (0, 0));
    Ok(())
}

#[test]
fn test_stopped_tasks_are_reaped_while_running() -> Result<()> {
    let runtime = Builder::new(next_thread_id()).try_init()?;
    let counts = Rc::new(Cell::new((0, 0)));

    {
        let counts = Rc::clone(&counts);
        runtime.spawn(move || {
            spawn(|| {});
            let before = unsafe { (*crate::context::scheduler_ptr()).task_count() };

            // The child runs, stops, and is reaped when we resume.
            yield_now();

            let after = unsafe { (*crate::context::scheduler_ptr()).task_count() };
            counts.set((before, after));
        });
    }

    runtime.run();

    assert_eq!(counts.get(), (2, 1));
    Ok(())
}

#[test]
fn test_double_init_on_one_thread_fails() -> Result<()> {
    let runtime = Builder::new(next_thread_id()).try_init()?;
    assert!(Builder::new(next_thread_id()).try_init().is_err());

    // Dropping the handle tears the scheduler down and frees the slot.
    drop(runtime);
    let runtime = Builder::new(next_thread_id()).try_init()?;
    runtime.run();
    Ok(())
}

#[test]
fn test_duplicate_thread_id_rejected() -> Result<()> {
    let thid = next_thread_id();
    let runtime = Builder::new(thid).try_init()?;

    let rejected = thread::spawn(move || Builder::new(thid).try_init().is_err())
        .join()
        .unwrap();
    assert!(rejected);

    runtime.run();

    // The id is free again after the runtime completed.
    assert!(thread_queue(thid).is_none());
    Ok(())
}

#[test]
fn test_mailbox_closes_after_run() -> Result<()> {
    let thid = next_thread_id();
    let runtime = Builder::new(thid).entry_size(8).try_init()?;

    let queue = thread_queue(thid).unwrap();
    runtime.run();

    assert_eq!(queue.push(&[0u8; 8]), Status::Closed);
    Ok(())
}

#[test]
fn test_entry_size_zero_rejected() {
    assert!(Builder::new(next_thread_id()).entry_size(0).try_init().is_err());
}
