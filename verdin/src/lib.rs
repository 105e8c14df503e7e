//! verdin — a per-OS-thread cooperative scheduler of stackful green
//! threads.
//!
//! Each OS thread hosts one scheduler driving lightweight tasks over
//! swapped stacks. Tasks block through a composite [`select`] on fd
//! readiness (epoll on Linux, kqueue elsewhere), typed intra-thread
//! [`stream`]s, a cross-thread bounded mailbox, and millisecond timeouts.
//!
//! ```no_run
//! let runtime = verdin::Builder::new(1).try_init().unwrap();
//!
//! runtime.spawn(|| {
//!     verdin::select(&[], &[], false, 100); // sleep 100ms
//!     assert!(verdin::is_timeout());
//! });
//!
//! runtime.run();
//! ```

mod context;

pub mod mailbox;
pub use mailbox::ThreadQueue;

pub mod poll;
pub use poll::{EventKind, FdEvent};

pub mod runtime;
pub use runtime::builder::{Builder, Runtime};
pub use runtime::clock::now_ms;
pub use runtime::{
    current_thread_id, fds_ready, is_thread_queue_ready, is_timeout, pop_thread_queue, select,
    spawn, spawn_entry, spawn_with_stack, streams_ready, thread_queue, yield_now,
};

pub mod stream;
pub use stream::{PopError, PushError, RingId, StreamReader, StreamWriter};

pub mod task;
pub use task::TaskId;

pub mod ffi;

mod utils;

/// Status codes shared by the mailbox, the streams and the C-ABI surface.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success = 0,
    /// The bounded buffer is at capacity.
    NoVacancy = 1,
    /// Nothing buffered right now; compose with `select` to wait.
    NoMoreData = 2,
    /// The peer side is closed or EOF was reached.
    Closed = 3,
}
