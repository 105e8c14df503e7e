//! C-ABI surface for embedders.
//!
//! Thin wrappers over the Rust API, following the shape of the original
//! embedder interface: the scheduler is the thread-local singleton, stream
//! endpoints and foreign mailbox handles are opaque pointers, statuses are
//! the shared [`Status`] enumeration.
//!
//! The pointers returned by `verdin_get_fds_ready` / `verdin_get_streams_ready`
//! point into the running task's fired lists and stay valid until that task's
//! next `verdin_select`.

use crate::poll::{EvKey, FdEvent};
use crate::stream::{PushError, RingId, StreamReader, StreamWriter};
use crate::{Status, context, mailbox::ThreadQueue, runtime};
use std::ffi::c_void;
use std::sync::Arc;

/// Entry point of a spawned task.
pub type VerdinEntry = extern "C" fn(*mut c_void);

// --- Lifecycle ---

/// Creates and registers the scheduler of the current OS thread.
/// Returns false on double-init, a taken thread id, or bad configuration.
///
/// The runtime handle is intentionally leaked into the thread-local
/// context; `verdin_run` performs the teardown when the loop ends.
#[unsafe(no_mangle)]
pub extern "C" fn verdin_init(thread_id: u64, queue_capacity: usize, entry_size: usize) -> bool {
    let built = runtime::Builder::new(thread_id)
        .queue_capacity(queue_capacity)
        .entry_size(entry_size)
        .try_init();

    match built {
        Ok(handle) => {
            // Teardown happens at the end of verdin_run.
            std::mem::forget(handle);
            true
        }
        Err(err) => {
            tracing::error!("verdin_init failed: {err:#}");
            false
        }
    }
}

/// Spawns a task with the default stack size.
///
/// # Safety
///
/// `func` must be safe to call with `arg` on a fresh stack.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn verdin_spawn(func: VerdinEntry, arg: *mut c_void) {
    let stack_size = unsafe { (*context::scheduler_ptr()).cfg.default_stack_size };
    let _ = unsafe { runtime::spawn_entry(func, arg, stack_size) };
}

/// Drives the scheduler until no work remains, then tears it down and
/// releases the thread id.
#[unsafe(no_mangle)]
pub extern "C" fn verdin_run() {
    let thread_id = runtime::current_thread_id();
    runtime::Runtime::from_thread_id(thread_id).run();
}

#[unsafe(no_mangle)]
pub extern "C" fn verdin_yield() {
    runtime::yield_now();
}

#[unsafe(no_mangle)]
pub extern "C" fn verdin_get_clock() -> u64 {
    runtime::clock::now_ms()
}

#[unsafe(no_mangle)]
pub extern "C" fn verdin_get_thread_id() -> u64 {
    runtime::current_thread_id()
}

// --- Composite wait and read-outs ---

/// Composite wait. `fds`/`streams` may be null when their count
/// is zero; `streams` entries are ring identities from the stream-id
/// functions below. `timeout_ms == 0` means no timeout.
///
/// # Safety
///
/// `fds` and `streams` must be valid for their given lengths.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn verdin_select(
    fds: *const EvKey,
    num_fds: usize,
    streams: *const RingId,
    num_streams: usize,
    wait_thq: bool,
    timeout_ms: u64,
) {
    let fds = if num_fds == 0 {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(fds, num_fds) }
    };
    let streams = if num_streams == 0 {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(streams, num_streams) }
    };

    let pairs: Vec<_> = fds.iter().map(|key| (key.fd, key.kind)).collect();
    runtime::select(&pairs, streams, wait_thq, timeout_ms);
}

/// # Safety
///
/// `events` and `len` must be valid out-pointers.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn verdin_get_fds_ready(events: *mut *const FdEvent, len: *mut usize) {
    unsafe {
        let task = (*context::scheduler_ptr())
            .running()
            .expect("verdin_get_fds_ready requires a running task");
        let fired = &(*task.as_ptr()).fired_fds;
        *events = fired.as_ptr();
        *len = fired.len();
    }
}

/// # Safety
///
/// `streams` and `len` must be valid out-pointers.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn verdin_get_streams_ready(streams: *mut *const RingId, len: *mut usize) {
    unsafe {
        let task = (*context::scheduler_ptr())
            .running()
            .expect("verdin_get_streams_ready requires a running task");
        let fired = &(*task.as_ptr()).fired_streams;
        *streams = fired.as_ptr();
        *len = fired.len();
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn verdin_is_timeout() -> bool {
    runtime::is_timeout()
}

#[unsafe(no_mangle)]
pub extern "C" fn verdin_is_ready_threadq() -> bool {
    runtime::is_thread_queue_ready()
}

// --- Cross-thread mailbox ---

/// Resolves the mailbox of the scheduler registered under `thread_id`.
/// Returns null if no such scheduler exists. Release with
/// `verdin_release_thread_queue`.
#[unsafe(no_mangle)]
pub extern "C" fn verdin_get_thread_queue(thread_id: u64) -> *const c_void {
    match runtime::thread_queue(thread_id) {
        Some(queue) => Arc::into_raw(queue) as *const c_void,
        None => std::ptr::null(),
    }
}

/// # Safety
///
/// `queue` must come from `verdin_get_thread_queue` and not be used after.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn verdin_release_thread_queue(queue: *const c_void) {
    if !queue.is_null() {
        drop(unsafe { Arc::from_raw(queue as *const ThreadQueue) });
    }
}

/// Producer push; callable from any OS thread. `entry` must hold the
/// queue's entry size in bytes.
///
/// # Safety
///
/// `queue` must come from `verdin_get_thread_queue` and still be held;
/// `entry` must be valid for the queue's entry size.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn verdin_push_thread_queue(
    queue: *const c_void,
    entry: *const u8,
) -> Status {
    let queue = unsafe { &*(queue as *const ThreadQueue) };
    let entry = unsafe { std::slice::from_raw_parts(entry, queue.entry_size()) };
    queue.push(entry)
}

/// Consumer pop from the current thread's own mailbox.
///
/// # Safety
///
/// `entry` must be valid for the configured entry size.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn verdin_pop_thread_queue(entry: *mut u8) -> Status {
    let entry_size = unsafe { (*context::scheduler_ptr()).cfg.entry_size };
    let entry = unsafe { std::slice::from_raw_parts_mut(entry, entry_size) };
    runtime::pop_thread_queue(entry)
}

// --- Pointer-element streams ---

type PtrReader = StreamReader<*mut c_void>;
type PtrWriter = StreamWriter<*mut c_void>;

/// Creates a pointer-element stream, returning opaque endpoint handles.
///
/// # Safety
///
/// `reader` and `writer` must be valid out-pointers.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn verdin_make_ptr_stream(
    capacity: usize,
    reader: *mut *mut c_void,
    writer: *mut *mut c_void,
) {
    let (rd, wr) = crate::stream::stream::<*mut c_void>(capacity);
    unsafe {
        *reader = Box::into_raw(Box::new(rd)) as *mut c_void;
        *writer = Box::into_raw(Box::new(wr)) as *mut c_void;
    }
}

/// # Safety
///
/// `writer` must be a live handle from `verdin_make_ptr_stream`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn verdin_push_stream_ptr(writer: *mut c_void, data: *mut c_void) -> Status {
    let writer = unsafe { &*(writer as *const PtrWriter) };
    match writer.push(data) {
        Ok(()) => Status::Success,
        Err(err) => err.status(),
    }
}

/// # Safety
///
/// `reader` must be a live handle; `data` a valid out-pointer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn verdin_pop_stream_ptr(
    reader: *mut c_void,
    data: *mut *mut c_void,
) -> Status {
    let reader = unsafe { &*(reader as *const PtrReader) };
    match reader.pop() {
        Ok(value) => {
            unsafe { *data = value };
            Status::Success
        }
        Err(err) => err.status(),
    }
}

/// # Safety
///
/// `writer` must be a live handle from `verdin_make_ptr_stream`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn verdin_push_stream_eof(writer: *mut c_void) {
    let writer = unsafe { &*(writer as *const PtrWriter) };
    writer.push_eof();
}

/// Ring identity of a pointer-stream endpoint, for `verdin_select`.
///
/// # Safety
///
/// `reader` must be a live handle from `verdin_make_ptr_stream`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn verdin_ptr_stream_ring(reader: *mut c_void) -> RingId {
    unsafe { &*(reader as *const PtrReader) }.ring_id()
}

/// # Safety
///
/// `reader` must come from `verdin_make_ptr_stream` and not be used after.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn verdin_close_ptr_stream_reader(reader: *mut c_void) {
    drop(unsafe { Box::from_raw(reader as *mut PtrReader) });
}

/// # Safety
///
/// `writer` must come from `verdin_make_ptr_stream` and not be used after.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn verdin_close_ptr_stream_writer(writer: *mut c_void) {
    drop(unsafe { Box::from_raw(writer as *mut PtrWriter) });
}

// --- Byte-vector streams ---

struct BytesReader {
    inner: StreamReader<Box<[u8]>>,
    entry_size: usize,
}

struct BytesWriter {
    inner: StreamWriter<Box<[u8]>>,
    entry_size: usize,
}

/// Creates a stream of fixed-width byte entries.
///
/// # Safety
///
/// `reader` and `writer` must be valid out-pointers.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn verdin_make_bytes_stream(
    capacity: usize,
    entry_size: usize,
    reader: *mut *mut c_void,
    writer: *mut *mut c_void,
) {
    let (rd, wr) = crate::stream::stream::<Box<[u8]>>(capacity);
    unsafe {
        *reader = Box::into_raw(Box::new(BytesReader {
            inner: rd,
            entry_size,
        })) as *mut c_void;
        *writer = Box::into_raw(Box::new(BytesWriter {
            inner: wr,
            entry_size,
        })) as *mut c_void;
    }
}

/// # Safety
///
/// `writer` must be a live handle; `data` valid for the entry size.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn verdin_push_stream_bytes(writer: *mut c_void, data: *const u8) -> Status {
    let writer = unsafe { &*(writer as *const BytesWriter) };
    let entry = unsafe { std::slice::from_raw_parts(data, writer.entry_size) };

    match writer.inner.push(entry.to_vec().into_boxed_slice()) {
        Ok(()) => Status::Success,
        Err(PushError::Full(_)) => Status::NoVacancy,
        Err(PushError::Closed(_)) => Status::Closed,
    }
}

/// # Safety
///
/// `reader` must be a live handle; `data` valid for the entry size.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn verdin_pop_stream_bytes(reader: *mut c_void, data: *mut u8) -> Status {
    let reader = unsafe { &*(reader as *const BytesReader) };
    match reader.inner.pop() {
        Ok(entry) => {
            let out = unsafe { std::slice::from_raw_parts_mut(data, reader.entry_size) };
            out.copy_from_slice(&entry);
            Status::Success
        }
        Err(err) => err.status(),
    }
}

/// # Safety
///
/// `writer` must be a live handle from `verdin_make_bytes_stream`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn verdin_push_stream_bytes_eof(writer: *mut c_void) {
    unsafe { &*(writer as *const BytesWriter) }.inner.push_eof();
}

/// Ring identity of a byte-stream endpoint, for `verdin_select`.
///
/// # Safety
///
/// `reader` must be a live handle from `verdin_make_bytes_stream`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn verdin_bytes_stream_ring(reader: *mut c_void) -> RingId {
    unsafe { &*(reader as *const BytesReader) }.inner.ring_id()
}

/// # Safety
///
/// `reader` must come from `verdin_make_bytes_stream` and not be used after.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn verdin_close_bytes_stream_reader(reader: *mut c_void) {
    drop(unsafe { Box::from_raw(reader as *mut BytesReader) });
}

/// # Safety
///
/// `writer` must come from `verdin_make_bytes_stream` and not be used after.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn verdin_close_bytes_stream_writer(writer: *mut c_void) {
    drop(unsafe { Box::from_raw(writer as *mut BytesWriter) });
}
