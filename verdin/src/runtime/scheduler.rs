//! The per-thread cooperative scheduler.
//!
//! One instance per OS thread, reached through the thread-local context.
//! The scheduling procedure ([`schedule`]) runs on whatever stack entered
//! it: the root frame during `run()`, a task's stack at every suspension
//! point. Bookkeeping is done through short reborrows of the scheduler
//! pointer; the actual stack switches happen between those sections with no
//! live borrows.

use crate::context;
use crate::mailbox::{ArmOutcome, ThreadQueue, WaitMode};
use crate::poll::{EvKey, EventKind, FdEvent, Poller};
use crate::runtime::RuntimeConfig;
use crate::runtime::clock;
use crate::stream::RingId;
use crate::task::{Snapshot, Stack, Task, TaskId, TaskRef, TaskState, switch};
use anyhow::Result;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::ffi::c_void;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Deadline-ordered timeout index with a by-task view for O(1) removal when
/// a task wakes from another cause. The sequence number makes equal
/// deadlines expire in insertion order.
#[derive(Debug, Default)]
struct TimeoutIndex {
    by_deadline: BTreeSet<(u64, u64, TaskRef)>,
    by_task: HashMap<TaskRef, (u64, u64)>,
    seq: u64,
}

impl TimeoutIndex {
    fn insert(&mut self, deadline: u64, task: TaskRef) {
        self.seq += 1;
        self.by_deadline.insert((deadline, self.seq, task));
        self.by_task.insert(task, (deadline, self.seq));
    }

    fn remove(&mut self, task: TaskRef) {
        if let Some((deadline, seq)) = self.by_task.remove(&task) {
            self.by_deadline.remove(&(deadline, seq, task));
        }
    }

    fn pop_expired(&mut self, now: u64) -> Option<TaskRef> {
        let &(deadline, seq, task) = self.by_deadline.first()?;
        if deadline > now {
            return None;
        }
        self.by_deadline.remove(&(deadline, seq, task));
        self.by_task.remove(&task);
        Some(task)
    }

    fn earliest_deadline(&self) -> Option<u64> {
        self.by_deadline.first().map(|&(deadline, _, _)| deadline)
    }

    fn is_empty(&self) -> bool {
        self.by_deadline.is_empty()
    }

    fn len(&self) -> usize {
        self.by_deadline.len()
    }
}

#[derive(Debug)]
pub(crate) struct Scheduler {
    pub(crate) cfg: RuntimeConfig,

    /// Per-scheduler id counter; see [`Scheduler::next_task_id`].
    id_counter: u64,

    /// Owning table of task records, keyed by id. Everything else holds
    /// address-identity handles into these boxes.
    tasks: HashMap<TaskId, Box<Task>>,

    ready: VecDeque<TaskRef>,
    stopped: Vec<TaskRef>,

    wait_fd: HashMap<EvKey, HashSet<TaskRef>>,
    wait_stream: HashMap<RingId, TaskRef>,
    timeouts: TimeoutIndex,
    wait_thq: Option<TaskRef>,

    running: Option<TaskRef>,

    /// Saved context of `run()`'s root frame; the loop resumes it when no
    /// work remains.
    pub(crate) root_snapshot: Snapshot,

    poller: Poller,
    pub(crate) queue: Arc<ThreadQueue>,

    /// Whether the mailbox notification pipe is currently registered with
    /// the readiness handle.
    pipe_armed: bool,
}

impl Scheduler {
    pub(crate) fn try_new(cfg: RuntimeConfig) -> Result<Self> {
        let poller = Poller::try_new()?;
        let queue = Arc::new(ThreadQueue::new(
            cfg.queue_capacity,
            cfg.entry_size,
            cfg.pop_spin_limit,
        ));

        Ok(Self {
            cfg,
            id_counter: 0,
            tasks: HashMap::new(),
            ready: VecDeque::new(),
            stopped: Vec::new(),
            wait_fd: HashMap::new(),
            wait_stream: HashMap::new(),
            timeouts: TimeoutIndex::default(),
            wait_thq: None,
            running: None,
            root_snapshot: Snapshot::new(),
            poller,
            queue,
            pipe_armed: false,
        })
    }

    pub(crate) fn running(&self) -> Option<TaskRef> {
        self.running
    }

    // --- Spawn ---

    /// Monotonically chosen positive id, skipping anything still present in
    /// the task table so reuse after wraparound stays safe.
    fn next_task_id(&mut self) -> TaskId {
        loop {
            self.id_counter = self.id_counter.wrapping_add(1);
            let Some(id) = TaskId::new(self.id_counter) else {
                continue;
            };
            if !self.tasks.contains_key(&id) {
                return id;
            }
        }
    }

    /// Creates a READY task and appends it to the ready deque. Never
    /// suspends. Stack exhaustion terminates (resource-exhaustion policy).
    pub(crate) fn spawn_raw(
        &mut self,
        entry: extern "C" fn(*mut c_void),
        arg: *mut c_void,
        stack_size: usize,
    ) -> TaskId {
        let id = self.next_task_id();

        let stack = match Stack::try_new(stack_size) {
            Ok(stack) => stack,
            Err(err) => panic!("FATAL: could not allocate a task stack: {err:#}"),
        };

        let mut task = Box::new(Task::new(id, stack));
        let task_ref = TaskRef::new(&mut task);
        task.stack
            .prepare(entry as usize as u64, arg as usize as u64, task_ref.as_ptr() as u64);

        self.ready.push_back(task_ref);
        self.tasks.insert(id, task);

        id
    }

    // --- Select registration (the non-switching half of `select`) ---

    pub(crate) fn register_select(
        &mut self,
        fds: &[(RawFd, EventKind)],
        streams: &[RingId],
        wait_thq: bool,
        timeout_ms: u64,
    ) {
        let task_ref = self
            .running
            .expect("select may only be called from inside a task");
        let task = unsafe { task_ref.as_mut() };

        task.state = TaskState::empty();
        task.clear_fired();

        if timeout_ms > 0 {
            task.state |= TaskState::WAITING_TIMEOUT;
            self.timeouts.insert(clock::now_ms() + timeout_ms, task_ref);
        }

        if !fds.is_empty() {
            task.state |= TaskState::WAITING_FD;

            for &(fd, kind) in fds {
                let has_read = self.wait_fd.contains_key(&EvKey {
                    fd,
                    kind: EventKind::Read,
                });
                let has_write = self.wait_fd.contains_key(&EvKey {
                    fd,
                    kind: EventKind::Write,
                });

                self.poller.register(fd, kind, has_read, has_write);
                self.wait_fd
                    .entry(EvKey { fd, kind })
                    .or_default()
                    .insert(task_ref);
                task.waiting_fds.push(EvKey { fd, kind });
            }

            self.poller.commit();
        }

        if !streams.is_empty() {
            task.state |= TaskState::WAITING_STREAM;

            for &ring in streams {
                let previous = self.wait_stream.insert(ring, task_ref);
                assert!(
                    previous.is_none_or(|other| other == task_ref),
                    "a stream supports a single waiting reader"
                );
                task.waiting_streams.push(ring);
            }
        }

        if wait_thq {
            assert!(
                self.wait_thq.is_none(),
                "the thread-queue supports a single waiting consumer"
            );
            task.state |= TaskState::WAITING_THQ;
            self.wait_thq = Some(task_ref);
        }

        // A select with no registrations is a plain yield.
        if task.state.is_empty() {
            task.state = TaskState::SUSPENDING;
            self.ready.push_back(task_ref);
        }
    }

    // --- Loop bookkeeping ---

    /// Step 1: a task that re-entered via yield is requeued; one that
    /// returned from its entry is moved to the stopped list.
    fn requeue_running(&mut self) {
        let Some(running) = self.running else { return };
        let task = unsafe { running.as_mut() };

        if task.state == TaskState::RUNNING {
            task.state = TaskState::SUSPENDING;
            self.ready.push_back(running);
        } else if task.state == TaskState::STOP {
            task.state = TaskState::empty();
            self.stopped.push(running);
        }
    }

    /// Step 2: expire due deadlines in order. A task some other event
    /// already woke keeps its fired-timeout flag false; the index entry is
    /// dropped either way.
    fn drain_timeouts(&mut self) {
        let now = clock::now_ms();

        while let Some(task_ref) = self.timeouts.pop_expired(now) {
            let task = unsafe { task_ref.as_mut() };
            if !task.state.contains(TaskState::SUSPENDING) {
                task.state |= TaskState::SUSPENDING;
                task.fired_timeout = true;
                self.ready.push_back(task_ref);
            }
        }
    }

    /// Step 3: content arrived while the consumer was not blocked anywhere.
    fn wake_thq_if_pending(&mut self) {
        if self.wait_thq.is_some()
            && self.queue.wait_mode() == WaitMode::None
            && !self.queue.is_empty()
        {
            self.wake_thq_waiter();
        }
    }

    fn wake_thq_waiter(&mut self) {
        if let Some(waiter) = self.wait_thq.take() {
            let task = unsafe { waiter.as_mut() };
            if !task.state.contains(TaskState::SUSPENDING) {
                task.state |= TaskState::SUSPENDING;
                self.ready.push_back(waiter);
            }
            task.fired_thq = true;
        }
    }

    fn pop_ready(&mut self) -> Option<TaskRef> {
        self.ready.pop_front()
    }

    /// Marks `next` running and returns the state it arrived with; the
    /// caller picks the dispatch flavor from it.
    fn begin_dispatch(&mut self, next: TaskRef) -> TaskState {
        let task = unsafe { next.as_mut() };
        let incoming = task.state;
        task.state = TaskState::RUNNING;
        self.running = Some(next);
        incoming
    }

    /// Step 4 cleanup for a resuming task: every registration its select
    /// placed is cleared from the tables and from the kernel.
    fn cancel_waits(&mut self, task_ref: TaskRef, incoming: TaskState) {
        let task = unsafe { task_ref.as_mut() };

        if !task.waiting_fds.is_empty() {
            for key in std::mem::take(&mut task.waiting_fds) {
                let Some(waiters) = self.wait_fd.get_mut(&key) else {
                    // Already fired and erased during distribution.
                    continue;
                };
                waiters.remove(&task_ref);

                if waiters.is_empty() {
                    self.wait_fd.remove(&key);

                    let want_read = self.wait_fd.contains_key(&EvKey {
                        fd: key.fd,
                        kind: EventKind::Read,
                    });
                    let want_write = self.wait_fd.contains_key(&EvKey {
                        fd: key.fd,
                        kind: EventKind::Write,
                    });
                    self.poller.unregister(key.fd, key.kind, want_read, want_write);
                }
            }

            self.poller.commit();
        }

        for ring in std::mem::take(&mut task.waiting_streams) {
            self.wait_stream.remove(&ring);
        }

        if incoming.contains(TaskState::WAITING_TIMEOUT) {
            self.timeouts.remove(task_ref);
        }

        if incoming.contains(TaskState::WAITING_THQ) {
            if let Some(pending) = self.queue.cancel_pipe_wait() {
                if pending {
                    task.fired_thq = true;
                }
                let fd = self.queue.read_fd();
                self.poller.disarm_pipe(fd);
                self.pipe_armed = false;
            }
            self.wait_thq = None;
        }
    }

    fn has_other_waits(&self) -> bool {
        !self.wait_fd.is_empty() || !self.timeouts.is_empty()
    }

    /// Drops stopped task records: guard page lifted, stack unmapped, id
    /// entry removed. Only called from a live context (root resume or a
    /// freshly resumed task), never on a dying stack.
    pub(crate) fn reap_stopped(&mut self) {
        for task_ref in std::mem::take(&mut self.stopped) {
            let id = unsafe { (*task_ref.as_ptr()).id };
            self.tasks.remove(&id);
        }
    }

    // --- Readiness ---

    /// Polls the readiness handle and distributes events. `block` bounds
    /// the wait by the earliest timeout deadline; with nothing registered
    /// in the kernel at all, a plain sleep stands in for the poll.
    fn poll_fds(&mut self, block: bool) {
        let timeout = if block {
            self.timeouts
                .earliest_deadline()
                .map(|deadline| deadline.saturating_sub(clock::now_ms()))
        } else {
            Some(0)
        };

        if block && self.wait_fd.is_empty() && !self.pipe_armed {
            if let Some(ms) = timeout
                && ms > 0
            {
                std::thread::sleep(Duration::from_millis(ms));
            }
            return;
        }

        let capacity = self.wait_fd.len() + 1;
        for event in self.poller.wait(timeout, capacity) {
            self.dispatch_event(event);
        }
    }

    /// Distributes one delivered readiness event to its waiters.
    fn dispatch_event(&mut self, event: FdEvent) {
        // The mailbox notification pipe wakes the thread-queue waiter.
        if self.pipe_armed
            && event.fd == self.queue.read_fd()
            && event.kind == EventKind::Read
            && self.queue.wait_mode() == WaitMode::Pipe
            && self.wait_thq.is_some()
        {
            self.queue.set_wait_mode(WaitMode::None);
            self.wake_thq_waiter();
            self.queue.drain_pipe();

            let fd = self.queue.read_fd();
            self.poller.pipe_fired_cleanup(fd);
            self.pipe_armed = false;
            return;
        }

        let key = EvKey {
            fd: event.fd,
            kind: event.kind,
        };
        let Some(waiters) = self.wait_fd.remove(&key) else {
            return;
        };

        for task_ref in waiters {
            let task = unsafe { task_ref.as_mut() };
            if !task.state.contains(TaskState::SUSPENDING) {
                task.state |= TaskState::SUSPENDING;
                self.ready.push_back(task_ref);
            }
            task.fired_fds.push(event);
        }

        let want_read = self.wait_fd.contains_key(&EvKey {
            fd: event.fd,
            kind: EventKind::Read,
        });
        let want_write = self.wait_fd.contains_key(&EvKey {
            fd: event.fd,
            kind: EventKind::Write,
        });
        self.poller.rearm_after_fire(event.fd, want_read, want_write);
    }

    // --- Stream wake (called by stream pushes through the context) ---

    pub(crate) fn notify_stream(&mut self, ring: RingId) {
        if let Some(task_ref) = self.wait_stream.remove(&ring) {
            let task = unsafe { task_ref.as_mut() };
            if !task.state.contains(TaskState::SUSPENDING) {
                task.state |= TaskState::SUSPENDING;
                self.ready.push_back(task_ref);
            }
            task.fired_streams.push(ring);
        }
    }
}

// Test-only visibility into the wait tables for invariant checks.
#[cfg(test)]
impl Scheduler {
    pub(crate) fn wait_fd_len(&self) -> usize {
        self.wait_fd.len()
    }

    pub(crate) fn wait_stream_len(&self) -> usize {
        self.wait_stream.len()
    }

    pub(crate) fn timeout_len(&self) -> usize {
        self.timeouts.len()
    }

    pub(crate) fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

/// The scheduling procedure. Runs until it switches to another context;
/// returns when the context that called it is resumed.
///
/// # Safety
///
/// Must run on a thread with an initialized scheduler, either from `run()`'s
/// root frame or from a task belonging to that scheduler.
pub(crate) unsafe fn schedule() {
    let s = context::scheduler_ptr();

    unsafe {
        // Opportunistic distribution before the loop body.
        if !(*s).wait_fd.is_empty() {
            (*s).poll_fds(false);
        }

        loop {
            let prev = (*s).running();

            (*s).requeue_running();
            (*s).drain_timeouts();
            (*s).wake_thq_if_pending();

            if let Some(next) = (*s).pop_ready() {
                let incoming = (*s).begin_dispatch(next);

                if incoming.contains(TaskState::READY) {
                    // First dispatch: enter through the spawn trampoline.
                    let top = (*next.as_ptr()).stack.trampoline_top();

                    match prev {
                        Some(prev) => {
                            switch::ctx_switch_invoke(
                                &raw mut (*prev.as_ptr()).snapshot,
                                top,
                            );
                            // `prev` was resumed.
                            (*s).reap_stopped();
                            return;
                        }
                        None => switch::task_invoke(top),
                    }
                } else {
                    (*s).cancel_waits(next, incoming);

                    if prev == Some(next) {
                        // The running task yielded straight back to itself.
                        return;
                    }

                    match prev {
                        Some(prev) => {
                            switch::ctx_switch(
                                &raw mut (*prev.as_ptr()).snapshot,
                                &raw const (*next.as_ptr()).snapshot,
                            );
                            // `prev` was resumed.
                            (*s).reap_stopped();
                            return;
                        }
                        None => switch::ctx_resume(&raw const (*next.as_ptr()).snapshot),
                    }
                }
            }

            // Step 5: a thread-queue waiter exists but nothing is runnable.
            if (*s).wait_thq.is_some() {
                let other_waits = (*s).has_other_waits();
                match (*s).queue.consumer_arm(other_waits) {
                    ArmOutcome::Ready => {
                        (*s).wake_thq_waiter();
                        continue;
                    }
                    ArmOutcome::CondArmed => {
                        // Nothing else to wait for: park the OS thread.
                        (*s).queue.cond_wait();
                        (*s).wake_thq_waiter();
                        continue;
                    }
                    ArmOutcome::PipeArmed => {
                        // The pipe may still be registered from an earlier
                        // pass that woke on some other descriptor.
                        if !(*s).pipe_armed {
                            let fd = (*s).queue.read_fd();
                            (*s).poller.arm_pipe(fd);
                            (*s).pipe_armed = true;
                        }
                    }
                }
            } else if (*s).wait_fd.is_empty() && (*s).timeouts.is_empty() {
                // Step 7: nothing left at all.
                break;
            }

            // Step 6: block in the readiness handle until something becomes
            // runnable.
            loop {
                (*s).poll_fds(true);
                (*s).drain_timeouts();
                if !(*s).ready.is_empty() {
                    break;
                }
            }
        }

        switch::ctx_resume(&raw const (*s).root_snapshot);
    }
}
