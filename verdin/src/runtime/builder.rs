//! Runtime construction and teardown.

use crate::context;
use crate::runtime::registry::{self, RegistryEntry};
use crate::runtime::scheduler::{self, Scheduler};
use crate::runtime::{RuntimeConfig, clock};
use crate::task::{TaskId, switch};
use anyhow::{Result, anyhow};
use std::marker::PhantomData;
use std::sync::Arc;

const DEFAULT_QUEUE_CAPACITY: usize = 256;

const DEFAULT_ENTRY_SIZE: usize = 64;

/// Fifty 4 KiB pages, the sizing the original runtime spawns with.
const DEFAULT_STACK_SIZE: usize = 4096 * 50;

/// How long `pop_thread_queue` spins on an empty mailbox before reporting
/// `NoMoreData`.
const DEFAULT_POP_SPIN_LIMIT: usize = 1000;

/// Configures and initializes the scheduler of the current OS thread.
///
/// `thread_id` is the caller-chosen 64-bit identifier other OS threads use
/// to look up this scheduler's mailbox.
#[derive(Debug, Clone)]
pub struct Builder {
    thread_id: u64,
    queue_capacity: usize,
    entry_size: usize,
    default_stack_size: usize,
    pop_spin_limit: usize,
}

impl Builder {
    pub fn new(thread_id: u64) -> Self {
        Self {
            thread_id,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            entry_size: DEFAULT_ENTRY_SIZE,
            default_stack_size: DEFAULT_STACK_SIZE,
            pop_spin_limit: DEFAULT_POP_SPIN_LIMIT,
        }
    }

    /// Mailbox capacity in entries. Zero is legal and makes every push
    /// report `NoVacancy`.
    pub fn queue_capacity(mut self, val: usize) -> Self {
        self.queue_capacity = val;
        self
    }

    /// Fixed width in bytes of one mailbox entry.
    pub fn entry_size(mut self, val: usize) -> Self {
        self.entry_size = val;
        self
    }

    /// Stack size used by `spawn` when no explicit size is given.
    pub fn default_stack_size(mut self, val: usize) -> Self {
        self.default_stack_size = val;
        self
    }

    /// Bounded spin count of the mailbox pop before it gives up with
    /// `NoMoreData`.
    pub fn pop_spin_limit(mut self, val: usize) -> Self {
        self.pop_spin_limit = val;
        self
    }

    /// Creates and installs the scheduler for this OS thread and claims
    /// `thread_id` in the global registry. Fails on double-init, on a taken
    /// thread id, and on invalid configuration.
    pub fn try_init(self) -> Result<Runtime> {
        if context::is_initialized() {
            return Err(anyhow!("a scheduler is already active on this OS thread"));
        }

        let cfg: RuntimeConfig = self.try_into()?;
        let thread_id = cfg.thread_id;

        clock::ensure_daemon();

        let scheduler = Box::new(Scheduler::try_new(cfg)?);

        registry::register(
            thread_id,
            RegistryEntry {
                queue: Arc::clone(&scheduler.queue),
            },
        )?;

        if let Err(err) = context::init(scheduler) {
            registry::deregister(thread_id);
            return Err(err);
        }

        tracing::debug!(thread_id, "scheduler initialized");

        Ok(Runtime {
            thread_id,
            _not_send: PhantomData,
        })
    }
}

impl TryFrom<Builder> for RuntimeConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self> {
        if builder.entry_size == 0 {
            return Err(anyhow!("entry_size must be greater than 0"));
        }

        Ok(RuntimeConfig {
            thread_id: builder.thread_id,
            queue_capacity: builder.queue_capacity,
            entry_size: builder.entry_size,
            default_stack_size: builder.default_stack_size,
            pop_spin_limit: builder.pop_spin_limit,
        })
    }
}

/// Handle to the scheduler installed on this OS thread. Not `Send`: the
/// scheduler lives and dies with the thread that built it.
#[derive(Debug)]
pub struct Runtime {
    thread_id: u64,
    _not_send: PhantomData<*const ()>,
}

impl Runtime {
    /// Rebuilds a handle for the scheduler already installed on this
    /// thread; used by the C-ABI `run`, whose init leaked the original.
    pub(crate) fn from_thread_id(thread_id: u64) -> Self {
        Self {
            thread_id,
            _not_send: PhantomData,
        }
    }

    pub fn thread_id(&self) -> u64 {
        self.thread_id
    }

    pub fn spawn<F>(&self, f: F) -> TaskId
    where
        F: FnOnce() + 'static,
    {
        super::spawn(f)
    }

    pub fn spawn_with_stack<F>(&self, stack_size: usize, f: F) -> TaskId
    where
        F: FnOnce() + 'static,
    {
        super::spawn_with_stack(stack_size, f)
    }

    /// Drives the scheduler until no task, fd wait, timeout or thread-queue
    /// waiter remains, then tears the runtime down: the thread id leaves
    /// the registry, the mailbox closes, the scheduler is destroyed.
    pub fn run(self) {
        unsafe { run_loop() };

        teardown(self.thread_id);
        std::mem::forget(self);
    }
}

impl Drop for Runtime {
    /// A runtime dropped without `run()` still releases its thread id and
    /// scheduler.
    fn drop(&mut self) {
        teardown(self.thread_id);
    }
}

fn teardown(thread_id: u64) {
    registry::deregister(thread_id);

    if let Some(scheduler) = context::teardown() {
        scheduler.queue.close();
        tracing::debug!(thread_id, "scheduler torn down");
    }
}

/// Saves the root context and enters the scheduling loop. The loop resumes
/// the root snapshot when nothing remains, landing in the else branch.
///
/// Nothing in this frame is mutated between the save and the resume; the
/// returns-twice pattern is confined to exactly this function.
#[inline(never)]
unsafe fn run_loop() {
    let s = context::scheduler_ptr();

    unsafe {
        if switch::ctx_save(&raw mut (*s).root_snapshot) == 0 {
            scheduler::schedule();
            unreachable!("the scheduling loop exits by resuming the root snapshot");
        } else {
            (*s).reap_stopped();
        }
    }
}
