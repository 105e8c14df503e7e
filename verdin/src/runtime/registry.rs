//! Global thread-id registry.
//!
//! Maps the user-supplied 64-bit thread id given at init time to the
//! cross-thread-safe part of that thread's scheduler: its mailbox. Other OS
//! threads resolve a peer through here and push into its thread-queue. The
//! sharded map stands in for the original's hardware-transactional lock
//! around a plain hash map.

use crate::mailbox::ThreadQueue;
use anyhow::{Result, anyhow};
use dashmap::DashMap;
use std::sync::{Arc, OnceLock};

#[derive(Debug, Clone)]
pub(crate) struct RegistryEntry {
    pub(crate) queue: Arc<ThreadQueue>,
}

fn registry() -> &'static DashMap<u64, RegistryEntry> {
    static REGISTRY: OnceLock<DashMap<u64, RegistryEntry>> = OnceLock::new();
    REGISTRY.get_or_init(DashMap::new)
}

/// Claims `thread_id`. Fails if some live scheduler already owns it.
pub(crate) fn register(thread_id: u64, entry: RegistryEntry) -> Result<()> {
    use dashmap::mapref::entry::Entry;

    match registry().entry(thread_id) {
        Entry::Occupied(_) => Err(anyhow!(
            "thread id {thread_id} is already registered to another scheduler"
        )),
        Entry::Vacant(slot) => {
            slot.insert(entry);
            tracing::debug!(thread_id, "registered scheduler");
            Ok(())
        }
    }
}

pub(crate) fn deregister(thread_id: u64) {
    if registry().remove(&thread_id).is_some() {
        tracing::debug!(thread_id, "deregistered scheduler");
    }
}

/// The mailbox of the scheduler registered under `thread_id`, shareable
/// across OS threads.
pub fn thread_queue(thread_id: u64) -> Option<Arc<ThreadQueue>> {
    registry().get(&thread_id).map(|entry| Arc::clone(&entry.queue))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> RegistryEntry {
        RegistryEntry {
            queue: Arc::new(ThreadQueue::new(4, 8, 1000)),
        }
    }

    #[test]
    fn test_register_lookup_deregister() {
        const THID: u64 = 900_001;

        register(THID, entry()).unwrap();
        assert!(thread_queue(THID).is_some());

        // Visible from another OS thread.
        let handle = std::thread::spawn(move || thread_queue(THID).is_some());
        assert!(handle.join().unwrap());

        deregister(THID);
        assert!(thread_queue(THID).is_none());
    }

    #[test]
    fn test_duplicate_thread_id_rejected() {
        const THID: u64 = 900_002;

        register(THID, entry()).unwrap();
        assert!(register(THID, entry()).is_err());
        deregister(THID);
    }
}
