//! Task stack allocation with a guard page at the low end.

use crate::utils::sys;
use anyhow::{Result, anyhow};
use std::ptr::NonNull;

/// Number of machine words reserved at the top of a fresh stack for the
/// spawn trampoline: entry function, argument, task pointer, plus one
/// unused word so the trampoline slot stays 16-byte aligned.
const TRAMPOLINE_WORDS: usize = 4;

/// A page-aligned stack region owned by one task. The lowest page is mapped
/// `PROT_NONE` so an overflow faults instead of corrupting neighboring
/// memory. The guard is lifted again before the region is unmapped.
#[derive(Debug)]
pub(crate) struct Stack {
    base: NonNull<u8>,
    size: usize,
}

impl Stack {
    /// Rounds `requested` the way the original sizing rule does: pad by one
    /// page for the guard, truncate to page granularity, floor at two pages.
    pub(crate) fn try_new(requested: usize) -> Result<Self> {
        let page = sys::page_size();

        let mut size = requested + page;
        size -= size % page;
        if size < page * 2 {
            size = page * 2;
        }

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if base == libc::MAP_FAILED {
            return Err(anyhow!(
                "stack mmap of {} bytes failed: {}",
                size,
                std::io::Error::last_os_error()
            ));
        }

        if unsafe { libc::mprotect(base, page, libc::PROT_NONE) } != 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::munmap(base, size) };
            return Err(anyhow!("stack guard page mprotect failed: {}", err));
        }

        Ok(Self {
            // Safety: mmap returned a non-null mapping.
            base: unsafe { NonNull::new_unchecked(base as *mut u8) },
            size,
        })
    }

    /// Writes the trampoline words and returns the stack-pointer value the
    /// first dispatch starts from.
    pub(crate) fn prepare(&mut self, entry: u64, arg: u64, task: u64) -> *mut u64 {
        let top = self.trampoline_top();

        unsafe {
            top.write(entry);
            top.add(1).write(arg);
            top.add(2).write(task);
        }

        top
    }

    pub(crate) fn trampoline_top(&self) -> *mut u64 {
        // Base and size are both page granular, so the slot is 16-byte
        // aligned, which the trampoline relies on.
        unsafe {
            (self.base.as_ptr().add(self.size) as *mut u64).sub(TRAMPOLINE_WORDS)
        }
    }

    #[cfg(test)]
    pub(crate) fn size(&self) -> usize {
        self.size
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let page = sys::page_size();
        let base = self.base.as_ptr() as *mut libc::c_void;

        unsafe {
            // Lift the guard before handing the region back.
            if libc::mprotect(base, page, libc::PROT_READ | libc::PROT_WRITE) != 0 {
                tracing::error!(
                    "failed to unprotect stack guard page: {}",
                    std::io::Error::last_os_error()
                );
            }
            libc::munmap(base, self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_sizing_rules() {
        let page = crate::utils::sys::page_size();

        // Requests below two pages are floored.
        let stack = Stack::try_new(16).unwrap();
        assert_eq!(stack.size(), page * 2);

        // Page-granular request gains exactly the guard page.
        let stack = Stack::try_new(page * 8).unwrap();
        assert_eq!(stack.size(), page * 9);

        // Odd sizes are truncated to page granularity after padding.
        let stack = Stack::try_new(page * 8 + 100).unwrap();
        assert_eq!(stack.size(), page * 9);
    }

    #[test]
    fn test_trampoline_slot_alignment() {
        let mut stack = Stack::try_new(4096 * 8).unwrap();
        let top = stack.prepare(0x1111, 0x2222, 0x3333);

        assert_eq!(top as usize % 16, 0);
        unsafe {
            assert_eq!(top.read(), 0x1111);
            assert_eq!(top.add(1).read(), 0x2222);
            assert_eq!(top.add(2).read(), 0x3333);
        }
    }
}
