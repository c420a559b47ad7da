//! Per-thread alternate signal stacks.
//!
//! Signal handlers run on the alternate stack so that a fault caused by
//! exhausting the main stack can still be handled. Rust's libstd installs an
//! alternate stack on each thread it creates, but it's only `SIGSTKSZ` large,
//! which is not always enough for our handlers and whatever the embedder's
//! handler does. If the stack a thread already has is too small we register
//! our own, preceded by a guard page, and unmap it when the thread exits.

use crate::config::Config;
use crate::trap::Trap;
use std::cell::RefCell;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

thread_local! {
    static ALT_STACK: RefCell<AltStack> = const { RefCell::new(AltStack::None) };
}

static LIVE: AtomicUsize = AtomicUsize::new(0);

/// Number of alternate signal stacks currently mapped by this crate across
/// all threads.
pub fn live_alt_stacks() -> usize {
    LIVE.load(Ordering::Relaxed)
}

enum AltStack {
    /// Not checked yet on this thread.
    None,
    /// The stack that was already installed is large enough.
    BigEnough,
    Allocated {
        mmap_ptr: *mut libc::c_void,
        mmap_size: usize,
        stack_ptr: *mut libc::c_void,
        stack_size: usize,
    },
}

/// Makes sure the current thread has an alternate signal stack of at least
/// the size `config` asks for.
///
/// Fails with an out-of-memory trap if the stack can't be mapped.
pub(crate) fn ensure_installed(config: &Config) -> Result<(), Trap> {
    ALT_STACK.with(|slot| {
        let mut slot = slot.borrow_mut();
        if !matches!(*slot, AltStack::None) {
            return Ok(());
        }

        let page_size = rustix::param::page_size();
        let stack_size = config.alt_stack_bytes(page_size).ok_or_else(Trap::oom)?;

        let old = current();
        if old.ss_flags & libc::SS_DISABLE == 0 && old.ss_size >= stack_size {
            *slot = AltStack::BigEnough;
            return Ok(());
        }

        let mmap_size = page_size + stack_size;
        let mmap_ptr = unsafe {
            rustix::mm::mmap_anonymous(
                ptr::null_mut(),
                mmap_size,
                rustix::mm::ProtFlags::empty(),
                rustix::mm::MapFlags::PRIVATE,
            )
        }
        .map_err(|_| Trap::oom())?;

        let stack_ptr = unsafe { mmap_ptr.cast::<u8>().add(page_size).cast::<libc::c_void>() };
        let protected = unsafe {
            rustix::mm::mprotect(
                stack_ptr,
                stack_size,
                rustix::mm::MprotectFlags::READ | rustix::mm::MprotectFlags::WRITE,
            )
        };
        if protected.is_err() {
            unmap(mmap_ptr, mmap_size);
            return Err(Trap::oom());
        }

        let new = libc::stack_t {
            ss_sp: stack_ptr,
            ss_flags: 0,
            ss_size: stack_size,
        };
        let mut replaced: libc::stack_t = unsafe { mem::zeroed() };
        if unsafe { libc::sigaltstack(&new, &mut replaced) } != 0 {
            super::abort("failed to register alternate signal stack");
        }
        // Someone else changed this thread's alternate stack between our
        // query and our install; one of the two will be torn down under the
        // other's feet.
        if replaced.ss_flags & libc::SS_DISABLE == 0 && replaced.ss_sp != old.ss_sp {
            super::abort("alternate signal stack was replaced concurrently");
        }

        LIVE.fetch_add(1, Ordering::Relaxed);
        log::trace!("installed {stack_size:#x} byte alternate signal stack at {stack_ptr:?}");
        *slot = AltStack::Allocated {
            mmap_ptr,
            mmap_size,
            stack_ptr,
            stack_size,
        };
        Ok(())
    })
}

fn current() -> libc::stack_t {
    let mut stack: libc::stack_t = unsafe { mem::zeroed() };
    if unsafe { libc::sigaltstack(ptr::null(), &mut stack) } != 0 {
        super::abort("failed to query alternate signal stack");
    }
    stack
}

fn unmap(ptr: *mut libc::c_void, len: usize) {
    if unsafe { rustix::mm::munmap(ptr, len) }.is_err() {
        super::abort("failed to unmap alternate signal stack");
    }
}

impl Drop for AltStack {
    fn drop(&mut self) {
        let AltStack::Allocated {
            mmap_ptr,
            mmap_size,
            stack_ptr,
            stack_size,
        } = *self
        else {
            return;
        };

        let current = current();
        if current.ss_flags & libc::SS_ONSTACK != 0 {
            super::abort("thread exited while running on its alternate signal stack");
        }
        // libstd may have already disabled the registration on its way out of
        // the thread; only undo it if it's still ours.
        if current.ss_flags & libc::SS_DISABLE == 0 && current.ss_sp == stack_ptr {
            let disabled = libc::stack_t {
                ss_sp: ptr::null_mut(),
                ss_flags: libc::SS_DISABLE,
                ss_size: stack_size,
            };
            if unsafe { libc::sigaltstack(&disabled, ptr::null_mut()) } != 0 {
                super::abort("failed to disable alternate signal stack");
            }
        }
        unmap(mmap_ptr, mmap_size);
        LIVE.fetch_sub(1, Ordering::Relaxed);
        #[cfg(test)]
        tests::record_unmapped(stack_ptr as usize);
    }
}
