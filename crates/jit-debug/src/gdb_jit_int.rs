//! The GDB's JIT compilation interface. The low level module that exposes
//! the `__jit_debug_register_code()` and `__jit_debug_descriptor` to register
//! generated object images with debuggers.
//!
//! The list of images is append-only: images are linked in at the head of the
//! list and are never removed for the lifetime of the process. A debugger may
//! stop the process at any instant, so every entry is fully written before it
//! becomes reachable from `first_entry`.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};

#[repr(C)]
struct JITCodeEntry {
    next_entry: *mut JITCodeEntry,
    prev_entry: *mut JITCodeEntry,
    symfile_addr: *const u8,
    symfile_size: u64,
}

const JIT_NOACTION: u32 = 0;
const JIT_REGISTER_FN: u32 = 1;

#[repr(C)]
struct JITDescriptor {
    version: u32,
    action_flag: u32,
    relevant_entry: *mut JITCodeEntry,
    first_entry: *mut JITCodeEntry,
}

/// Wrapper giving the descriptor interior mutability without changing its
/// layout, since debuggers read it by symbol name.
#[repr(transparent)]
struct DescriptorCell(UnsafeCell<JITDescriptor>);

// Writers are serialized by `WRITER` and every field that is mutated after
// publication is accessed atomically.
unsafe impl Sync for DescriptorCell {}

#[cfg(not(feature = "no-export-symbols"))]
#[unsafe(no_mangle)]
#[used]
static __jit_debug_descriptor: DescriptorCell = DescriptorCell(UnsafeCell::new(JITDescriptor {
    version: 1,
    action_flag: JIT_NOACTION,
    relevant_entry: ptr::null_mut(),
    first_entry: ptr::null_mut(),
}));

#[cfg(not(feature = "no-export-symbols"))]
#[unsafe(no_mangle)]
#[inline(never)]
extern "C" fn __jit_debug_register_code() {
    call_notifier();

    // Hack to not allow inlining even when Rust wants to do it in release mode.
    let x = 3;
    unsafe {
        std::ptr::read_volatile(&x);
    }
}

#[cfg(feature = "no-export-symbols")]
unsafe extern "C" {
    static __jit_debug_descriptor: DescriptorCell;
    fn __jit_debug_register_code();
}

fn descriptor() -> *mut JITDescriptor {
    #[cfg(not(feature = "no-export-symbols"))]
    return __jit_debug_descriptor.0.get();
    #[cfg(feature = "no-export-symbols")]
    return unsafe { __jit_debug_descriptor.0.get() };
}

fn notify_debugger() {
    #[cfg(not(feature = "no-export-symbols"))]
    __jit_debug_register_code();
    #[cfg(feature = "no-export-symbols")]
    unsafe {
        __jit_debug_register_code();
        call_notifier();
    }
}

/// Address of the embedder's notification callback, zero when unset.
static NOTIFIER: AtomicUsize = AtomicUsize::new(0);

/// Installs a callback which is invoked from `__jit_debug_register_code` each
/// time a new image is registered.
///
/// The callback runs while the descriptor's action flag is set to "register"
/// and `relevant_entry` points at the new image, which is the same view a
/// debugger breakpoint on `__jit_debug_register_code` gets. By default no
/// callback is installed.
pub fn set_notifier(notifier: fn()) {
    NOTIFIER.store(notifier as usize, Ordering::Release);
}

fn call_notifier() {
    let notifier = NOTIFIER.load(Ordering::Acquire);
    if notifier != 0 {
        let notifier = unsafe { std::mem::transmute::<usize, fn()>(notifier) };
        notifier();
    }
}

/// Serializes all writers of `__jit_debug_descriptor`.
static WRITER: Mutex<()> = Mutex::new(());

/// Registeration for JIT image
pub struct GdbJitImageRegistration {
    entry: *mut JITCodeEntry,
    file: &'static [u8],
}

// The entry is never freed nor mutated through this handle.
unsafe impl Send for GdbJitImageRegistration {}
unsafe impl Sync for GdbJitImageRegistration {}

impl GdbJitImageRegistration {
    /// Registers JIT image using __jit_debug_register_code
    ///
    /// The image is kept alive until the process exits.
    pub fn register(file: Vec<u8>) -> Self {
        let file: &'static [u8] = Box::leak(file.into_boxed_slice());
        let entry = unsafe { register_gdb_jit_image(file) };
        log::trace!(
            "registered {} byte JIT image at {:#x}",
            file.len(),
            file.as_ptr() as usize
        );
        Self { entry, file }
    }

    /// JIT image used in registration
    pub fn file(&self) -> &'static [u8] {
        self.file
    }

    /// Returns whether the image is currently reachable from the descriptor.
    pub fn is_linked(&self) -> bool {
        let mut entries = entries();
        while let Some(e) = entries.next_entry() {
            if ptr::eq(e, self.entry) {
                return true;
            }
        }
        false
    }
}

unsafe fn register_gdb_jit_image(file: &'static [u8]) -> *mut JITCodeEntry {
    let _writer = WRITER.lock().unwrap_or_else(|e| e.into_inner());
    let desc = descriptor();
    unsafe {
        let first_entry = AtomicPtr::from_ptr(&raw mut (*desc).first_entry);
        let relevant_entry = AtomicPtr::from_ptr(&raw mut (*desc).relevant_entry);
        let action_flag = AtomicU32::from_ptr(&raw mut (*desc).action_flag);

        // Create a code entry for the file, which gives the start and size of
        // the symbol file. All of its fields are written here, before anything
        // can reach it.
        let head = first_entry.load(Ordering::Relaxed);
        let entry = Box::into_raw(Box::new(JITCodeEntry {
            next_entry: head,
            prev_entry: ptr::null_mut(),
            symfile_addr: file.as_ptr(),
            symfile_size: file.len() as u64,
        }));

        // Add it to the linked list in the JIT descriptor.
        if !head.is_null() {
            AtomicPtr::from_ptr(&raw mut (*head).prev_entry).store(entry, Ordering::Release);
        }
        first_entry.store(entry, Ordering::Release);

        // Point the relevant_entry field of the descriptor at the entry, set
        // action_flag to JIT_REGISTER and call __jit_debug_register_code.
        relevant_entry.store(entry, Ordering::Release);
        action_flag.store(JIT_REGISTER_FN, Ordering::Release);
        notify_debugger();

        action_flag.store(JIT_NOACTION, Ordering::Release);
        relevant_entry.store(ptr::null_mut(), Ordering::Release);
        entry
    }
}

/// Iterator over a snapshot of the registered images, newest first.
pub struct Entries {
    next: *const JITCodeEntry,
}

impl Entries {
    fn next_entry(&mut self) -> Option<*const JITCodeEntry> {
        if self.next.is_null() {
            return None;
        }
        let cur = self.next;
        // `next_entry` is immutable once an entry has been published.
        self.next = unsafe { (*cur).next_entry };
        Some(cur)
    }
}

impl Iterator for Entries {
    type Item = &'static [u8];

    fn next(&mut self) -> Option<&'static [u8]> {
        let entry = self.next_entry()?;
        unsafe {
            Some(std::slice::from_raw_parts(
                (*entry).symfile_addr,
                (*entry).symfile_size as usize,
            ))
        }
    }
}

/// Walks the list a debugger would see, starting from `first_entry`.
pub fn entries() -> Entries {
    let desc = descriptor();
    let next =
        unsafe { AtomicPtr::from_ptr(&raw mut (*desc).first_entry).load(Ordering::Acquire) };
    Entries {
        next: next.cast_const(),
    }
}

#[cfg(all(test, not(feature = "no-export-symbols")))]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    static SEEN_ACTION: AtomicU32 = AtomicU32::new(JIT_NOACTION);
    static SEEN_RELEVANT: AtomicUsize = AtomicUsize::new(0);

    fn record_descriptor() {
        let desc = descriptor();
        unsafe {
            let action = AtomicU32::from_ptr(&raw mut (*desc).action_flag).load(Ordering::Acquire);
            let relevant =
                AtomicPtr::from_ptr(&raw mut (*desc).relevant_entry).load(Ordering::Acquire);
            SEEN_ACTION.store(action, Ordering::SeqCst);
            SEEN_RELEVANT.store((*relevant).symfile_addr as usize, Ordering::SeqCst);
        }
    }

    /// Images whose bytes all equal their length modulo 256, so a torn read
    /// of an entry is detectable.
    fn image(len: usize) -> Vec<u8> {
        vec![len as u8; len]
    }

    fn is_consistent(file: &[u8]) -> bool {
        file.iter().all(|b| *b == file.len() as u8)
    }

    #[test]
    fn register_links_and_notifies() {
        let _ = env_logger::try_init();
        set_notifier(record_descriptor);

        let reg = GdbJitImageRegistration::register(image(17));
        assert!(reg.is_linked());
        assert_eq!(reg.file().len(), 17);
        assert!(entries().any(|f| f.as_ptr() == reg.file().as_ptr()));

        // Whatever registration ran last, the notifier observed the register
        // action with the relevant entry filled in.
        assert_eq!(SEEN_ACTION.load(Ordering::SeqCst), JIT_REGISTER_FN);
        assert_ne!(SEEN_RELEVANT.load(Ordering::SeqCst), 0);

        let desc = descriptor();
        unsafe {
            assert_eq!((*desc).version, 1);
        }
    }

    #[test]
    fn concurrent_readers_see_consistent_list() {
        let _ = env_logger::try_init();
        let done = AtomicBool::new(false);

        thread::scope(|s| {
            let readers = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        let mut longest = 0;
                        while !done.load(Ordering::Acquire) {
                            let mut count = 0;
                            for file in entries() {
                                assert!(is_consistent(file), "observed a torn entry");
                                count += 1;
                            }
                            longest = longest.max(count);
                        }
                        longest
                    })
                })
                .collect::<Vec<_>>();

            for i in 1..=200 {
                let reg = GdbJitImageRegistration::register(image(i));
                assert!(reg.is_linked());
            }
            done.store(true, Ordering::Release);

            for reader in readers {
                reader.join().unwrap();
            }
        });

        assert!(entries().count() >= 200);
    }
}
