//! Catching traps raised while guest code runs.
//!
//! Every guarded call pushes a [`CallThreadState`] onto a per-thread stack
//! (see [`tls`]) and enters guest code through the `setjmp` trampoline. A
//! fault attributed to guest code records why it happened in the innermost
//! state and `longjmp`s back to that state's recovery point, where the reason
//! is turned into a [`Trap`].

pub(crate) mod tls;

use crate::config::Config;
use crate::registry::{CodeLookup, CodeRegistry};
use crate::sys;
use crate::trap::{Trap, TrapCode, TrapReason};
use crate::unwind::{self, RecoveryPoint};
use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::{Once, OnceLock};

pub use crate::sys::SignalHandler;
pub use crate::unwind::GuestEntry;

static INIT: Once = Once::new();
static CONFIG: OnceLock<Config> = OnceLock::new();
static DEFAULT_CONFIG: Config = Config::new();

/// Installs the process-wide trap handlers.
///
/// This must be called before any guest code runs. Handlers installed after
/// this call take precedence over ours, so it should happen after any crash
/// reporters the process uses have been set up; faults that aren't in guest
/// code are forwarded to whatever handler was installed before.
///
/// Only the first call has any effect, and the configuration it passed is
/// fixed for the lifetime of the process.
pub fn init_traps(config: &Config) -> anyhow::Result<()> {
    config.validate()?;
    init(config);
    if CONFIG.get() != Some(config) {
        log::warn!("trap handlers were already initialized with a different configuration");
    }
    Ok(())
}

/// Installs the trap handlers with the default configuration unless
/// [`init_traps`] already did.
pub fn ensure_eager_signal_handlers() {
    init(&DEFAULT_CONFIG);
}

fn init(config: &Config) {
    INIT.call_once(|| {
        let config = CONFIG.get_or_init(|| config.clone());
        if config.signals_based_traps {
            log::debug!("installing trap handlers");
            unsafe { sys::platform_init(config) }
        } else {
            log::debug!("signals-based traps are disabled");
        }
    });
}

/// The configuration fixed by [`init_traps`], or the default one if trap
/// handling hasn't been initialized yet.
#[cfg(unix)]
pub(crate) fn config() -> &'static Config {
    CONFIG.get().unwrap_or(&DEFAULT_CONFIG)
}

/// Eagerly performs the per-thread setup that guarded calls otherwise do
/// lazily on a thread's first call, such as allocating its alternate signal
/// stack.
pub fn tls_eager_initialize() -> Result<(), Trap> {
    tls::eager_initialize()
}

/// A hardware fault which unwound a guarded call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fault {
    /// Address of the faulting instruction.
    pub pc: usize,
    /// The inaccessible address for memory faults.
    pub faulting_addr: Option<usize>,
    /// How the fault was classified.
    pub trap: TrapCode,
}

/// Returns the most recent fault caught on this thread, if any.
///
/// This stays set after the guarded call that faulted has returned, for
/// post-mortem inspection.
pub fn last_fault() -> Option<Fault> {
    tls::last_fault()
}

/// Result of [`call_guarded`].
#[derive(Debug)]
#[must_use]
pub enum Outcome {
    /// The guest function returned normally.
    Completed,
    /// Execution was abandoned because of a trap.
    Faulted(Trap),
}

impl Outcome {
    /// Returns whether the guest function returned normally.
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed)
    }

    /// Converts this outcome into a `Result`.
    pub fn into_result(self) -> Result<(), Trap> {
        match self {
            Outcome::Completed => Ok(()),
            Outcome::Faulted(trap) => Err(trap),
        }
    }
}

/// Calls the guest function `body` with `callee`, `caller` and `args`,
/// turning any trap it raises into [`Outcome::Faulted`].
///
/// Faults are attributed to guest code through the global
/// [`CodeRegistry`].
///
/// # Safety
///
/// `body` must be safe to call with the given pointers. Native frames between
/// this call and a fault are discarded without running destructors, so
/// `body` must not rely on cleanup in frames that can fault.
pub unsafe fn call_guarded(
    callee: *mut u8,
    caller: *mut u8,
    body: GuestEntry,
    args: *mut u8,
) -> Outcome {
    let result = unsafe { guarded(CodeRegistry::global(), None, body, callee, caller, args) };
    match result {
        Ok(()) => Outcome::Completed,
        Err(trap) => Outcome::Faulted(trap),
    }
}

/// Runs `closure`, returning a [`Trap`] if it or guest code it calls traps.
///
/// `code` decides which faulting program counters belong to guest code.
/// `signal_handler`, if given, is offered every fault on this thread first
/// and may claim it by returning `true`.
///
/// Panics raised by `closure` are caught before they reach the trampoline and
/// resumed once this function has restored the thread's state.
///
/// # Safety
///
/// Native frames between this call and a trap are discarded without running
/// destructors.
pub unsafe fn catch_traps<F>(
    code: &dyn CodeLookup,
    signal_handler: Option<&SignalHandler<'_>>,
    mut closure: F,
) -> Result<(), Trap>
where
    F: FnMut(),
{
    let mut panic = None;
    let mut body = || {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(&mut closure)) {
            panic = Some(payload);
        }
    };
    let payload = ptr::addr_of_mut!(body);
    let result = unsafe {
        guarded(
            code,
            signal_handler,
            entry_for(payload),
            payload.cast(),
            ptr::null_mut(),
            ptr::null_mut(),
        )
    };
    if let Some(payload) = panic {
        panic::resume_unwind(payload);
    }
    result
}

fn entry_for<F: FnMut()>(_: *mut F) -> GuestEntry {
    unsafe extern "C" fn call_closure<F: FnMut()>(
        payload: *mut u8,
        _caller: *mut u8,
        _args: *mut u8,
    ) {
        unsafe { (*payload.cast::<F>())() }
    }
    call_closure::<F>
}

unsafe fn guarded(
    code: &dyn CodeLookup,
    signal_handler: Option<&SignalHandler<'_>>,
    body: GuestEntry,
    callee: *mut u8,
    caller: *mut u8,
    args: *mut u8,
) -> Result<(), Trap> {
    let result = CallThreadState::new(code, signal_handler).with(|cx| {
        let ret = unsafe {
            unwind::setjmp_and_call(cx.jmp_buf.as_ptr(), body, callee, caller, args)
        };
        cx.jmp_buf.set(ptr::null());
        ret
    });
    match result {
        Ok(()) => Ok(()),
        Err(UnwindReason::Trap(reason)) => {
            let mut trap = Trap::new(reason);
            if let Some(pc) = trap.pc() {
                trap.set_func_name(code.lookup_func_name(pc));
            }
            log::trace!("guarded call unwound: {trap}");
            Err(trap)
        }
        Err(UnwindReason::Panic(payload)) => panic::resume_unwind(payload),
        Err(UnwindReason::None) => unreachable!(),
    }
}

/// Raises a trap from host code called by guest code, unwinding to the
/// innermost guarded call on this thread.
///
/// Aborts the process if no guarded call is active.
///
/// # Safety
///
/// Only safe to call when all frames up to the innermost guarded call can be
/// discarded without running destructors.
pub unsafe fn raise_trap(code: TrapCode) -> ! {
    unsafe { unwind_with(UnwindReason::Trap(TrapReason::Wasm(code))) }
}

/// Carries an embedder error out of the innermost guarded call on this
/// thread.
///
/// Aborts the process if no guarded call is active.
///
/// # Safety
///
/// See [`raise_trap`].
pub unsafe fn raise_user_trap(error: anyhow::Error) -> ! {
    unsafe { unwind_with(UnwindReason::Trap(TrapReason::User(error))) }
}

/// Carries a panic caught in host code out of the innermost guarded call on
/// this thread, where it is resumed.
///
/// Aborts the process if no guarded call is active.
///
/// # Safety
///
/// See [`raise_trap`].
pub unsafe fn resume_panic(payload: Box<dyn Any + Send>) -> ! {
    unsafe { unwind_with(UnwindReason::Panic(payload)) }
}

unsafe fn unwind_with(reason: UnwindReason) -> ! {
    tls::with(|state| match state {
        Some(state) => state.unwind_with(reason),
        None => {
            log::error!("attempted to unwind with no guarded call active on this thread");
            std::process::abort()
        }
    })
}

enum UnwindReason {
    None,
    Panic(Box<dyn Any + Send>),
    Trap(TrapReason),
}

/// Per-call state for one guarded call, linked to the guarded call it was
/// nested in.
pub(crate) struct CallThreadState<'a> {
    unwind: Cell<UnwindReason>,
    jmp_buf: Cell<*const u8>,
    handling_trap: Cell<bool>,
    code: &'a dyn CodeLookup,
    signal_handler: Option<&'a SignalHandler<'a>>,
    prev: Cell<tls::Ptr>,
}

/// What the platform handler should do with a fault.
pub(crate) enum TrapTest {
    /// Not a guest fault; forward it to the previous handler.
    NotWasm,
    /// The embedder's signal handler dealt with it; resume execution.
    HandledByEmbedder,
    /// A guest fault; unwind to this recovery point.
    Trap(RecoveryPoint),
}

impl<'a> CallThreadState<'a> {
    fn new(
        code: &'a dyn CodeLookup,
        signal_handler: Option<&'a SignalHandler<'a>>,
    ) -> CallThreadState<'a> {
        CallThreadState {
            unwind: Cell::new(UnwindReason::None),
            jmp_buf: Cell::new(ptr::null()),
            handling_trap: Cell::new(false),
            code,
            signal_handler,
            prev: Cell::new(ptr::null()),
        }
    }

    fn with(self, closure: impl FnOnce(&CallThreadState<'a>) -> bool) -> Result<(), UnwindReason> {
        let ret = match tls::set(&self, || closure(&self)) {
            Ok(ret) => ret,
            Err(trap) => return Err(UnwindReason::Trap(trap.into_reason())),
        };
        match self.unwind.replace(UnwindReason::None) {
            UnwindReason::None => {
                debug_assert!(ret);
                Ok(())
            }
            reason => {
                debug_assert!(!ret);
                Err(reason)
            }
        }
    }

    fn unwind_with(&self, reason: UnwindReason) -> ! {
        let Some(point) = RecoveryPoint::from_raw(self.jmp_buf.get()) else {
            log::error!("attempted to unwind outside of guest code");
            std::process::abort()
        };
        self.unwind.set(reason);
        unsafe { unwind::trigger_unwind(point) }
    }

    /// Decides whether a fault at `pc` is a guest trap.
    ///
    /// `fallback` is the platform's classification of the fault, used when the
    /// code lookup has no trap table entry for `pc`. `call_handler` invokes
    /// the embedder's signal handler with the platform's fault information.
    ///
    /// Runs in signal context.
    pub(crate) fn test_if_trap(
        &self,
        pc: usize,
        faulting_addr: Option<usize>,
        fallback: Option<TrapCode>,
        call_handler: impl Fn(&SignalHandler<'_>) -> bool,
    ) -> TrapTest {
        // A fault while handling a fault goes straight to the previous
        // handler.
        if self.handling_trap.replace(true) {
            return TrapTest::NotWasm;
        }
        let _reset = ResetCell(&self.handling_trap, false);

        // Published but not yet inside the trampoline, or already out of it.
        if self.jmp_buf.get().is_null() {
            return TrapTest::NotWasm;
        }

        if let Some(handler) = self.signal_handler {
            if call_handler(handler) {
                return TrapTest::HandledByEmbedder;
            }
        }

        if !self.code.is_guest_code(pc) {
            return TrapTest::NotWasm;
        }
        let Some(trap) = self.code.lookup_trap_code(pc).or(fallback) else {
            return TrapTest::NotWasm;
        };

        self.unwind.set(UnwindReason::Trap(TrapReason::Jit {
            pc,
            faulting_addr,
            trap,
        }));
        let fault = Fault {
            pc,
            faulting_addr,
            trap,
        };
        match tls::record_fault(fault) {
            Some(point) => TrapTest::Trap(point),
            None => TrapTest::NotWasm,
        }
    }
}

struct ResetCell<'a, T: Copy>(&'a Cell<T>, T);

impl<T: Copy> Drop for ResetCell<'_, T> {
    fn drop(&mut self) {
        self.0.set(self.1);
    }
}
