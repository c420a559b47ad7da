//! Trap handling on Unix based on POSIX signals.

use crate::config::Config;
use crate::trap::TrapCode;
use crate::traphandlers::{TrapTest, tls};
use crate::unwind;
use std::io;
use std::mem::{self, MaybeUninit};
use std::ptr;

/// Function which may handle custom signals while processing traps.
pub type SignalHandler<'a> =
    dyn Fn(libc::c_int, *const libc::siginfo_t, *const libc::c_void) -> bool + Send + Sync + 'a;

static mut PREV_SIGSEGV: MaybeUninit<libc::sigaction> = MaybeUninit::uninit();
static mut PREV_SIGBUS: MaybeUninit<libc::sigaction> = MaybeUninit::uninit();
static mut PREV_SIGILL: MaybeUninit<libc::sigaction> = MaybeUninit::uninit();
static mut PREV_SIGFPE: MaybeUninit<libc::sigaction> = MaybeUninit::uninit();

/// Faults this close to the stack pointer are taken to be stack overflows
/// hitting the guard page.
const STACK_FAULT_WINDOW: usize = 64 * 1024;

pub(crate) unsafe fn platform_init(config: &Config) {
    let register = |slot: *mut libc::sigaction, signal: i32| unsafe {
        let mut handler: libc::sigaction = mem::zeroed();
        // The flags here are relatively careful, and they are...
        //
        // SA_SIGINFO gives us access to information like the program
        // counter from where the fault happened.
        //
        // SA_ONSTACK allows us to handle signals on an alternate stack,
        // so that the handler can run in response to running out of
        // stack space on the main stack. Each thread which runs guest code
        // gets a large enough alternate stack before it does so.
        //
        // SA_NODEFER allows us to reenter the signal handler if we
        // crash while handling the signal, and fall through to the
        // previous handler by testing `handling_trap`.
        handler.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER | libc::SA_ONSTACK;
        handler.sa_sigaction = trap_handler as usize;
        libc::sigemptyset(&mut handler.sa_mask);
        if libc::sigaction(signal, &handler, slot) != 0 {
            panic!(
                "unable to install signal handler: {}",
                io::Error::last_os_error(),
            );
        }
    };

    // Allow handling OOB with signals on all architectures
    register((&raw mut PREV_SIGSEGV).cast(), libc::SIGSEGV);

    // Handle `unreachable` instructions which execute `ud2` right now
    register((&raw mut PREV_SIGILL).cast(), libc::SIGILL);

    // x86 uses SIGFPE to report division by zero
    if config.handle_sigfpe {
        register((&raw mut PREV_SIGFPE).cast(), libc::SIGFPE);
    }

    // On ARM, handle Unaligned Accesses.
    // On Darwin, guard page accesses are raised as SIGBUS.
    if cfg!(target_arch = "arm") || cfg!(target_vendor = "apple") {
        register((&raw mut PREV_SIGBUS).cast(), libc::SIGBUS);
    }
}

unsafe extern "C" fn trap_handler(
    signum: libc::c_int,
    siginfo: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    let previous = match signum {
        libc::SIGSEGV => &raw const PREV_SIGSEGV,
        libc::SIGBUS => &raw const PREV_SIGBUS,
        libc::SIGFPE => &raw const PREV_SIGFPE,
        libc::SIGILL => &raw const PREV_SIGILL,
        _ => super::abort("trap handler received an unknown signal"),
    };
    let handled = tls::with(|info| {
        // If no guest code is executing, we don't handle this as a trap.
        let Some(info) = info else {
            return false;
        };

        let regs = unsafe { get_trap_registers(context) };
        let faulting_addr = match signum {
            libc::SIGSEGV | libc::SIGBUS => Some(unsafe { (*siginfo).si_addr() } as usize),
            _ => None,
        };
        let fallback = classify(signum, regs.sp, faulting_addr);
        let test = info.test_if_trap(regs.pc, faulting_addr, fallback, |handler| {
            handler(signum, siginfo, context)
        });

        match test {
            TrapTest::NotWasm => false,
            TrapTest::HandledByEmbedder => true,
            TrapTest::Trap(point) => unsafe { unwind::trigger_unwind(point) },
        }
    });

    if handled {
        return;
    }

    // This signal is not for any guest code we expect, so we need to forward
    // the signal to the next handler. If there is no next handler (SIG_IGN or
    // SIG_DFL), then it's time to crash. To do this, we set the signal back to
    // its original disposition and return. This will cause the faulting op
    // to be re-executed which will crash in the normal way. If there is a
    // next handler, call it. It will either crash synchronously, fix up the
    // instruction so that execution can continue and return, or trigger a
    // crash by returning the signal to its original disposition and
    // returning.
    unsafe {
        let previous = &*previous.cast::<libc::sigaction>();
        if previous.sa_flags & libc::SA_SIGINFO != 0 {
            let handler = mem::transmute::<
                usize,
                extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void),
            >(previous.sa_sigaction);
            handler(signum, siginfo, context)
        } else if previous.sa_sigaction == libc::SIG_DFL || previous.sa_sigaction == libc::SIG_IGN {
            libc::sigaction(signum, previous, ptr::null_mut());
        } else {
            mem::transmute::<usize, extern "C" fn(libc::c_int)>(previous.sa_sigaction)(signum)
        }
    }
}

/// Classifies a fault from the signal alone, for guest code whose trap table
/// has no entry for the faulting instruction.
fn classify(signum: libc::c_int, sp: usize, faulting_addr: Option<usize>) -> Option<TrapCode> {
    match signum {
        libc::SIGILL => Some(TrapCode::UnreachableCodeReached),
        // x86 raises the same fault for `INT_MIN / -1` as for a zero divisor;
        // only a trap table can tell them apart.
        libc::SIGFPE => Some(TrapCode::IntegerDivisionByZero),
        libc::SIGSEGV | libc::SIGBUS => match faulting_addr {
            Some(addr) if addr.abs_diff(sp) < STACK_FAULT_WINDOW => Some(TrapCode::StackOverflow),
            _ => Some(TrapCode::MemoryOutOfBounds),
        },
        _ => None,
    }
}

struct TrapRegisters {
    pc: usize,
    sp: usize,
}

unsafe fn get_trap_registers(cx: *mut libc::c_void) -> TrapRegisters {
    cfg_if::cfg_if! {
        if #[cfg(all(any(target_os = "linux", target_os = "android"), target_arch = "x86_64"))] {
            let cx = unsafe { &*(cx as *const libc::ucontext_t) };
            TrapRegisters {
                pc: cx.uc_mcontext.gregs[libc::REG_RIP as usize] as usize,
                sp: cx.uc_mcontext.gregs[libc::REG_RSP as usize] as usize,
            }
        } else if #[cfg(all(any(target_os = "linux", target_os = "android"), target_arch = "x86"))] {
            let cx = unsafe { &*(cx as *const libc::ucontext_t) };
            TrapRegisters {
                pc: cx.uc_mcontext.gregs[libc::REG_EIP as usize] as usize,
                sp: cx.uc_mcontext.gregs[libc::REG_ESP as usize] as usize,
            }
        } else if #[cfg(all(any(target_os = "linux", target_os = "android"), target_arch = "aarch64"))] {
            let cx = unsafe { &*(cx as *const libc::ucontext_t) };
            TrapRegisters {
                pc: cx.uc_mcontext.pc as usize,
                sp: cx.uc_mcontext.sp as usize,
            }
        } else if #[cfg(all(target_vendor = "apple", target_arch = "x86_64"))] {
            let cx = unsafe { &*(cx as *const libc::ucontext_t) };
            let ss = unsafe { &(*cx.uc_mcontext).__ss };
            TrapRegisters {
                pc: ss.__rip as usize,
                sp: ss.__rsp as usize,
            }
        } else if #[cfg(all(target_vendor = "apple", target_arch = "aarch64"))] {
            let cx = unsafe { &*(cx as *const libc::ucontext_t) };
            let ss = unsafe { &(*cx.uc_mcontext).__ss };
            TrapRegisters {
                pc: ss.__pc as usize,
                sp: ss.__sp as usize,
            }
        } else if #[cfg(all(target_os = "freebsd", target_arch = "x86_64"))] {
            let cx = unsafe { &*(cx as *const libc::ucontext_t) };
            TrapRegisters {
                pc: cx.uc_mcontext.mc_rip as usize,
                sp: cx.uc_mcontext.mc_rsp as usize,
            }
        } else if #[cfg(all(target_os = "freebsd", target_arch = "aarch64"))] {
            let cx = unsafe { &*(cx as *const libc::ucontext_t) };
            TrapRegisters {
                pc: cx.uc_mcontext.mc_gpregs.gp_elr as usize,
                sp: cx.uc_mcontext.mc_gpregs.gp_sp as usize,
            }
        } else {
            compile_error!("reading the faulting pc is not supported on this platform");
        }
    }
}
