use anyhow::Result;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use wasmtime_traps::*;

fn init() {
    let _ = env_logger::try_init();
    init_traps(&Config::new()).unwrap();
}

#[test]
fn explicit_trap_from_host() {
    init();
    let trap = unsafe {
        catch_traps(CodeRegistry::global(), None, || {
            raise_trap(TrapCode::TableOutOfBounds)
        })
    }
    .unwrap_err();
    assert_eq!(trap.code(), Some(TrapCode::TableOutOfBounds));
    assert_eq!(
        trap.to_string(),
        "wasm trap: undefined element: out of bounds table access"
    );
    assert_eq!(trap.pc(), None);
}

#[test]
fn user_error_round_trips_through_anyhow() {
    init();
    let trap = unsafe {
        catch_traps(CodeRegistry::global(), None, || {
            raise_user_trap(anyhow::anyhow!("test 123"))
        })
    }
    .unwrap_err();
    let err = anyhow::Error::from(trap);
    assert_eq!(err.to_string(), "test 123");
    let trap = err.downcast_ref::<Trap>().unwrap();
    assert!(matches!(trap.reason(), TrapReason::User(_)));
    assert_eq!(trap.code(), None);
}

#[test]
fn host_panic_is_resumed() {
    init();
    let result = panic::catch_unwind(AssertUnwindSafe(|| unsafe {
        let _ = catch_traps(CodeRegistry::global(), None, || panic!("this is a panic"));
    }));
    let payload = result.unwrap_err();
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"this is a panic"));

    // The thread is left ready for the next guarded call.
    let mut ran = false;
    unsafe { catch_traps(CodeRegistry::global(), None, || ran = true) }.unwrap();
    assert!(ran);
}

#[test]
fn nested_guarded_calls_unwind_innermost() {
    init();
    let mut inner = None;
    let outer = unsafe {
        catch_traps(CodeRegistry::global(), None, || {
            inner = Some(catch_traps(CodeRegistry::global(), None, || {
                raise_trap(TrapCode::BadSignature)
            }));
            // Still inside the outer call, which can trap on its own.
            raise_trap(TrapCode::IndirectCallToNull)
        })
    };
    let inner = inner.unwrap().unwrap_err();
    assert_eq!(inner.code(), Some(TrapCode::BadSignature));
    assert_eq!(outer.unwrap_err().code(), Some(TrapCode::IndirectCallToNull));
}

#[test]
fn threads_trap_independently() -> Result<()> {
    init();
    let threads = (0..4)
        .map(|i| {
            thread::spawn(move || {
                tls_eager_initialize()?;
                let code = TrapCode::ALL[i];
                let trap = unsafe {
                    catch_traps(CodeRegistry::global(), None, || raise_trap(code))
                }
                .unwrap_err();
                assert_eq!(trap.code(), Some(code));
                Ok::<_, Trap>(())
            })
        })
        .collect::<Vec<_>>();
    for t in threads {
        t.join().unwrap()?;
    }
    Ok(())
}

#[test]
fn completes_without_trapping() {
    init();
    let mut calls = 0;
    for _ in 0..10 {
        unsafe { catch_traps(CodeRegistry::global(), None, || calls += 1) }.unwrap();
    }
    assert_eq!(calls, 10);
}

#[cfg(all(unix, target_arch = "x86_64"))]
mod x86_64 {
    use super::init;
    use anyhow::Result;
    use rustix::mm::{MapFlags, MprotectFlags, ProtFlags};
    use std::mem;
    use std::ptr;
    use std::thread;
    use wasmtime_traps::*;

    /// `mov al, [rdi]; ret`
    const LOAD: &[u8] = &[0x8a, 0x07, 0xc3];
    /// `ud2`
    const UD2: &[u8] = &[0x0f, 0x0b];
    /// `mov eax, edi; cdq; idiv esi; ret`
    const DIVIDE: &[u8] = &[0x89, 0xf8, 0x99, 0xf7, 0xfe, 0xc3];
    const IDIV_OFFSET: u32 = 3;
    /// `call .` recursing until the stack runs out.
    const RECURSE: &[u8] = &[0xe8, 0xfb, 0xff, 0xff, 0xff];

    const MEMORY_SIZE: usize = 0x10000;
    const RESERVATION_SIZE: usize = 3 * MEMORY_SIZE;

    /// Machine code copied into its own executable page and registered as
    /// guest code for as long as it's alive. The page itself is leaked.
    struct Stub {
        code: *mut u8,
        _registration: CodeRegistration<'static>,
    }

    // The code page is immutable once published.
    unsafe impl Send for Stub {}

    impl Stub {
        fn new(code: &[u8]) -> Result<Stub> {
            Stub::with_region(code, |region| region)
        }

        fn with_region(code: &[u8], f: impl FnOnce(CodeRegion) -> CodeRegion) -> Result<Stub> {
            let ptr = executable_copy(code)?;
            let registration =
                CodeRegistry::global().register(f(CodeRegion::new(ptr, code.len())))?;
            Ok(Stub {
                code: ptr,
                _registration: registration,
            })
        }

        fn addr(&self) -> usize {
            self.code as usize
        }

        fn entry(&self) -> GuestEntry {
            unsafe { mem::transmute::<*mut u8, GuestEntry>(self.code) }
        }

        fn call(&self, callee: usize, caller: usize) -> Outcome {
            unsafe {
                call_guarded(
                    callee as *mut u8,
                    caller as *mut u8,
                    self.entry(),
                    ptr::null_mut(),
                )
            }
        }
    }

    fn executable_copy(code: &[u8]) -> Result<*mut u8> {
        let page_size = rustix::param::page_size();
        unsafe {
            let ptr = rustix::mm::mmap_anonymous(
                ptr::null_mut(),
                page_size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE,
            )?;
            ptr::copy_nonoverlapping(code.as_ptr(), ptr.cast::<u8>(), code.len());
            rustix::mm::mprotect(ptr, page_size, MprotectFlags::READ | MprotectFlags::EXEC)?;
            Ok(ptr.cast())
        }
    }

    /// A linear memory of `MEMORY_SIZE` accessible bytes followed by an
    /// inaccessible reservation. Leaked.
    fn linear_memory() -> Result<usize> {
        unsafe {
            let base = rustix::mm::mmap_anonymous(
                ptr::null_mut(),
                RESERVATION_SIZE,
                ProtFlags::empty(),
                MapFlags::PRIVATE,
            )?;
            rustix::mm::mprotect(
                base,
                MEMORY_SIZE,
                MprotectFlags::READ | MprotectFlags::WRITE,
            )?;
            Ok(base as usize)
        }
    }

    #[test]
    fn out_of_bounds_load() -> Result<()> {
        init();
        let stub = Stub::new(LOAD)?;
        let memory = linear_memory()?;

        assert!(stub.call(memory + 0x100, 0).is_completed());

        let addr = memory + 0x20000;
        let trap = stub.call(addr, 0).into_result().unwrap_err();
        assert_eq!(trap.code(), Some(TrapCode::MemoryOutOfBounds));
        assert_eq!(trap.pc(), Some(stub.addr()));
        assert_eq!(trap.faulting_addr(), Some(addr));
        assert!(
            trap.to_string()
                .starts_with("wasm trap: out of bounds memory access"),
            "{trap}"
        );
        assert_eq!(
            last_fault(),
            Some(Fault {
                pc: stub.addr(),
                faulting_addr: Some(addr),
                trap: TrapCode::MemoryOutOfBounds,
            })
        );
        Ok(())
    }

    #[test]
    fn nested_faults_unwind_innermost() -> Result<()> {
        init();
        let stub = Stub::new(UD2)?;
        let mut inner = None;
        let outer = unsafe {
            catch_traps(CodeRegistry::global(), None, || {
                inner = Some(stub.call(0, 0));
                // Fault again directly in the outer call.
                (stub.entry())(ptr::null_mut(), ptr::null_mut(), ptr::null_mut());
            })
        };
        let inner = inner.expect("inner call ran").into_result().unwrap_err();
        assert_eq!(inner.code(), Some(TrapCode::UnreachableCodeReached));
        let outer = outer.unwrap_err();
        assert_eq!(outer.code(), Some(TrapCode::UnreachableCodeReached));
        assert_eq!(outer.pc(), Some(stub.addr()));
        Ok(())
    }

    #[test]
    fn unreachable_instruction() -> Result<()> {
        init();
        let stub = Stub::new(UD2)?;
        let trap = stub.call(0, 0).into_result().unwrap_err();
        assert_eq!(trap.code(), Some(TrapCode::UnreachableCodeReached));
        assert_eq!(trap.pc(), Some(stub.addr()));
        assert_eq!(trap.faulting_addr(), None);
        Ok(())
    }

    #[test]
    fn division_by_zero() -> Result<()> {
        init();
        let stub = Stub::new(DIVIDE)?;
        assert!(stub.call(7, 2).is_completed());
        let trap = stub.call(7, 0).into_result().unwrap_err();
        assert_eq!(trap.code(), Some(TrapCode::IntegerDivisionByZero));
        assert_eq!(trap.pc(), Some(stub.addr() + IDIV_OFFSET as usize));
        Ok(())
    }

    #[test]
    fn trap_table_takes_priority() -> Result<()> {
        init();
        let stub = Stub::with_region(DIVIDE, |region| {
            region
                .with_traps(vec![TrapInformation {
                    code_offset: IDIV_OFFSET,
                    trap_code: TrapCode::IntegerOverflow,
                }])
                .with_functions(vec![FunctionInfo {
                    start: 0,
                    len: DIVIDE.len() as u32,
                    name: Some("divide".to_string()),
                }])
        })?;
        let min = i32::MIN as u32 as usize;
        let minus_one = -1i32 as u32 as usize;
        let trap = stub.call(min, minus_one).into_result().unwrap_err();
        assert_eq!(trap.code(), Some(TrapCode::IntegerOverflow));
        assert_eq!(trap.func_name(), Some("divide"));
        assert!(trap.to_string().ends_with("in `divide`"), "{trap}");
        Ok(())
    }

    #[test]
    fn repeated_faults_on_one_thread() -> Result<()> {
        init();
        let stub = Stub::new(UD2)?;
        for _ in 0..100 {
            let trap = stub.call(0, 0).into_result().unwrap_err();
            assert_eq!(trap.code(), Some(TrapCode::UnreachableCodeReached));
        }
        Ok(())
    }

    #[test]
    fn stack_overflow_is_handled_on_alt_stack() -> Result<()> {
        init();
        let stub = Stub::new(RECURSE)?;
        let addr = stub.addr();
        let trap = thread::Builder::new()
            .stack_size(256 * 1024)
            .spawn(move || stub.call(0, 0).into_result().unwrap_err())?
            .join()
            .unwrap();
        assert_eq!(trap.code(), Some(TrapCode::StackOverflow));
        assert_eq!(trap.pc(), Some(addr));
        Ok(())
    }

    #[test]
    fn custom_code_lookup() -> Result<()> {
        struct OneFunction {
            start: usize,
        }

        impl CodeLookup for OneFunction {
            fn is_guest_code(&self, pc: usize) -> bool {
                pc == self.start
            }

            fn lookup_trap_code(&self, _pc: usize) -> Option<TrapCode> {
                Some(TrapCode::HeapMisaligned)
            }

            fn lookup_func_name(&self, _pc: usize) -> Option<String> {
                Some("atomic_load".to_string())
            }
        }

        init();
        // Not registered globally: only the lookup passed in knows about it.
        let code = executable_copy(LOAD)?;
        let entry = unsafe { mem::transmute::<*mut u8, GuestEntry>(code) };
        let lookup = OneFunction {
            start: code as usize,
        };
        let trap = unsafe {
            catch_traps(&lookup, None, || {
                entry(0x10 as *mut u8, ptr::null_mut(), ptr::null_mut())
            })
        }
        .unwrap_err();
        assert_eq!(trap.code(), Some(TrapCode::HeapMisaligned));
        assert_eq!(trap.func_name(), Some("atomic_load"));
        assert_eq!(trap.faulting_addr(), Some(0x10));
        Ok(())
    }

    #[test]
    fn embedder_handler_resumes_execution() -> Result<()> {
        init();
        let stub = Stub::new(LOAD)?;
        let memory = linear_memory()?;
        let page_size = rustix::param::page_size();

        // Makes the faulting page readable, which lets the load be retried.
        let handler = move |signum: libc::c_int,
                            siginfo: *const libc::siginfo_t,
                            _context: *const libc::c_void| {
            if signum != libc::SIGSEGV && signum != libc::SIGBUS {
                return false;
            }
            let addr = unsafe { (*siginfo).si_addr() } as usize;
            let page = addr & !(page_size - 1);
            unsafe {
                rustix::mm::mprotect(page as *mut _, page_size, MprotectFlags::READ).is_ok()
            }
        };

        let addr = memory + 0x18000;
        let entry = stub.entry();
        unsafe {
            catch_traps(CodeRegistry::global(), Some(&handler), || {
                entry(addr as *mut u8, ptr::null_mut(), ptr::null_mut())
            })
        }?;
        // The page stays readable after the call.
        assert_eq!(unsafe { ptr::read_volatile(addr as *const u8) }, 0);
        Ok(())
    }
}
