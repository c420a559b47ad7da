use std::fmt;

/// Kinds of faults that guest code can raise.
///
/// Hardware faults are classified into these codes either through the trap
/// table registered alongside compiled code (see
/// [`TrapInformation`](crate::TrapInformation)) or, failing that, from the
/// signal or exception that was delivered.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum TrapCode {
    /// The current stack space was exhausted.
    StackOverflow = 0,

    /// An out-of-bounds memory access.
    MemoryOutOfBounds,

    /// A wasm atomic operation was presented with a not-naturally-aligned
    /// linear-memory address.
    HeapMisaligned,

    /// An out-of-bounds access to a table.
    TableOutOfBounds,

    /// Indirect call to a null table entry.
    IndirectCallToNull,

    /// Signature mismatch on indirect call.
    BadSignature,

    /// An integer arithmetic operation caused an overflow.
    IntegerOverflow,

    /// An integer division by zero.
    IntegerDivisionByZero,

    /// Failed float-to-int conversion.
    BadConversionToInteger,

    /// Code that was supposed to have been unreachable was reached.
    UnreachableCodeReached,

    /// Execution has potentially run too long and may be interrupted.
    Interrupt,
}

impl TrapCode {
    /// Every trap code, in discriminant order.
    pub const ALL: [TrapCode; 11] = [
        TrapCode::StackOverflow,
        TrapCode::MemoryOutOfBounds,
        TrapCode::HeapMisaligned,
        TrapCode::TableOutOfBounds,
        TrapCode::IndirectCallToNull,
        TrapCode::BadSignature,
        TrapCode::IntegerOverflow,
        TrapCode::IntegerDivisionByZero,
        TrapCode::BadConversionToInteger,
        TrapCode::UnreachableCodeReached,
        TrapCode::Interrupt,
    ];

    /// Converts a byte back into a `TrapCode` if it's in-bounds.
    pub fn from_u8(byte: u8) -> Option<TrapCode> {
        TrapCode::ALL.get(usize::from(byte)).copied()
    }
}

impl fmt::Display for TrapCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use TrapCode::*;
        let desc = match self {
            StackOverflow => "call stack exhausted",
            MemoryOutOfBounds => "out of bounds memory access",
            HeapMisaligned => "unaligned atomic",
            TableOutOfBounds => "undefined element: out of bounds table access",
            IndirectCallToNull => "uninitialized element",
            BadSignature => "indirect call type mismatch",
            IntegerOverflow => "integer overflow",
            IntegerDivisionByZero => "integer divide by zero",
            BadConversionToInteger => "invalid conversion to integer",
            UnreachableCodeReached => "wasm `unreachable` instruction executed",
            Interrupt => "interrupt",
        };
        write!(f, "wasm trap: {desc}")
    }
}

impl std::error::Error for TrapCode {}

/// Enumeration of different methods of raising a trap.
#[derive(Debug)]
pub enum TrapReason {
    /// A user-raised trap through `raise_user_trap`.
    User(anyhow::Error),

    /// A hardware fault in guest code caught by the signal handler.
    Jit {
        /// The program counter where this trap originated.
        pc: usize,

        /// If the trap was a memory-related trap such as SIGSEGV then this
        /// field will contain the address of the inaccessible data.
        ///
        /// Not every fault reports an address; illegal instructions and
        /// division faults, for example, do not.
        faulting_addr: Option<usize>,

        /// The trap code associated with this trap.
        trap: TrapCode,
    },

    /// A trap raised explicitly by host code through `raise_trap`.
    Wasm(TrapCode),

    /// The runtime was unable to allocate memory needed to run guest code,
    /// such as the alternate signal stack.
    OutOfMemory,
}

impl From<anyhow::Error> for TrapReason {
    fn from(error: anyhow::Error) -> Self {
        TrapReason::User(error)
    }
}

impl From<TrapCode> for TrapReason {
    fn from(code: TrapCode) -> Self {
        TrapReason::Wasm(code)
    }
}

/// A trap that unwound a guarded call back to its caller.
#[derive(Debug)]
pub struct Trap {
    reason: TrapReason,
    func_name: Option<String>,
}

impl Trap {
    pub(crate) fn new(reason: TrapReason) -> Trap {
        Trap {
            reason,
            func_name: None,
        }
    }

    pub(crate) fn oom() -> Trap {
        Trap::new(TrapReason::OutOfMemory)
    }

    pub(crate) fn set_func_name(&mut self, name: Option<String>) {
        self.func_name = name;
    }

    /// Original reason from where this trap originated.
    pub fn reason(&self) -> &TrapReason {
        &self.reason
    }

    /// Consumes this trap, returning its reason.
    pub fn into_reason(self) -> TrapReason {
        self.reason
    }

    /// The trap code of this trap, if it was raised by guest code or with
    /// `raise_trap`.
    pub fn code(&self) -> Option<TrapCode> {
        match self.reason {
            TrapReason::Jit { trap, .. } | TrapReason::Wasm(trap) => Some(trap),
            TrapReason::User(_) | TrapReason::OutOfMemory => None,
        }
    }

    /// The program counter of the faulting instruction for hardware faults.
    pub fn pc(&self) -> Option<usize> {
        match self.reason {
            TrapReason::Jit { pc, .. } => Some(pc),
            _ => None,
        }
    }

    /// The inaccessible address for memory faults, when the platform reports
    /// one.
    pub fn faulting_addr(&self) -> Option<usize> {
        match self.reason {
            TrapReason::Jit { faulting_addr, .. } => faulting_addr,
            _ => None,
        }
    }

    /// Name of the guest function containing `pc`, if its code region
    /// registered names.
    pub fn func_name(&self) -> Option<&str> {
        self.func_name.as_deref()
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.reason {
            TrapReason::User(error) => write!(f, "{error}")?,
            TrapReason::Wasm(code) => write!(f, "{code}")?,
            TrapReason::OutOfMemory => {
                write!(f, "failed to allocate memory required for trap handling")?
            }
            TrapReason::Jit {
                pc,
                faulting_addr,
                trap,
            } => {
                write!(f, "{trap} at pc {pc:#x}")?;
                if let Some(addr) = faulting_addr {
                    write!(f, " accessing {addr:#x}")?;
                }
                match &self.func_name {
                    Some(name) => write!(f, " in `{name}`")?,
                    None => write!(f, " in <unknown>")?,
                }
            }
        }
        Ok(())
    }
}

impl std::error::Error for Trap {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.reason {
            TrapReason::User(error) => Some(&**error),
            _ => None,
        }
    }
}
