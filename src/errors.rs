//! # Error Types
//!
//! Defines error types and a result alias used throughout the [crate].
//!
//! Every fallible operation in the engine returns [`Result`]. The variants of
//! [`DebuggerError`] fall into four families: failed OS calls (carrying the
//! errno text), malformed input files (ELF or DWARF), lookups of entities
//! that do not exist (registers, stop-points, syscalls, DWARF attributes),
//! and violated preconditions (misaligned watchpoints, oversized register
//! writes, operations issued in the wrong tracee state).

use gimli::DwAt;
use nix::errno::Errno;
use thiserror::Error;

/// Type alias for Results returned by pickaxe functions.
pub type Result<T> = std::result::Result<T, DebuggerError>;

/// Comprehensive error type for the pickaxe debugger engine.
#[derive(Error, Debug)]
pub enum DebuggerError {
    #[error("Os error: {0}")]
    Os(#[from] Errno),
    #[error("{context}: {source}")]
    OsCall { context: String, source: Errno },
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Could not convert to CString: {0}")]
    CStringConv(#[from] std::ffi::NulError),
    #[error("Could not launch debuggee: {0}")]
    Launch(String),
    #[error("Malformed ELF image: {0}")]
    InvalidElf(String),
    #[error("Malformed DWARF data: {0}")]
    InvalidDwarf(String),
    #[error("Unsupported DWARF flavour: {0}")]
    UnsupportedDwarf(String),
    #[error("Could not parse integer: {0}")]
    ParseInt(#[from] std::num::ParseIntError),
    #[error("Could not parse float: {0}")]
    ParseFloat(#[from] std::num::ParseFloatError),
    #[error("Could not parse string: {0}")]
    ParseStr(String),
    #[error("No register is named {0}")]
    UnknownRegister(String),
    #[error("No stop-point has id {0}")]
    UnknownStoppoint(i32),
    #[error("No such syscall: {0}")]
    UnknownSyscall(String),
    #[error("No section is named {0}")]
    NoSuchSection(String),
    #[error("DIE does not carry attribute {0}")]
    AttributeDoesNotExist(DwAt),
    #[error("Watchpoint address {address:#x} is not aligned to its size {size}")]
    UnalignedWatchpoint { address: u64, size: usize },
    #[error("Hardware stop-points cover 1, 2, 4 or 8 bytes, not {0}")]
    InvalidStoppointSize(usize),
    #[error("Value of {value_size} bytes does not fit register {register} of {register_size} bytes")]
    RegisterValueTooLarge {
        register: &'static str,
        register_size: usize,
        value_size: usize,
    },
    #[error("Register value is not of the requested type")]
    RegisterValueType,
    #[error("Operation requires a {required} tracee, but it is {actual}")]
    WrongProcessState {
        required: &'static str,
        actual: &'static str,
    },
    #[error("Unexpected wait status for tracee: {0}")]
    UnexpectedWaitStatus(String),
    #[error("All four hardware debug registers are occupied")]
    NoFreeDebugRegister,
    #[error("No hardware stop-point has triggered")]
    NoHardwareStoppointHit,
}

impl DebuggerError {
    /// Attaches a call-site description to a failed OS call.
    pub(crate) fn os_call(context: impl Into<String>, errno: Errno) -> Self {
        DebuggerError::OsCall {
            context: context.into(),
            source: errno,
        }
    }
}
