//! # Pickaxe
//!
//! A native userspace debugger engine for ELF binaries on x86-64 Linux.
//!
//! Pickaxe drives a tracee process through the ptrace interface and exposes
//! the building blocks an interactive debugger front-end needs:
//!
//! - [`process`]: launching or attaching to a tracee, the stop/resume state
//!   machine, memory and register access, and hardware debug register
//!   management
//! - [`breakpoint`] / [`watchpoint`] / [`syscalls`]: software and hardware
//!   stop-points and syscall catching
//! - [`registers`]: a typed view over the kernel user area
//! - [`elf`] / [`dwarf`]: the loaded image, its symbols, and its DWARF v4
//!   debug information
//! - [`disassemble`]: instruction listings that see through breakpoint
//!   patching
//! - [`target`]: a process bound to its loaded ELF image
//!
//! The engine is single-threaded; no operation other than
//! [`process::Process::wait_on_signal`] blocks on the tracee.

use nix::sys::ptrace;
use nix::unistd::Pid;

use crate::addr::VirtAddr;
use crate::errors::{DebuggerError, Result};

pub mod addr;
pub mod breakpoint;
pub mod consts;
pub mod disassemble;
pub mod dwarf;
pub mod elf;
pub mod errors;
pub mod parse;
pub mod pipe;
pub mod process;
pub mod register_info;
pub mod registers;
pub mod stoppoint;
pub mod syscalls;
pub mod target;
pub mod watchpoint;

/// The machine word ptrace transfers on x86-64.
pub type Word = i64;

/// Width of a [`Word`] in bytes.
pub const WORD_BYTES: usize = 8;

pub(crate) fn wmem(pid: Pid, addr: VirtAddr, value: Word) -> Result<()> {
    ptrace::write(pid, addr.as_ptr(), value).map_err(|errno| DebuggerError::OsCall {
        context: format!("Could not write tracee memory at {addr}"),
        source: errno,
    })
}

pub(crate) fn rmem(pid: Pid, addr: VirtAddr) -> Result<Word> {
    ptrace::read(pid, addr.as_ptr()).map_err(|errno| DebuggerError::OsCall {
        context: format!("Could not read tracee memory at {addr}"),
        source: errno,
    })
}
