//! Kernel constants the engine needs for stop decoding but which the Rust
//! libc bindings do not export: the `SIGTRAP` `si_code` values from
//! `include/uapi/asm-generic/siginfo.h`, and the layout of the x86 debug
//! status register.

#![allow(unused)]

/// `si_code` when the kernel itself raised the signal (`SI_KERNEL`).
pub const SI_KERNEL: i32 = 0x80;

// SIGTRAP si_code values

/// Trap came from a breakpoint instruction.
pub const TRAP_BRKPT: i32 = 0x1;
/// Trap came from single-stepping.
pub const TRAP_TRACE: i32 = 0x2;
/// Trap came from a taken-branch trap.
pub const TRAP_BRANCH: i32 = 0x3;
/// Trap came from a hardware breakpoint or watchpoint.
pub const TRAP_HWBKPT: i32 = 0x4;
/// Trap the kernel could not attribute further.
pub const TRAP_UNK: i32 = 0x5;

// debug status register (DR6)

/// The low four DR6 bits flag which debug register slot triggered.
pub const DR6_TRAP_MASK: u64 = 0b1111;
/// DR6 bit 14 is set when the stop came from single-stepping.
pub const DR6_SINGLE_STEP: u64 = 1 << 14;
