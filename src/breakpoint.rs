//! Breakpoint sites: one-byte `int 3` patches or hardware execute traps.
//!
//! A software site stores the original instruction byte while enabled and
//! restores it on disable, so the tracee's code is only ever patched between
//! those two calls. A hardware site occupies one of the four debug address
//! registers instead and leaves memory untouched.

use nix::unistd::Pid;

use crate::addr::VirtAddr;
use crate::errors::Result;
use crate::process;
use crate::registers::Registers;
use crate::stoppoint::{Stoppoint, StoppointMode};
use crate::{rmem, wmem, Word};

/// The x86 `int 3` opcode.
pub const INT3: Word = 0xcc;
/// Low-byte mask of a tracee word.
pub const WORD_MASK: Word = 0xff;
pub const WORD_MASK_INV: Word = Word::MAX ^ WORD_MASK;

/// One patchable stop location in the tracee.
pub struct BreakpointSite {
    id: i32,
    pid: Pid,
    address: VirtAddr,
    is_enabled: bool,
    saved_data: u8,
    is_hardware: bool,
    is_internal: bool,
    hardware_register_index: Option<usize>,
}

impl BreakpointSite {
    pub(crate) fn new(
        id: i32,
        pid: Pid,
        address: VirtAddr,
        is_hardware: bool,
        is_internal: bool,
    ) -> Self {
        BreakpointSite {
            id,
            pid,
            address,
            is_enabled: false,
            saved_data: 0,
            is_hardware,
            is_internal,
            hardware_register_index: None,
        }
    }

    pub fn is_hardware(&self) -> bool {
        self.is_hardware
    }

    /// Internal sites are the engine's own instrumentation and are hidden
    /// from user-facing listings.
    pub fn is_internal(&self) -> bool {
        self.is_internal
    }

    /// The instruction byte the site replaced, while enabled.
    pub fn saved_data(&self) -> u8 {
        self.saved_data
    }

    pub(crate) fn hardware_register_index(&self) -> Option<usize> {
        self.hardware_register_index
    }

    /// Arms the site. Software sites patch `int 3` over the low byte at the
    /// address; hardware sites claim a debug register.
    pub fn enable(&mut self, regs: &mut Registers) -> Result<()> {
        if self.is_enabled {
            return Ok(());
        }

        if self.is_hardware {
            let index = process::set_hardware_stoppoint(
                self.pid,
                regs,
                self.address,
                StoppointMode::Execute,
                1,
            )?;
            self.hardware_register_index = Some(index);
        } else {
            let data = rmem(self.pid, self.address)?;
            self.saved_data = (data & WORD_MASK) as u8;
            wmem(self.pid, self.address, (data & WORD_MASK_INV) | INT3)?;
        }

        self.is_enabled = true;
        Ok(())
    }
}

impl Stoppoint for BreakpointSite {
    fn id(&self) -> i32 {
        self.id
    }

    fn address(&self) -> VirtAddr {
        self.address
    }

    fn is_enabled(&self) -> bool {
        self.is_enabled
    }

    /// Restores the original byte (software) or releases the debug register
    /// (hardware).
    fn disable(&mut self, regs: &mut Registers) -> Result<()> {
        if !self.is_enabled {
            return Ok(());
        }

        if let Some(index) = self.hardware_register_index.take() {
            process::clear_hardware_stoppoint(self.pid, regs, index)?;
        } else {
            let data = rmem(self.pid, self.address)?;
            wmem(
                self.pid,
                self.address,
                (data & WORD_MASK_INV) | Word::from(self.saved_data),
            )?;
        }

        self.is_enabled = false;
        Ok(())
    }
}
