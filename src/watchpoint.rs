//! Watchpoints: hardware data breakpoints over one, two, four or eight
//! bytes.
//!
//! A watchpoint keeps a two-slot history of the watched value so a stop can
//! report both the previous and the new contents. Its address must be a
//! multiple of its size, matching what the debug registers can express.

use nix::unistd::Pid;

use crate::addr::VirtAddr;
use crate::errors::{DebuggerError, Result};
use crate::process;
use crate::registers::Registers;
use crate::stoppoint::{Stoppoint, StoppointMode};

/// One hardware data watchpoint.
pub struct Watchpoint {
    id: i32,
    pid: Pid,
    address: VirtAddr,
    mode: StoppointMode,
    size: usize,
    is_enabled: bool,
    hardware_register_index: Option<usize>,
    data: u64,
    previous_data: u64,
}

impl Watchpoint {
    pub(crate) fn new(
        id: i32,
        pid: Pid,
        address: VirtAddr,
        mode: StoppointMode,
        size: usize,
    ) -> Result<Self> {
        if !matches!(size, 1 | 2 | 4 | 8) {
            return Err(DebuggerError::InvalidStoppointSize(size));
        }
        if address.addr() & (size as u64 - 1) != 0 {
            return Err(DebuggerError::UnalignedWatchpoint {
                address: address.addr(),
                size,
            });
        }

        Ok(Watchpoint {
            id,
            pid,
            address,
            mode,
            size,
            is_enabled: false,
            hardware_register_index: None,
            data: 0,
            previous_data: 0,
        })
    }

    pub fn mode(&self) -> StoppointMode {
        self.mode
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// The watched value as of the most recent stop.
    pub fn data(&self) -> u64 {
        self.data
    }

    /// The watched value one stop earlier.
    pub fn previous_data(&self) -> u64 {
        self.previous_data
    }

    pub(crate) fn hardware_register_index(&self) -> Option<usize> {
        self.hardware_register_index
    }

    /// Claims a debug register and arms the trap.
    pub fn enable(&mut self, regs: &mut Registers) -> Result<()> {
        if self.is_enabled {
            return Ok(());
        }

        let index =
            process::set_hardware_stoppoint(self.pid, regs, self.address, self.mode, self.size)?;
        self.hardware_register_index = Some(index);
        self.is_enabled = true;
        Ok(())
    }

    /// Shifts the current value into the history and records the fresh bytes
    /// read from the watched address.
    pub(crate) fn update_data(&mut self, bytes: &[u8]) {
        let mut word = [0u8; 8];
        let len = bytes.len().min(8);
        word[..len].copy_from_slice(&bytes[..len]);
        self.previous_data = self.data;
        self.data = u64::from_le_bytes(word);
    }
}

impl Stoppoint for Watchpoint {
    fn id(&self) -> i32 {
        self.id
    }

    fn address(&self) -> VirtAddr {
        self.address
    }

    fn is_enabled(&self) -> bool {
        self.is_enabled
    }

    fn disable(&mut self, regs: &mut Registers) -> Result<()> {
        if !self.is_enabled {
            return Ok(());
        }

        if let Some(index) = self.hardware_register_index.take() {
            process::clear_hardware_stoppoint(self.pid, regs, index)?;
        }
        self.is_enabled = false;
        Ok(())
    }
}
