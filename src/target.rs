//! A target: one process bound to its loaded ELF image.
//!
//! The target computes the image's load bias from the auxiliary vector
//! (`AT_ENTRY` minus the header's entry point) and hands out the image's
//! DWARF data, parsed on first use.

use std::cell::OnceCell;
use std::os::fd::RawFd;
use std::path::Path;
use std::rc::Rc;

use tracing::debug;

use crate::addr::VirtAddr;
use crate::dwarf::Dwarf;
use crate::elf::Elf;
use crate::errors::{DebuggerError, Result};
use crate::process::Process;

/// A debug session over one process and its main executable image.
pub struct Target {
    process: Process,
    elf: Rc<Elf>,
    dwarf: OnceCell<Dwarf>,
}

impl Target {
    /// Launches `path` under tracing and binds its image.
    pub fn launch(path: impl AsRef<Path>, stdout_replacement: Option<RawFd>) -> Result<Self> {
        let path = path.as_ref();
        let process = Process::launch(path, true, stdout_replacement)?;
        Self::bind(process, path)
    }

    /// Attaches to `pid` and binds the image it is running.
    pub fn attach(pid: i32) -> Result<Self> {
        let path = format!("/proc/{pid}/exe");
        let process = Process::attach(pid)?;
        Self::bind(process, Path::new(&path))
    }

    fn bind(process: Process, path: &Path) -> Result<Self> {
        let elf = Elf::open(path)?;

        let auxv = process.get_auxv()?;
        let entry = auxv.get(&(libc::AT_ENTRY as i32)).copied().ok_or_else(|| {
            DebuggerError::InvalidElf(format!(
                "auxiliary vector of pid {} carries no entry point",
                process.pid()
            ))
        })?;
        let bias = VirtAddr::new(entry - elf.header().e_entry);
        elf.notify_loaded(bias);
        debug!("{} loaded with bias {bias}", path.display());

        Ok(Target {
            process,
            elf,
            dwarf: OnceCell::new(),
        })
    }

    pub fn process(&self) -> &Process {
        &self.process
    }

    pub fn process_mut(&mut self) -> &mut Process {
        &mut self.process
    }

    pub fn elf(&self) -> &Rc<Elf> {
        &self.elf
    }

    /// The image's DWARF data, parsed on first use.
    pub fn dwarf(&self) -> Result<&Dwarf> {
        if self.dwarf.get().is_none() {
            let dwarf = Dwarf::new(&self.elf)?;
            let _ = self.dwarf.set(dwarf);
        }
        Ok(self.dwarf.get().expect("just initialized"))
    }
}
