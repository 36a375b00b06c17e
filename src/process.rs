//! The process engine: owns one tracee and its stop/resume state machine.
//!
//! A [`Process`] is created by launching a program or attaching to a running
//! pid. While the tracee runs, the engine refuses every ptrace-backed
//! operation; once stopped (or dead) it serves memory and register access,
//! stop-point management, and hardware debug register allocation.
//!
//! All wait-status and siginfo interpretation happens in one place,
//! [`Process::wait_on_signal`], which decodes the kernel's report into a
//! [`StopReason`].

use std::collections::HashMap;
use std::ffi::CString;
use std::fs::File;
use std::io::Read;
use std::marker::PhantomData;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use libc::c_void;
use nix::errno::Errno;
use nix::sys::personality::{self, Persona};
use nix::sys::ptrace;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{dup2, execvp, fork, setpgid, ForkResult, Pid};
use tracing::{debug, info, trace, warn};

use crate::addr::VirtAddr;
use crate::breakpoint::BreakpointSite;
use crate::consts::{DR6_SINGLE_STEP, DR6_TRAP_MASK, SI_KERNEL, TRAP_BRKPT, TRAP_HWBKPT, TRAP_TRACE};
use crate::errors::{DebuggerError, Result};
use crate::pipe::Pipe;
use crate::register_info::{
    register_info_by_id, RegisterId, RegisterInfo, RegisterType, DEBUG_REGISTER_IDS,
};
use crate::registers::{RegisterValue, Registers};
use crate::stoppoint::{Stoppoint, StoppointCollection, StoppointMode};
use crate::syscalls::{CatchPolicyMode, SyscallCatchPolicy};
use crate::watchpoint::Watchpoint;
use crate::{rmem, wmem};

/// Where the tracee currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ProcessState {
    Stopped,
    Running,
    Exited,
    Terminated,
}

impl ProcessState {
    fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Running => "running",
            ProcessState::Exited => "exited",
            ProcessState::Terminated => "terminated",
        }
    }
}

/// Why a SIGTRAP stop happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum TrapType {
    SingleStep,
    SoftwareBreak,
    HardwareBreak,
    Syscall,
    Unknown,
}

/// Entry arguments or exit value of a caught syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum SyscallData {
    Args([u64; 6]),
    Ret(i64),
}

/// One caught syscall boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct SyscallInfo {
    pub id: u16,
    pub entry: bool,
    pub data: SyscallData,
}

/// The decoded outcome of one wait on the tracee.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopReason {
    pub state: ProcessState,
    pub exit_status: Option<i32>,
    pub signal: Option<Signal>,
    pub trap_reason: Option<TrapType>,
    pub syscall_info: Option<SyscallInfo>,
}

impl StopReason {
    fn exited(exit_status: i32) -> Self {
        StopReason {
            state: ProcessState::Exited,
            exit_status: Some(exit_status),
            signal: None,
            trap_reason: None,
            syscall_info: None,
        }
    }

    fn terminated(signal: Signal) -> Self {
        StopReason {
            state: ProcessState::Terminated,
            exit_status: None,
            signal: Some(signal),
            trap_reason: None,
            syscall_info: None,
        }
    }

    fn stopped(signal: Signal) -> Self {
        StopReason {
            state: ProcessState::Stopped,
            exit_status: None,
            signal: Some(signal),
            trap_reason: None,
            syscall_info: None,
        }
    }

    fn syscall_stop() -> Self {
        StopReason {
            state: ProcessState::Stopped,
            exit_status: None,
            signal: Some(Signal::SIGTRAP),
            trap_reason: Some(TrapType::Syscall),
            syscall_info: None,
        }
    }

    pub fn is_breakpoint(&self) -> bool {
        self.state == ProcessState::Stopped
            && self.signal == Some(Signal::SIGTRAP)
            && matches!(
                self.trap_reason,
                Some(TrapType::SoftwareBreak | TrapType::HardwareBreak)
            )
    }

    pub fn is_step(&self) -> bool {
        self.state == ProcessState::Stopped
            && self.signal == Some(Signal::SIGTRAP)
            && self.trap_reason == Some(TrapType::SingleStep)
    }
}

/// Identifies which kind of stop-point owns a triggered debug register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareStoppoint {
    BreakpointSite(i32),
    Watchpoint(i32),
}

/// One traced process and everything the engine knows about it.
pub struct Process {
    pid: Pid,
    state: ProcessState,
    terminate_on_end: bool,
    is_attached: bool,
    registers: Registers,
    breakpoint_sites: StoppointCollection<BreakpointSite>,
    watchpoints: StoppointCollection<Watchpoint>,
    syscall_catch_policy: SyscallCatchPolicy,
    expecting_syscall_exit: bool,
    // the engine is single-threaded; keep the tracee handle on one thread
    _not_send_or_sync: PhantomData<*mut ()>,
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("state", &self.state)
            .field("terminate_on_end", &self.terminate_on_end)
            .field("is_attached", &self.is_attached)
            .field("syscall_catch_policy", &self.syscall_catch_policy)
            .field("expecting_syscall_exit", &self.expecting_syscall_exit)
            .finish()
    }
}

impl Process {
    fn new(pid: Pid, terminate_on_end: bool, is_attached: bool) -> Self {
        Process {
            pid,
            state: ProcessState::Running,
            terminate_on_end,
            is_attached,
            registers: Registers::new(),
            breakpoint_sites: StoppointCollection::new(),
            watchpoints: StoppointCollection::new(),
            syscall_catch_policy: SyscallCatchPolicy::catch_none(),
            expecting_syscall_exit: false,
            _not_send_or_sync: PhantomData,
        }
    }

    /// Forks and executes `path`, optionally under tracing.
    ///
    /// Any child-side failure travels back over a close-on-exec pipe and
    /// surfaces as [`DebuggerError::Launch`] carrying the child's message.
    /// With `stdout_replacement`, the child's stdout is redirected to that
    /// descriptor before exec.
    pub fn launch(
        path: impl AsRef<Path>,
        debug: bool,
        stdout_replacement: Option<RawFd>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let mut channel = Pipe::new(true)?;

        let fork_result = unsafe { fork() }
            .map_err(|errno| DebuggerError::os_call("Could not fork", errno))?;

        match fork_result {
            ForkResult::Child => {
                channel.close_read();
                // only an error ever comes back from bootstrap
                let error = bootstrap_child(path, debug, stdout_replacement).unwrap_err();
                let _ = channel.write(error.to_string().as_bytes());
                std::process::exit(1);
            }
            ForkResult::Parent { child } => {
                channel.close_write();
                let data = channel.read()?;
                channel.close_read();

                if !data.is_empty() {
                    let _ = waitpid(child, None);
                    return Err(DebuggerError::Launch(
                        String::from_utf8_lossy(&data).into_owned(),
                    ));
                }

                let mut process = Process::new(child, true, debug);
                if debug {
                    process.wait_on_signal()?;
                    set_trace_options(child)?;
                }

                info!("launched {} as pid {child}", path.display());
                Ok(process)
            }
        }
    }

    /// Attaches to an already running process and waits for its stop.
    pub fn attach(pid: i32) -> Result<Self> {
        if pid <= 0 {
            return Err(DebuggerError::os_call(
                "Could not attach to process",
                Errno::ESRCH,
            ));
        }

        let pid = Pid::from_raw(pid);
        ptrace::attach(pid)
            .map_err(|errno| DebuggerError::os_call("Could not attach to process", errno))?;

        let mut process = Process::new(pid, false, true);
        process.wait_on_signal()?;
        set_trace_options(pid)?;

        info!("attached to pid {pid}");
        Ok(process)
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    pub fn breakpoint_sites(&self) -> &StoppointCollection<BreakpointSite> {
        &self.breakpoint_sites
    }

    pub fn watchpoints(&self) -> &StoppointCollection<Watchpoint> {
        &self.watchpoints
    }

    pub fn syscall_catch_policy(&self) -> &SyscallCatchPolicy {
        &self.syscall_catch_policy
    }

    /// Installs the syscall catch policy for subsequent resumes.
    pub fn set_syscall_catch_policy(&mut self, policy: SyscallCatchPolicy) {
        self.syscall_catch_policy = policy;
    }

    fn expect_stopped(&self, operation: &'static str) -> Result<()> {
        if self.state == ProcessState::Stopped {
            Ok(())
        } else {
            Err(DebuggerError::WrongProcessState {
                required: "stopped",
                actual: self.state.as_str(),
            })
            .inspect_err(|_| debug!("refused to {operation} a {} tracee", self.state.as_str()))
        }
    }

    fn expect_not_running(&self, operation: &'static str) -> Result<()> {
        if self.state == ProcessState::Running {
            debug!("refused to {operation} a running tracee");
            Err(DebuggerError::WrongProcessState {
                required: "stopped",
                actual: self.state.as_str(),
            })
        } else {
            Ok(())
        }
    }

    /// Hands control back to the tracee.
    ///
    /// If the program counter sits on an enabled software breakpoint, the
    /// engine first single-steps past it with the original opcode restored
    /// and re-arms the patch, so the tracee never observes it. Syscall
    /// tracing is used whenever a catch policy is installed.
    pub fn resume(&mut self) -> Result<()> {
        self.expect_stopped("resume")?;

        let pc = self.get_pc()?;
        if self.breakpoint_sites.enabled_stoppoint_at_address(pc) {
            trace!("stepping over enabled breakpoint site at {pc}");
            let Process {
                pid,
                registers,
                breakpoint_sites,
                ..
            } = self;
            let site = breakpoint_sites
                .get_by_address_mut(pc)
                .expect("an enabled site was just found at this address");
            site.disable(registers)?;
            ptrace::step(*pid, None)
                .map_err(|errno| DebuggerError::os_call("Could not single step", errno))?;
            waitpid(*pid, None)
                .map_err(|errno| DebuggerError::os_call("Could not wait on tracee", errno))?;
            site.enable(registers)?;
        }

        if self.syscall_catch_policy.mode() == CatchPolicyMode::None {
            ptrace::cont(self.pid, None)
                .map_err(|errno| DebuggerError::os_call("Could not resume", errno))?;
        } else {
            ptrace::syscall(self.pid, None)
                .map_err(|errno| DebuggerError::os_call("Could not resume", errno))?;
        }

        self.state = ProcessState::Running;
        trace!("tracee {} resumed", self.pid);
        Ok(())
    }

    /// Blocks until the tracee changes state and decodes what happened.
    ///
    /// Syscall stops outside the installed catch policy are resumed
    /// transparently; the caller never sees them.
    pub fn wait_on_signal(&mut self) -> Result<StopReason> {
        loop {
            let status = waitpid(self.pid, None)
                .map_err(|errno| DebuggerError::os_call("Could not wait on tracee", errno))?;

            let mut reason = match status {
                WaitStatus::Exited(_, exit_status) => {
                    self.state = ProcessState::Exited;
                    debug!("tracee {} exited with status {exit_status}", self.pid);
                    StopReason::exited(exit_status)
                }
                WaitStatus::Signaled(_, signal, _) => {
                    self.state = ProcessState::Terminated;
                    debug!("tracee {} terminated by {signal}", self.pid);
                    StopReason::terminated(signal)
                }
                WaitStatus::Stopped(_, signal) => {
                    self.state = ProcessState::Stopped;
                    trace!("tracee {} stopped by {signal}", self.pid);
                    StopReason::stopped(signal)
                }
                WaitStatus::PtraceSyscall(_) => {
                    self.state = ProcessState::Stopped;
                    trace!("tracee {} stopped at a syscall boundary", self.pid);
                    StopReason::syscall_stop()
                }
                other => {
                    return Err(DebuggerError::UnexpectedWaitStatus(format!("{other:?}")));
                }
            };

            if self.is_attached && self.state == ProcessState::Stopped {
                self.read_all_registers()?;
                self.augment_stop_reason(&mut reason)?;

                match reason.trap_reason {
                    Some(TrapType::SoftwareBreak) => {
                        // the trap pushed the pc one byte past the int3
                        let instruction_begin = self.get_pc()? - 1u64;
                        if self
                            .breakpoint_sites
                            .enabled_stoppoint_at_address(instruction_begin)
                        {
                            self.set_pc(instruction_begin)?;
                        }
                    }
                    Some(TrapType::HardwareBreak) => {
                        if let Ok(HardwareStoppoint::Watchpoint(id)) =
                            self.get_current_hardware_stoppoint()
                        {
                            self.refresh_watchpoint_data(id)?;
                        }
                    }
                    Some(TrapType::Syscall) => {
                        if self.should_skip_syscall_stop(&reason) {
                            trace!("transparently resuming uninteresting syscall stop");
                            self.resume()?;
                            continue;
                        }
                    }
                    _ => {}
                }
            }

            return Ok(reason);
        }
    }

    /// Executes exactly one instruction.
    ///
    /// A breakpoint under the program counter is unpatched for the step and
    /// re-armed afterwards.
    pub fn step_instruction(&mut self) -> Result<StopReason> {
        self.expect_stopped("single step")?;

        let pc = self.get_pc()?;
        let mut to_reenable = None;
        {
            let Process {
                registers,
                breakpoint_sites,
                ..
            } = self;
            if let Some(site) = breakpoint_sites.get_by_address_mut(pc) {
                if site.is_enabled() && !site.is_hardware() {
                    site.disable(registers)?;
                    to_reenable = Some(site.id());
                }
            }
        }

        ptrace::step(self.pid, None)
            .map_err(|errno| DebuggerError::os_call("Could not single step", errno))?;
        let reason = self.wait_on_signal()?;

        if let Some(id) = to_reenable {
            let Process {
                registers,
                breakpoint_sites,
                ..
            } = self;
            breakpoint_sites
                .get_by_id_mut(id)
                .expect("the stepped-over site still exists")
                .enable(registers)?;
        }

        Ok(reason)
    }

    /// Sends SIGSTOP so the next wait yields a stopped reason.
    pub fn interrupt(&self) -> Result<()> {
        kill(self.pid, Signal::SIGSTOP)
            .map_err(|errno| DebuggerError::os_call("Could not interrupt tracee", errno))
    }

    fn should_skip_syscall_stop(&self, reason: &StopReason) -> bool {
        match self.syscall_catch_policy.mode() {
            CatchPolicyMode::All => false,
            CatchPolicyMode::None => true,
            CatchPolicyMode::Some => match &reason.syscall_info {
                Some(info) => !self
                    .syscall_catch_policy
                    .to_catch()
                    .contains(&i32::from(info.id)),
                None => true,
            },
        }
    }

    fn augment_stop_reason(&mut self, reason: &mut StopReason) -> Result<()> {
        let siginfo = ptrace::getsiginfo(self.pid)
            .map_err(|errno| DebuggerError::os_call("Could not get signal info", errno))?;

        if reason.trap_reason == Some(TrapType::Syscall) {
            let id = self.registers.read_by_id_as::<u64>(RegisterId::orig_rax)? as u16;
            let info = if self.expecting_syscall_exit {
                self.expecting_syscall_exit = false;
                SyscallInfo {
                    id,
                    entry: false,
                    data: SyscallData::Ret(
                        self.registers.read_by_id_as::<u64>(RegisterId::rax)? as i64
                    ),
                }
            } else {
                self.expecting_syscall_exit = true;
                let arg_registers = [
                    RegisterId::rdi,
                    RegisterId::rsi,
                    RegisterId::rdx,
                    RegisterId::r10,
                    RegisterId::r8,
                    RegisterId::r9,
                ];
                let mut args = [0u64; 6];
                for (slot, id) in args.iter_mut().zip(arg_registers) {
                    *slot = self.registers.read_by_id_as::<u64>(id)?;
                }
                SyscallInfo {
                    id,
                    entry: true,
                    data: SyscallData::Args(args),
                }
            };
            reason.syscall_info = Some(info);
            return Ok(());
        }

        // a plain signal stop breaks any entry/exit pairing
        self.expecting_syscall_exit = false;

        if reason.signal == Some(Signal::SIGTRAP) {
            reason.trap_reason = Some(match siginfo.si_code {
                TRAP_TRACE => TrapType::SingleStep,
                TRAP_BRKPT | SI_KERNEL => TrapType::SoftwareBreak,
                TRAP_HWBKPT => {
                    let status = self.registers.read_by_id_as::<u64>(RegisterId::dr6)?;
                    if status & DR6_SINGLE_STEP != 0 {
                        TrapType::SingleStep
                    } else {
                        TrapType::HardwareBreak
                    }
                }
                code => {
                    warn!("strange SIGTRAP code: {code}");
                    TrapType::Unknown
                }
            });
        }

        Ok(())
    }

    /// Refills the user-area mirror from the kernel.
    fn read_all_registers(&mut self) -> Result<()> {
        let gprs = ptrace::getregs(self.pid)
            .map_err(|errno| DebuggerError::os_call("Could not read GPR registers", errno))?;
        *self.registers.gprs_mut() = gprs;

        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_GETFPREGS,
                self.pid.as_raw(),
                std::ptr::null_mut::<c_void>(),
                self.registers.fprs_mut() as *mut _ as *mut c_void,
            )
        };
        if ret < 0 {
            return Err(DebuggerError::os_call(
                "Could not read FPR registers",
                Errno::last(),
            ));
        }

        let dr_base = register_info_by_id(RegisterId::dr0).offset;
        for index in 0..8 {
            let offset = dr_base + index * 8;
            let data = ptrace::read_user(self.pid, offset as *mut c_void).map_err(|errno| {
                DebuggerError::os_call(format!("Could not read debug register {index}"), errno)
            })?;
            self.registers.set_debug_register(index, data as u64);
        }

        Ok(())
    }

    /// The current program counter.
    pub fn get_pc(&self) -> Result<VirtAddr> {
        Ok(VirtAddr::new(
            self.registers.read_by_id_as::<u64>(RegisterId::rip)?,
        ))
    }

    pub fn set_pc(&mut self, addr: VirtAddr) -> Result<()> {
        self.write_register_by_id(RegisterId::rip, RegisterValue::U64(addr.addr()))
    }

    /// Writes a register through the mirror and flushes it into the kernel.
    ///
    /// Floating-point state goes through the dedicated set-registers call;
    /// everything else is an aligned 8-byte user-area poke.
    pub fn write_register(&mut self, info: &RegisterInfo, value: RegisterValue) -> Result<()> {
        self.expect_not_running("write a register of")?;
        self.registers.write(info, value)?;

        if info.reg_type == RegisterType::Fpr {
            self.write_fprs()
        } else {
            let (aligned, word) = self.registers.aligned_word_at(info.offset);
            write_user_area(self.pid, aligned, word)
        }
    }

    pub fn write_register_by_id(&mut self, id: RegisterId, value: RegisterValue) -> Result<()> {
        self.write_register(register_info_by_id(id), value)
    }

    pub fn read_register_by_id_as<T>(&self, id: RegisterId) -> Result<T>
    where
        T: TryFrom<RegisterValue, Error = DebuggerError>,
    {
        self.registers.read_by_id_as(id)
    }

    /// Flushes the mirrored floating-point state.
    pub fn write_fprs(&self) -> Result<()> {
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_SETFPREGS,
                self.pid.as_raw(),
                std::ptr::null_mut::<c_void>(),
                self.registers.fprs() as *const _ as *mut c_void,
            )
        };
        if ret < 0 {
            return Err(DebuggerError::os_call(
                "Could not write FPR registers",
                Errno::last(),
            ));
        }
        Ok(())
    }

    /// Flushes the mirrored general-purpose registers.
    pub fn write_gprs(&self) -> Result<()> {
        ptrace::setregs(self.pid, *self.registers.gprs())
            .map_err(|errno| DebuggerError::os_call("Could not write GPR registers", errno))
    }

    /// Pokes one aligned 8-byte unit of the user area.
    pub fn write_user_area(&self, offset: usize, word: u64) -> Result<()> {
        write_user_area(self.pid, offset, word)
    }

    /// Reads `amount` bytes of tracee memory.
    ///
    /// Transfers happen in aligned 8-byte words; unaligned requests mask the
    /// head and tail.
    pub fn read_memory(&self, address: VirtAddr, amount: usize) -> Result<Vec<u8>> {
        self.expect_not_running("read memory of")?;
        if amount == 0 {
            return Ok(Vec::new());
        }

        let aligned = address.addr() & !0b111;
        let skip = (address.addr() - aligned) as usize;
        let total = skip + amount;

        let mut bytes = Vec::with_capacity(total + 8);
        let mut offset = 0;
        while offset < total {
            let word = rmem(self.pid, VirtAddr::new(aligned + offset as u64))?;
            bytes.extend_from_slice(&word.to_le_bytes());
            offset += 8;
        }

        bytes.drain(..skip);
        bytes.truncate(amount);
        Ok(bytes)
    }

    /// Like [`Process::read_memory`], but bytes patched by enabled software
    /// breakpoint sites read as the program's original code.
    pub fn read_memory_without_traps(&self, address: VirtAddr, amount: usize) -> Result<Vec<u8>> {
        let mut memory = self.read_memory(address, amount)?;

        let end = address + amount;
        for site in self.breakpoint_sites.get_in_region(address, end) {
            if !site.is_enabled() || site.is_hardware() {
                continue;
            }
            let offset = (site.address() - address) as usize;
            memory[offset] = site.saved_data();
        }

        Ok(memory)
    }

    /// Reads a little-endian plain value out of tracee memory.
    pub fn read_memory_as<T: FromBytes>(&self, address: VirtAddr) -> Result<T> {
        let data = self.read_memory(address, std::mem::size_of::<T>())?;
        T::from_bytes(&data)
    }

    /// Writes bytes into tracee memory with word-level read-modify-write at
    /// the tail.
    pub fn write_memory(&mut self, address: VirtAddr, data: &[u8]) -> Result<()> {
        self.expect_not_running("write memory of")?;

        let mut written = 0;
        while written < data.len() {
            let remaining = data.len() - written;
            let target = address + written;

            let word = if remaining >= 8 {
                u64::from_le_bytes(data[written..written + 8].try_into().unwrap())
            } else {
                let existing = self.read_memory(target, 8)?;
                let mut merged = [0u8; 8];
                merged[..remaining].copy_from_slice(&data[written..]);
                merged[remaining..].copy_from_slice(&existing[remaining..]);
                u64::from_le_bytes(merged)
            };

            wmem(self.pid, target, word as i64)?;
            written += 8;
        }

        Ok(())
    }

    /// Registers a breakpoint site. Creating a second site at the same
    /// address returns the existing one's id.
    pub fn create_breakpoint_site(
        &mut self,
        address: VirtAddr,
        is_hardware: bool,
        is_internal: bool,
    ) -> Result<i32> {
        self.expect_not_running("create a breakpoint site for")?;

        if let Some(existing) = self.breakpoint_sites.get_by_address(address) {
            debug!("breakpoint site already exists at {address}");
            return Ok(existing.id());
        }

        let id = self.breakpoint_sites.claim_id();
        self.breakpoint_sites.push(BreakpointSite::new(
            id,
            self.pid,
            address,
            is_hardware,
            is_internal,
        ));
        Ok(id)
    }

    /// Registers a watchpoint. The address must be a multiple of the size.
    /// Creating a second watchpoint at the same address returns the existing
    /// one's id.
    pub fn create_watchpoint(
        &mut self,
        address: VirtAddr,
        mode: StoppointMode,
        size: usize,
    ) -> Result<i32> {
        self.expect_not_running("create a watchpoint for")?;

        if let Some(existing) = self.watchpoints.get_by_address(address) {
            debug!("watchpoint already exists at {address}");
            return Ok(existing.id());
        }

        let id = self.watchpoints.claim_id();
        let watchpoint = Watchpoint::new(id, self.pid, address, mode, size)?;
        self.watchpoints.push(watchpoint);
        Ok(id)
    }

    pub fn enable_breakpoint_site(&mut self, id: i32) -> Result<()> {
        let Process {
            registers,
            breakpoint_sites,
            ..
        } = self;
        breakpoint_sites
            .get_by_id_mut(id)
            .ok_or(DebuggerError::UnknownStoppoint(id))?
            .enable(registers)
    }

    pub fn disable_breakpoint_site(&mut self, id: i32) -> Result<()> {
        let Process {
            registers,
            breakpoint_sites,
            ..
        } = self;
        breakpoint_sites
            .get_by_id_mut(id)
            .ok_or(DebuggerError::UnknownStoppoint(id))?
            .disable(registers)
    }

    /// Disables and removes a breakpoint site.
    pub fn remove_breakpoint_site(&mut self, id: i32) -> Result<()> {
        let Process {
            registers,
            breakpoint_sites,
            ..
        } = self;
        breakpoint_sites.remove_by_id(id, registers)
    }

    pub fn enable_watchpoint(&mut self, id: i32) -> Result<()> {
        let Process {
            registers,
            watchpoints,
            ..
        } = self;
        watchpoints
            .get_by_id_mut(id)
            .ok_or(DebuggerError::UnknownStoppoint(id))?
            .enable(registers)
    }

    pub fn disable_watchpoint(&mut self, id: i32) -> Result<()> {
        let Process {
            registers,
            watchpoints,
            ..
        } = self;
        watchpoints
            .get_by_id_mut(id)
            .ok_or(DebuggerError::UnknownStoppoint(id))?
            .disable(registers)
    }

    /// Disables and removes a watchpoint.
    pub fn remove_watchpoint(&mut self, id: i32) -> Result<()> {
        let Process {
            registers,
            watchpoints,
            ..
        } = self;
        watchpoints.remove_by_id(id, registers)
    }

    /// Identifies the stop-point behind the most recent hardware trap by
    /// reading DR6 and matching the triggered slot against both collections.
    pub fn get_current_hardware_stoppoint(&self) -> Result<HardwareStoppoint> {
        let status = self.registers.read_by_id_as::<u64>(RegisterId::dr6)?;
        let hits = status & DR6_TRAP_MASK;
        if hits == 0 {
            return Err(DebuggerError::NoHardwareStoppointHit);
        }

        let index = hits.trailing_zeros() as usize;
        if let Some(site) = self
            .breakpoint_sites
            .iter()
            .find(|site| site.hardware_register_index() == Some(index))
        {
            return Ok(HardwareStoppoint::BreakpointSite(site.id()));
        }
        if let Some(point) = self
            .watchpoints
            .iter()
            .find(|point| point.hardware_register_index() == Some(index))
        {
            return Ok(HardwareStoppoint::Watchpoint(point.id()));
        }

        Err(DebuggerError::UnknownStoppoint(index as i32))
    }

    fn refresh_watchpoint_data(&mut self, id: i32) -> Result<()> {
        let (address, size) = {
            let point = self
                .watchpoints
                .get_by_id(id)
                .ok_or(DebuggerError::UnknownStoppoint(id))?;
            (point.address(), point.size())
        };

        let bytes = match self.read_memory(address, size) {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!("could not read watched memory at {address}: {error}");
                Vec::new()
            }
        };
        self.watchpoints
            .get_by_id_mut(id)
            .expect("looked up above")
            .update_data(&bytes);
        Ok(())
    }

    /// The tracee's auxiliary vector.
    pub fn get_auxv(&self) -> Result<HashMap<i32, u64>> {
        let path = format!("/proc/{}/auxv", self.pid);
        let mut file = File::open(path)?;

        let mut auxv = HashMap::new();
        let mut entry = [0u8; 16];
        while file.read_exact(&mut entry).is_ok() {
            let key = u64::from_ne_bytes(entry[..8].try_into().unwrap());
            let value = u64::from_ne_bytes(entry[8..].try_into().unwrap());
            if key == 0 {
                break;
            }
            auxv.insert(key as i32, value);
        }

        Ok(auxv)
    }
}

impl Drop for Process {
    /// Releases the tracee: a launched one is killed, an attached one is
    /// detached and continued. Errors are swallowed; resources go anyway.
    fn drop(&mut self) {
        if self.pid.as_raw() == 0 {
            return;
        }

        if self.is_attached && !matches!(self.state, ProcessState::Exited | ProcessState::Terminated)
        {
            if self.state == ProcessState::Running {
                let _ = kill(self.pid, Signal::SIGSTOP);
                let _ = waitpid(self.pid, None);
            }
            let _ = ptrace::detach(self.pid, None);
            let _ = kill(self.pid, Signal::SIGCONT);
        }

        if self.terminate_on_end {
            let _ = kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
        }
    }
}

/// Plain little-endian values readable straight out of tracee memory.
pub trait FromBytes: Sized {
    fn from_bytes(bytes: &[u8]) -> Result<Self>;
}

macro_rules! impl_from_bytes {
    ($($t:ty),*) => {
        $(impl FromBytes for $t {
            fn from_bytes(bytes: &[u8]) -> Result<Self> {
                let array = bytes.try_into().map_err(|_| {
                    DebuggerError::ParseStr(format!(
                        "expected {} bytes, got {}",
                        std::mem::size_of::<$t>(),
                        bytes.len()
                    ))
                })?;
                Ok(<$t>::from_le_bytes(array))
            }
        })*
    };
}

impl_from_bytes!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

/// Child-side half of [`Process::launch`]; only ever returns an error.
fn bootstrap_child(path: &Path, debug: bool, stdout_replacement: Option<RawFd>) -> Result<()> {
    if let Some(fd) = stdout_replacement {
        dup2(fd, libc::STDOUT_FILENO)
            .map_err(|errno| DebuggerError::os_call("stdout replacement failed", errno))?;
    }

    setpgid(Pid::from_raw(0), Pid::from_raw(0))
        .map_err(|errno| DebuggerError::os_call("Could not set pgid", errno))?;

    // load the image at its linked addresses so file offsets stay meaningful
    let persona = personality::get()
        .map_err(|errno| DebuggerError::os_call("Could not get personality", errno))?;
    personality::set(persona | Persona::ADDR_NO_RANDOMIZE)
        .map_err(|errno| DebuggerError::os_call("Could not disable ASLR", errno))?;

    if debug {
        ptrace::traceme()
            .map_err(|errno| DebuggerError::os_call("Tracing request failed", errno))?;
    }

    let program = CString::new(path.as_os_str().as_bytes())?;
    execvp(&program, &[program.clone()])
        .map_err(|errno| DebuggerError::os_call("Could not execute program", errno))?;
    unreachable!("execvp replaced the image");
}

fn set_trace_options(pid: Pid) -> Result<()> {
    ptrace::setoptions(pid, ptrace::Options::PTRACE_O_TRACESYSGOOD)
        .map_err(|errno| DebuggerError::os_call("Could not set tracing options", errno))
}

fn write_user_area(pid: Pid, offset: usize, word: u64) -> Result<()> {
    ptrace::write_user(pid, offset as *mut c_void, word as i64).map_err(|errno| {
        DebuggerError::os_call(format!("Could not poke user area at {offset:#x}"), errno)
    })
}

fn encode_hardware_stoppoint_mode(mode: StoppointMode) -> u64 {
    match mode {
        StoppointMode::Execute => 0b00,
        StoppointMode::Write => 0b01,
        StoppointMode::ReadWrite => 0b11,
    }
}

fn encode_hardware_stoppoint_size(size: usize) -> Result<u64> {
    match size {
        1 => Ok(0b00),
        2 => Ok(0b01),
        4 => Ok(0b11),
        8 => Ok(0b10),
        other => Err(DebuggerError::InvalidStoppointSize(other)),
    }
}

/// Claims the lowest free debug register slot and arms it.
///
/// The slot's address register receives `address`; the matching enable bit
/// and condition/length nibble are encoded into DR7. Returns the slot index.
pub(crate) fn set_hardware_stoppoint(
    pid: Pid,
    regs: &mut Registers,
    address: VirtAddr,
    mode: StoppointMode,
    size: usize,
) -> Result<usize> {
    let control = regs.read_by_id_as::<u64>(RegisterId::dr7)?;

    let free = (0..DEBUG_REGISTER_IDS.len())
        .find(|&slot| control & (0b11 << (slot * 2)) == 0)
        .ok_or(DebuggerError::NoFreeDebugRegister)?;

    let mode_flag = encode_hardware_stoppoint_mode(mode);
    let size_flag = encode_hardware_stoppoint_size(size)?;

    let enable_bit = 1u64 << (free * 2);
    let control_bits = (mode_flag << (free * 4 + 16)) | (size_flag << (free * 4 + 18));
    let updated = (control & !(0b11u64 << (free * 2)) & !(0b1111u64 << (free * 4 + 16)))
        | enable_bit
        | control_bits;

    let dr_info = register_info_by_id(DEBUG_REGISTER_IDS[free]);
    regs.write(dr_info, RegisterValue::U64(address.addr()))?;
    write_user_area(pid, dr_info.offset, address.addr())?;

    let dr7_info = register_info_by_id(RegisterId::dr7);
    regs.write(dr7_info, RegisterValue::U64(updated))?;
    write_user_area(pid, dr7_info.offset, updated)?;

    trace!("armed debug register {free} at {address}");
    Ok(free)
}

/// Zeroes a debug register slot and its DR7 bits.
pub(crate) fn clear_hardware_stoppoint(pid: Pid, regs: &mut Registers, index: usize) -> Result<()> {
    let dr_info = register_info_by_id(DEBUG_REGISTER_IDS[index]);
    regs.write(dr_info, RegisterValue::U64(0))?;
    write_user_area(pid, dr_info.offset, 0)?;

    let control = regs.read_by_id_as::<u64>(RegisterId::dr7)?;
    let cleared = control & !(0b11u64 << (index * 2)) & !(0b1111u64 << (index * 4 + 16));

    let dr7_info = register_info_by_id(RegisterId::dr7);
    regs.write(dr7_info, RegisterValue::U64(cleared))?;
    write_user_area(pid, dr7_info.offset, cleared)?;

    trace!("released debug register {index}");
    Ok(())
}
