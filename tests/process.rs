//! Live-tracee tests: these launch real programs (`yes`, `true`, `echo`)
//! and drive them over ptrace.

mod common;

use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::path::Path;

use common::find_in_path;
use pickaxe::addr::VirtAddr;
use pickaxe::disassemble::Disassembler;
use pickaxe::errors::DebuggerError;
use pickaxe::process::{HardwareStoppoint, Process, ProcessState, TrapType};
use pickaxe::register_info::RegisterId;
use pickaxe::registers::RegisterValue;
use pickaxe::stoppoint::StoppointMode;
use pickaxe::syscalls::{syscall_name_to_id, SyscallCatchPolicy};
use pickaxe::target::Target;

fn process_exists(pid: i32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

/// The status character from `/proc/<pid>/stat` ('t' while traced-stopped).
fn process_status(pid: i32) -> char {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).unwrap();
    let after_comm = stat.rfind(')').unwrap() + 2;
    stat.as_bytes()[after_comm] as char
}

fn entry_point(process: &Process) -> VirtAddr {
    let auxv = process.get_auxv().unwrap();
    VirtAddr::new(auxv[&(libc::AT_ENTRY as i32)])
}

/// Launches with stdout pointed at /dev/null so resumed tracees stay quiet.
fn launch_quiet(program: &str, debug: bool) -> Process {
    let devnull = OpenOptions::new().write(true).open("/dev/null").unwrap();
    Process::launch(program, debug, Some(devnull.as_raw_fd())).unwrap()
}

#[test]
fn launch_succeeds() {
    let process = Process::launch("yes", true, None).unwrap();
    assert!(process_exists(process.pid().as_raw()));
    assert_eq!(process.state(), ProcessState::Stopped);
}

#[test]
fn launch_of_a_missing_binary_fails() {
    let error = Process::launch("you_do_not_have_to_be_good", true, None).unwrap_err();
    assert!(error.to_string().contains("Could not execute program"));
}

#[test]
fn attach_stops_the_target() {
    let launched = launch_quiet("yes", false);
    let attached = Process::attach(launched.pid().as_raw()).unwrap();
    assert_eq!(attached.state(), ProcessState::Stopped);
    assert_eq!(process_status(launched.pid().as_raw()), 't');
}

#[test]
fn attach_to_an_invalid_pid_fails() {
    assert!(Process::attach(0).is_err());
}

#[test]
fn resume_runs_until_exit() {
    let mut process = Process::launch("true", true, None).unwrap();
    process.resume().unwrap();
    let reason = process.wait_on_signal().unwrap();
    assert_eq!(reason.state, ProcessState::Exited);
    assert_eq!(reason.exit_status, Some(0));

    // a dead tracee cannot be resumed
    let error = process.resume().unwrap_err();
    assert!(matches!(error, DebuggerError::WrongProcessState { .. }));
}

#[test]
fn a_running_tracee_accepts_no_operations() {
    let mut process = launch_quiet("yes", true);
    process.resume().unwrap();
    assert_eq!(process.state(), ProcessState::Running);

    assert!(process.read_memory(VirtAddr::new(0x1000), 8).is_err());
    assert!(process
        .create_breakpoint_site(VirtAddr::new(0x1000), false, false)
        .is_err());

    process.interrupt().unwrap();
    let reason = process.wait_on_signal().unwrap();
    assert_eq!(reason.state, ProcessState::Stopped);
    assert_eq!(reason.signal, Some(nix::sys::signal::Signal::SIGSTOP));
}

#[test]
fn software_breakpoints_patch_transparently() {
    let mut process = Process::launch("yes", true, None).unwrap();
    let entry = entry_point(&process);

    let original = process.read_memory(entry, 1).unwrap();
    let id = process.create_breakpoint_site(entry, false, false).unwrap();
    process.enable_breakpoint_site(id).unwrap();

    // raw reads see the patch, trap-free reads see the program
    assert_eq!(process.read_memory(entry, 1).unwrap(), vec![0xcc]);
    assert_eq!(
        process.read_memory_without_traps(entry, 1).unwrap(),
        original
    );

    process.disable_breakpoint_site(id).unwrap();
    assert_eq!(process.read_memory(entry, 1).unwrap(), original);

    // enable state follows the operations, and the byte survives the cycle
    process.enable_breakpoint_site(id).unwrap();
    process.disable_breakpoint_site(id).unwrap();
    assert_eq!(process.read_memory(entry, 1).unwrap(), original);

    // duplicate creation hands back the same site
    let again = process.create_breakpoint_site(entry, false, false).unwrap();
    assert_eq!(again, id);
}

#[test]
fn software_breakpoint_hits_report_the_site_address() {
    let mut process = launch_quiet("yes", true);
    let entry = entry_point(&process);

    let id = process.create_breakpoint_site(entry, false, false).unwrap();
    process.enable_breakpoint_site(id).unwrap();

    process.resume().unwrap();
    let reason = process.wait_on_signal().unwrap();

    assert_eq!(reason.state, ProcessState::Stopped);
    assert_eq!(reason.trap_reason, Some(TrapType::SoftwareBreak));
    assert_eq!(process.get_pc().unwrap(), entry);

    // resuming steps over the site transparently and keeps running
    process.resume().unwrap();
    assert_eq!(process.state(), ProcessState::Running);
}

#[test]
fn single_step_executes_one_instruction() {
    let mut process = Process::launch("yes", true, None).unwrap();
    let reason = process.step_instruction().unwrap();
    assert!(reason.is_step());
    assert_eq!(process.state(), ProcessState::Stopped);
}

#[test]
fn register_writes_round_trip_through_the_kernel() {
    let mut process = Process::launch("yes", true, None).unwrap();

    process
        .write_register_by_id(RegisterId::r13, RegisterValue::U64(0xcafe_cafe))
        .unwrap();
    let lanes = [0x11, 0xba, 0x5e, 0xba, 0, 0, 0, 0];
    process
        .write_register_by_id(RegisterId::mm0, RegisterValue::Byte64(lanes))
        .unwrap();
    process
        .write_register_by_id(RegisterId::xmm0, RegisterValue::F64(42.24))
        .unwrap();

    // a stop refills the whole mirror from the kernel
    process.step_instruction().unwrap();

    assert_eq!(
        process.read_register_by_id_as::<u64>(RegisterId::r13).unwrap(),
        0xcafe_cafe
    );
    assert_eq!(
        process
            .read_register_by_id_as::<[u8; 8]>(RegisterId::mm0)
            .unwrap(),
        lanes
    );
    let xmm0 = process
        .read_register_by_id_as::<[u8; 16]>(RegisterId::xmm0)
        .unwrap();
    assert_eq!(f64::from_le_bytes(xmm0[..8].try_into().unwrap()), 42.24);
}

#[test]
fn sub_register_writes_land_in_their_parent() {
    let mut process = Process::launch("yes", true, None).unwrap();

    process
        .write_register_by_id(RegisterId::r13, RegisterValue::U64(0xffff_ffff))
        .unwrap();
    process
        .write_register_by_id(RegisterId::r13b, RegisterValue::U8(42))
        .unwrap();
    process.step_instruction().unwrap();

    assert_eq!(
        process.read_register_by_id_as::<u8>(RegisterId::r13b).unwrap(),
        42
    );
}

#[test]
fn hardware_breakpoints_hit_without_patching() {
    let mut process = launch_quiet("yes", true);
    let entry = entry_point(&process);

    let original = process.read_memory(entry, 1).unwrap();
    let id = process.create_breakpoint_site(entry, true, false).unwrap();
    process.enable_breakpoint_site(id).unwrap();

    // hardware sites leave memory alone
    assert_eq!(process.read_memory(entry, 1).unwrap(), original);

    process.resume().unwrap();
    let reason = process.wait_on_signal().unwrap();

    assert_eq!(reason.trap_reason, Some(TrapType::HardwareBreak));
    assert_eq!(process.get_pc().unwrap(), entry);
    assert_eq!(
        process.get_current_hardware_stoppoint().unwrap(),
        HardwareStoppoint::BreakpointSite(id)
    );
}

#[test]
fn execute_watchpoints_trigger_and_identify_themselves() {
    let mut process = launch_quiet("yes", true);
    let entry = entry_point(&process);

    let id = process
        .create_watchpoint(entry, StoppointMode::Execute, 1)
        .unwrap();
    process.enable_watchpoint(id).unwrap();

    process.resume().unwrap();
    let reason = process.wait_on_signal().unwrap();

    assert_eq!(reason.trap_reason, Some(TrapType::HardwareBreak));
    assert_eq!(
        process.get_current_hardware_stoppoint().unwrap(),
        HardwareStoppoint::Watchpoint(id)
    );
}

#[test]
fn only_four_hardware_slots_exist() {
    let mut process = Process::launch("yes", true, None).unwrap();
    let entry = entry_point(&process);

    let mut ids = Vec::new();
    for offset in 0..4u64 {
        let id = process
            .create_watchpoint(entry + offset, StoppointMode::Execute, 1)
            .unwrap();
        process.enable_watchpoint(id).unwrap();
        ids.push(id);
    }

    // the fifth hardware stop-point finds no free debug register
    let site = process.create_breakpoint_site(entry, true, false).unwrap();
    let error = process.enable_breakpoint_site(site).unwrap_err();
    assert!(matches!(error, DebuggerError::NoFreeDebugRegister));

    // releasing a slot makes it available again
    process.disable_watchpoint(ids[2]).unwrap();
    process.enable_breakpoint_site(site).unwrap();
}

#[test]
fn watchpoints_must_be_aligned() {
    let mut process = Process::launch("yes", true, None).unwrap();
    let error = process
        .create_watchpoint(VirtAddr::new(0x1001), StoppointMode::Write, 8)
        .unwrap_err();
    assert!(matches!(error, DebuggerError::UnalignedWatchpoint { .. }));
}

#[test]
fn memory_reads_and_writes_round_trip() {
    let mut process = Process::launch("yes", true, None).unwrap();
    let stack = VirtAddr::new(
        process.read_register_by_id_as::<u64>(RegisterId::rsp).unwrap(),
    );

    let payload = b"seam of ore!";
    process.write_memory(stack, payload).unwrap();
    assert_eq!(process.read_memory(stack, payload.len()).unwrap(), payload);

    // unaligned reads mask head and tail correctly
    assert_eq!(
        process.read_memory(stack + 3u64, 5).unwrap(),
        &payload[3..8]
    );

    process
        .write_memory(stack, &0xdeadbeef_u64.to_le_bytes())
        .unwrap();
    assert_eq!(
        process.read_memory_as::<u64>(stack).unwrap(),
        0xdeadbeef_u64
    );
}

#[test]
fn syscall_stops_pair_entry_and_exit() {
    let devnull = OpenOptions::new().write(true).open("/dev/null").unwrap();
    let mut process = Process::launch("echo", true, Some(devnull.as_raw_fd())).unwrap();
    process.set_syscall_catch_policy(SyscallCatchPolicy::catch_all());

    process.resume().unwrap();
    let entry = process.wait_on_signal().unwrap();
    assert_eq!(entry.trap_reason, Some(TrapType::Syscall));
    let entry_info = entry.syscall_info.unwrap();
    assert!(entry_info.entry);

    process.resume().unwrap();
    let exit = process.wait_on_signal().unwrap();
    let exit_info = exit.syscall_info.unwrap();
    assert!(!exit_info.entry);
    assert_eq!(exit_info.id, entry_info.id);
}

#[test]
fn uninteresting_syscalls_never_surface() {
    let devnull = OpenOptions::new().write(true).open("/dev/null").unwrap();
    let mut process = Process::launch("echo", true, Some(devnull.as_raw_fd())).unwrap();

    let write_id = syscall_name_to_id("write").unwrap();
    process.set_syscall_catch_policy(SyscallCatchPolicy::catch_some(vec![write_id]));

    // every startup syscall before the first write is resumed transparently
    process.resume().unwrap();
    let reason = process.wait_on_signal().unwrap();
    assert_eq!(reason.trap_reason, Some(TrapType::Syscall));
    assert_eq!(i32::from(reason.syscall_info.unwrap().id), write_id);
}

#[test]
fn the_auxiliary_vector_is_readable() {
    let process = Process::launch("yes", true, None).unwrap();
    let auxv = process.get_auxv().unwrap();
    assert!(auxv[&(libc::AT_ENTRY as i32)] != 0);
}

#[test]
fn targets_bind_the_loaded_image() {
    let path = find_in_path("yes").expect("yes is installed");
    let target = Target::launch(&path, None).unwrap();

    let auxv_entry = entry_point(target.process());
    let computed = target.elf().load_bias() + target.elf().header().e_entry;
    assert_eq!(computed, auxv_entry);

    // disassembly at the stop location sees real instructions
    let listing = Disassembler::new(target.process())
        .disassemble(5, None)
        .unwrap();
    assert_eq!(listing.len(), 5);
    assert_eq!(listing[0].address, target.process().get_pc().unwrap());
    assert!(!listing[0].text.is_empty());
}
