//! Syscall catching policy and name/number mapping.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde::Serialize;
use sysnames::Syscalls;

use crate::errors::{DebuggerError, Result};

/// Which syscall stops the engine reports to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CatchPolicyMode {
    None,
    Some,
    All,
}

/// Selects the syscalls whose entry and exit stops are interesting.
///
/// Applies only to the process the policy is installed on. With mode
/// [`CatchPolicyMode::Some`], stops for syscalls outside `to_catch` are
/// resumed transparently and never surface.
#[derive(Debug, Clone, Serialize)]
pub struct SyscallCatchPolicy {
    mode: CatchPolicyMode,
    to_catch: Vec<i32>,
}

impl SyscallCatchPolicy {
    pub fn catch_all() -> Self {
        SyscallCatchPolicy {
            mode: CatchPolicyMode::All,
            to_catch: Vec::new(),
        }
    }

    pub fn catch_none() -> Self {
        SyscallCatchPolicy {
            mode: CatchPolicyMode::None,
            to_catch: Vec::new(),
        }
    }

    pub fn catch_some(to_catch: Vec<i32>) -> Self {
        SyscallCatchPolicy {
            mode: CatchPolicyMode::Some,
            to_catch,
        }
    }

    pub fn mode(&self) -> CatchPolicyMode {
        self.mode
    }

    pub fn to_catch(&self) -> &[i32] {
        &self.to_catch
    }
}

impl Default for SyscallCatchPolicy {
    fn default() -> Self {
        Self::catch_none()
    }
}

/// The name of the syscall with the given number.
pub fn syscall_id_to_name(id: i32) -> Result<&'static str> {
    Syscalls::name(id as u64).ok_or_else(|| DebuggerError::UnknownSyscall(format!("number {id}")))
}

/// The number of the named syscall.
pub fn syscall_name_to_id(name: &str) -> Result<i32> {
    static BY_NAME: OnceLock<HashMap<&'static str, i32>> = OnceLock::new();

    let map = BY_NAME.get_or_init(|| {
        // sysnames only maps number to name; x86-64 numbers stay well below
        // 1024, so invert by scanning that range once.
        let mut map = HashMap::new();
        for id in 0..1024 {
            if let Some(name) = Syscalls::name(id) {
                map.entry(name).or_insert(id as i32);
            }
        }
        map
    });

    map.get(name)
        .copied()
        .ok_or_else(|| DebuggerError::UnknownSyscall(name.to_string()))
}
