//! The canonical x86-64 register table.
//!
//! Every register the engine can address is described by a [`RegisterInfo`]:
//! its canonical name, its DWARF register number (or -1 where the DWARF
//! numbering has no slot for it), its width, and its byte offset inside the
//! kernel user area (`libc::user`) that ptrace mirrors per thread.
//!
//! Sub-registers (`eax`, `ax`, `al`, `ah`, …) alias a slice of their parent's
//! bytes, so their offsets point into the same `user_regs_struct` field.

use std::mem::offset_of;

use libc::{user, user_fpregs_struct, user_regs_struct};

use crate::errors::{DebuggerError, Result};

/// Identifies one addressable register.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterId {
    // 64-bit general purpose
    rax, rdx, rcx, rbx, rsi, rdi, rbp, rsp,
    r8, r9, r10, r11, r12, r13, r14, r15,
    rip, eflags, cs, fs, gs, ss, ds, es, fs_base, gs_base, orig_rax,
    // 32-bit views
    eax, edx, ecx, ebx, esi, edi, ebp, esp,
    r8d, r9d, r10d, r11d, r12d, r13d, r14d, r15d,
    // 16-bit views
    ax, dx, cx, bx, si, di, bp, sp,
    r8w, r9w, r10w, r11w, r12w, r13w, r14w, r15w,
    // low byte views
    al, dl, cl, bl, sil, dil, bpl, spl,
    r8b, r9b, r10b, r11b, r12b, r13b, r14b, r15b,
    // high byte views
    ah, dh, ch, bh,
    // x87 / SSE control and state
    fcw, fsw, ftw, fop, frip, frdp, mxcsr, mxcsrmask,
    st0, st1, st2, st3, st4, st5, st6, st7,
    mm0, mm1, mm2, mm3, mm4, mm5, mm6, mm7,
    xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7,
    xmm8, xmm9, xmm10, xmm11, xmm12, xmm13, xmm14, xmm15,
    // debug registers
    dr0, dr1, dr2, dr3, dr4, dr5, dr6, dr7,
}

/// Which part of the user area a register lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterType {
    Gpr,
    SubGpr,
    Fpr,
    Dr,
}

/// How the raw bytes of a register are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterFormat {
    UInt,
    DoubleFloat,
    LongDouble,
    Vector,
}

/// Static description of one register.
#[derive(Debug, Clone, Copy)]
pub struct RegisterInfo {
    pub id: RegisterId,
    pub name: &'static str,
    pub dwarf_id: i32,
    pub size: usize,
    pub offset: usize,
    pub reg_type: RegisterType,
    pub format: RegisterFormat,
}

macro_rules! gpr64 {
    ($name:ident, $dwarf:expr) => {
        RegisterInfo {
            id: RegisterId::$name,
            name: stringify!($name),
            dwarf_id: $dwarf,
            size: 8,
            offset: offset_of!(user, regs) + offset_of!(user_regs_struct, $name),
            reg_type: RegisterType::Gpr,
            format: RegisterFormat::UInt,
        }
    };
}

macro_rules! sub_gpr {
    ($name:ident, $parent:ident, $size:expr) => {
        sub_gpr!($name, $parent, $size, 0)
    };
    ($name:ident, $parent:ident, $size:expr, $byte:expr) => {
        RegisterInfo {
            id: RegisterId::$name,
            name: stringify!($name),
            dwarf_id: -1,
            size: $size,
            offset: offset_of!(user, regs) + offset_of!(user_regs_struct, $parent) + $byte,
            reg_type: RegisterType::SubGpr,
            format: RegisterFormat::UInt,
        }
    };
}

macro_rules! fpr {
    ($name:ident, $dwarf:expr, $size:expr, $field:ident) => {
        RegisterInfo {
            id: RegisterId::$name,
            name: stringify!($name),
            dwarf_id: $dwarf,
            size: $size,
            offset: offset_of!(user, i387) + offset_of!(user_fpregs_struct, $field),
            reg_type: RegisterType::Fpr,
            format: RegisterFormat::UInt,
        }
    };
}

macro_rules! fp_st {
    ($name:ident, $n:expr) => {
        RegisterInfo {
            id: RegisterId::$name,
            name: stringify!($name),
            dwarf_id: 33 + $n,
            size: 16,
            offset: offset_of!(user, i387) + offset_of!(user_fpregs_struct, st_space) + 16 * $n,
            reg_type: RegisterType::Fpr,
            format: RegisterFormat::LongDouble,
        }
    };
}

macro_rules! fp_mm {
    ($name:ident, $n:expr) => {
        RegisterInfo {
            id: RegisterId::$name,
            name: stringify!($name),
            dwarf_id: 41 + $n,
            size: 8,
            offset: offset_of!(user, i387) + offset_of!(user_fpregs_struct, st_space) + 16 * $n,
            reg_type: RegisterType::Fpr,
            format: RegisterFormat::Vector,
        }
    };
}

macro_rules! fp_xmm {
    ($name:ident, $n:expr) => {
        RegisterInfo {
            id: RegisterId::$name,
            name: stringify!($name),
            dwarf_id: 17 + $n,
            size: 16,
            offset: offset_of!(user, i387) + offset_of!(user_fpregs_struct, xmm_space) + 16 * $n,
            reg_type: RegisterType::Fpr,
            format: RegisterFormat::Vector,
        }
    };
}

macro_rules! dr {
    ($name:ident, $n:expr) => {
        RegisterInfo {
            id: RegisterId::$name,
            name: stringify!($name),
            dwarf_id: -1,
            size: 8,
            offset: offset_of!(user, u_debugreg) + 8 * $n,
            reg_type: RegisterType::Dr,
            format: RegisterFormat::UInt,
        }
    };
}

/// Every register the engine knows, in user-area order.
pub static REGISTER_INFOS: &[RegisterInfo] = &[
    gpr64!(rax, 0),
    gpr64!(rdx, 1),
    gpr64!(rcx, 2),
    gpr64!(rbx, 3),
    gpr64!(rsi, 4),
    gpr64!(rdi, 5),
    gpr64!(rbp, 6),
    gpr64!(rsp, 7),
    gpr64!(r8, 8),
    gpr64!(r9, 9),
    gpr64!(r10, 10),
    gpr64!(r11, 11),
    gpr64!(r12, 12),
    gpr64!(r13, 13),
    gpr64!(r14, 14),
    gpr64!(r15, 15),
    gpr64!(rip, 16),
    gpr64!(eflags, 49),
    gpr64!(es, 50),
    gpr64!(cs, 51),
    gpr64!(ss, 52),
    gpr64!(ds, 53),
    gpr64!(fs, 54),
    gpr64!(gs, 55),
    gpr64!(fs_base, 58),
    gpr64!(gs_base, 59),
    gpr64!(orig_rax, -1),
    sub_gpr!(eax, rax, 4),
    sub_gpr!(edx, rdx, 4),
    sub_gpr!(ecx, rcx, 4),
    sub_gpr!(ebx, rbx, 4),
    sub_gpr!(esi, rsi, 4),
    sub_gpr!(edi, rdi, 4),
    sub_gpr!(ebp, rbp, 4),
    sub_gpr!(esp, rsp, 4),
    sub_gpr!(r8d, r8, 4),
    sub_gpr!(r9d, r9, 4),
    sub_gpr!(r10d, r10, 4),
    sub_gpr!(r11d, r11, 4),
    sub_gpr!(r12d, r12, 4),
    sub_gpr!(r13d, r13, 4),
    sub_gpr!(r14d, r14, 4),
    sub_gpr!(r15d, r15, 4),
    sub_gpr!(ax, rax, 2),
    sub_gpr!(dx, rdx, 2),
    sub_gpr!(cx, rcx, 2),
    sub_gpr!(bx, rbx, 2),
    sub_gpr!(si, rsi, 2),
    sub_gpr!(di, rdi, 2),
    sub_gpr!(bp, rbp, 2),
    sub_gpr!(sp, rsp, 2),
    sub_gpr!(r8w, r8, 2),
    sub_gpr!(r9w, r9, 2),
    sub_gpr!(r10w, r10, 2),
    sub_gpr!(r11w, r11, 2),
    sub_gpr!(r12w, r12, 2),
    sub_gpr!(r13w, r13, 2),
    sub_gpr!(r14w, r14, 2),
    sub_gpr!(r15w, r15, 2),
    sub_gpr!(al, rax, 1),
    sub_gpr!(dl, rdx, 1),
    sub_gpr!(cl, rcx, 1),
    sub_gpr!(bl, rbx, 1),
    sub_gpr!(sil, rsi, 1),
    sub_gpr!(dil, rdi, 1),
    sub_gpr!(bpl, rbp, 1),
    sub_gpr!(spl, rsp, 1),
    sub_gpr!(r8b, r8, 1),
    sub_gpr!(r9b, r9, 1),
    sub_gpr!(r10b, r10, 1),
    sub_gpr!(r11b, r11, 1),
    sub_gpr!(r12b, r12, 1),
    sub_gpr!(r13b, r13, 1),
    sub_gpr!(r14b, r14, 1),
    sub_gpr!(r15b, r15, 1),
    sub_gpr!(ah, rax, 1, 1),
    sub_gpr!(dh, rdx, 1, 1),
    sub_gpr!(ch, rcx, 1, 1),
    sub_gpr!(bh, rbx, 1, 1),
    fpr!(fcw, 65, 2, cwd),
    fpr!(fsw, 66, 2, swd),
    fpr!(ftw, -1, 2, ftw),
    fpr!(fop, -1, 2, fop),
    fpr!(frip, -1, 8, rip),
    fpr!(frdp, -1, 8, rdp),
    fpr!(mxcsr, 64, 4, mxcsr),
    fpr!(mxcsrmask, -1, 4, mxcr_mask),
    fp_st!(st0, 0),
    fp_st!(st1, 1),
    fp_st!(st2, 2),
    fp_st!(st3, 3),
    fp_st!(st4, 4),
    fp_st!(st5, 5),
    fp_st!(st6, 6),
    fp_st!(st7, 7),
    fp_mm!(mm0, 0),
    fp_mm!(mm1, 1),
    fp_mm!(mm2, 2),
    fp_mm!(mm3, 3),
    fp_mm!(mm4, 4),
    fp_mm!(mm5, 5),
    fp_mm!(mm6, 6),
    fp_mm!(mm7, 7),
    fp_xmm!(xmm0, 0),
    fp_xmm!(xmm1, 1),
    fp_xmm!(xmm2, 2),
    fp_xmm!(xmm3, 3),
    fp_xmm!(xmm4, 4),
    fp_xmm!(xmm5, 5),
    fp_xmm!(xmm6, 6),
    fp_xmm!(xmm7, 7),
    fp_xmm!(xmm8, 8),
    fp_xmm!(xmm9, 9),
    fp_xmm!(xmm10, 10),
    fp_xmm!(xmm11, 11),
    fp_xmm!(xmm12, 12),
    fp_xmm!(xmm13, 13),
    fp_xmm!(xmm14, 14),
    fp_xmm!(xmm15, 15),
    dr!(dr0, 0),
    dr!(dr1, 1),
    dr!(dr2, 2),
    dr!(dr3, 3),
    dr!(dr4, 4),
    dr!(dr5, 5),
    dr!(dr6, 6),
    dr!(dr7, 7),
];

/// The four addressable hardware debug registers, slot order.
pub const DEBUG_REGISTER_IDS: [RegisterId; 4] = [
    RegisterId::dr0,
    RegisterId::dr1,
    RegisterId::dr2,
    RegisterId::dr3,
];

/// Looks up the table entry for `id`.
pub fn register_info_by_id(id: RegisterId) -> &'static RegisterInfo {
    REGISTER_INFOS
        .iter()
        .find(|info| info.id == id)
        .expect("the register table covers every RegisterId")
}

/// Looks up a register by its canonical name.
pub fn register_info_by_name(name: &str) -> Result<&'static RegisterInfo> {
    REGISTER_INFOS
        .iter()
        .find(|info| info.name == name)
        .ok_or_else(|| DebuggerError::UnknownRegister(name.to_string()))
}

/// Looks up a register by its DWARF register number.
pub fn register_info_by_dwarf(dwarf_id: i32) -> Result<&'static RegisterInfo> {
    REGISTER_INFOS
        .iter()
        .find(|info| info.dwarf_id == dwarf_id && info.dwarf_id != -1)
        .ok_or_else(|| DebuggerError::UnknownRegister(format!("dwarf register {dwarf_id}")))
}
