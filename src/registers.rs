//! The register file: a typed view over the kernel user area.
//!
//! [`Registers`] mirrors the per-thread `libc::user` block. Reads interpret
//! the mirrored bytes according to the register's format; writes splice a
//! widened value into the mirror. Flushing the mirror back into the kernel is
//! the process engine's job ([`crate::process::Process::write_register`]),
//! since only it knows whether to go through the floating-point set-registers
//! call or an aligned user-area poke.

use libc::{user, user_fpregs_struct, user_regs_struct};

use crate::errors::{DebuggerError, Result};
use crate::register_info::{register_info_by_id, RegisterFormat, RegisterId, RegisterInfo};

/// A value read from or destined for a register.
///
/// The 80-bit x87 format has no native Rust type; it travels as its raw ten
/// bytes ([`RegisterValue::F80`]).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RegisterValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    F80([u8; 10]),
    Byte64([u8; 8]),
    Byte128([u8; 16]),
}

impl RegisterValue {
    /// The natural width of the value in bytes.
    pub fn size(&self) -> usize {
        match self {
            RegisterValue::U8(_) | RegisterValue::I8(_) => 1,
            RegisterValue::U16(_) | RegisterValue::I16(_) => 2,
            RegisterValue::U32(_) | RegisterValue::I32(_) | RegisterValue::F32(_) => 4,
            RegisterValue::U64(_)
            | RegisterValue::I64(_)
            | RegisterValue::F64(_)
            | RegisterValue::Byte64(_) => 8,
            RegisterValue::F80(_) => 10,
            RegisterValue::Byte128(_) => 16,
        }
    }

    /// Widens the value to a 16-byte little-endian image suitable for
    /// splicing into the user area.
    ///
    /// Unsigned values zero-extend, signed values sign-extend, floats cast
    /// into the register's floating format. Everything else is its raw
    /// little-endian bytes, zero-padded.
    fn widen(&self, info: &RegisterInfo) -> [u8; 16] {
        use RegisterValue::*;

        let mut out = [0u8; 16];
        match (*self, info.format) {
            (F32(v), RegisterFormat::DoubleFloat) => {
                out[..8].copy_from_slice(&(v as f64).to_le_bytes());
            }
            (F32(v), RegisterFormat::LongDouble) => {
                out[..10].copy_from_slice(&f64_to_f80(v as f64));
            }
            (F64(v), RegisterFormat::LongDouble) => {
                out[..10].copy_from_slice(&f64_to_f80(v));
            }
            (I8(v), RegisterFormat::UInt) => sign_extend(&mut out, v as i64),
            (I16(v), RegisterFormat::UInt) => sign_extend(&mut out, v as i64),
            (I32(v), RegisterFormat::UInt) => sign_extend(&mut out, v as i64),
            (I64(v), RegisterFormat::UInt) => sign_extend(&mut out, v),
            _ => {
                let bytes = self.to_le_bytes();
                out[..bytes.len()].copy_from_slice(&bytes);
            }
        }
        out
    }

    fn to_le_bytes(self) -> Vec<u8> {
        match self {
            RegisterValue::U8(v) => v.to_le_bytes().to_vec(),
            RegisterValue::U16(v) => v.to_le_bytes().to_vec(),
            RegisterValue::U32(v) => v.to_le_bytes().to_vec(),
            RegisterValue::U64(v) => v.to_le_bytes().to_vec(),
            RegisterValue::I8(v) => v.to_le_bytes().to_vec(),
            RegisterValue::I16(v) => v.to_le_bytes().to_vec(),
            RegisterValue::I32(v) => v.to_le_bytes().to_vec(),
            RegisterValue::I64(v) => v.to_le_bytes().to_vec(),
            RegisterValue::F32(v) => v.to_le_bytes().to_vec(),
            RegisterValue::F64(v) => v.to_le_bytes().to_vec(),
            RegisterValue::F80(v) => v.to_vec(),
            RegisterValue::Byte64(v) => v.to_vec(),
            RegisterValue::Byte128(v) => v.to_vec(),
        }
    }
}

fn sign_extend(out: &mut [u8; 16], value: i64) {
    out[..8].copy_from_slice(&value.to_le_bytes());
    if value < 0 {
        out[8..].fill(0xff);
    }
}

macro_rules! impl_value_conversions {
    ($($variant:ident => $t:ty),*) => {
        $(
            impl From<$t> for RegisterValue {
                fn from(value: $t) -> Self {
                    RegisterValue::$variant(value)
                }
            }

            impl TryFrom<RegisterValue> for $t {
                type Error = DebuggerError;
                fn try_from(value: RegisterValue) -> Result<Self> {
                    match value {
                        RegisterValue::$variant(v) => Ok(v),
                        _ => Err(DebuggerError::RegisterValueType),
                    }
                }
            }
        )*
    };
}

impl_value_conversions!(
    U8 => u8, U16 => u16, U32 => u32, U64 => u64,
    I8 => i8, I16 => i16, I32 => i32, I64 => i64,
    F32 => f32, F64 => f64,
    Byte64 => [u8; 8], Byte128 => [u8; 16]
);

/// The user-area mirror for one tracee.
pub struct Registers {
    data: user,
}

impl Registers {
    pub(crate) fn new() -> Self {
        // A freshly attached tracee gets its mirror filled by the first stop.
        Registers {
            data: unsafe { std::mem::zeroed() },
        }
    }

    fn as_bytes(&self) -> &[u8] {
        // The user block is plain old data; viewing it as bytes is the whole
        // point of the offset table.
        unsafe {
            std::slice::from_raw_parts(
                &self.data as *const user as *const u8,
                std::mem::size_of::<user>(),
            )
        }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(
                &mut self.data as *mut user as *mut u8,
                std::mem::size_of::<user>(),
            )
        }
    }

    /// Interprets the mirrored bytes of `info` according to its format.
    pub fn read(&self, info: &RegisterInfo) -> RegisterValue {
        let bytes = &self.as_bytes()[info.offset..];

        match info.format {
            RegisterFormat::UInt => match info.size {
                1 => RegisterValue::U8(bytes[0]),
                2 => RegisterValue::U16(u16::from_le_bytes(bytes[..2].try_into().unwrap())),
                4 => RegisterValue::U32(u32::from_le_bytes(bytes[..4].try_into().unwrap())),
                8 => RegisterValue::U64(u64::from_le_bytes(bytes[..8].try_into().unwrap())),
                other => unreachable!("no uint register is {other} bytes wide"),
            },
            RegisterFormat::DoubleFloat => {
                RegisterValue::F64(f64::from_le_bytes(bytes[..8].try_into().unwrap()))
            }
            RegisterFormat::LongDouble => RegisterValue::F80(bytes[..10].try_into().unwrap()),
            RegisterFormat::Vector if info.size == 8 => {
                RegisterValue::Byte64(bytes[..8].try_into().unwrap())
            }
            RegisterFormat::Vector => RegisterValue::Byte128(bytes[..16].try_into().unwrap()),
        }
    }

    /// Reads by canonical register identifier.
    pub fn read_by_id(&self, id: RegisterId) -> RegisterValue {
        self.read(register_info_by_id(id))
    }

    /// Reads by identifier and converts into the requested representation.
    pub fn read_by_id_as<T>(&self, id: RegisterId) -> Result<T>
    where
        T: TryFrom<RegisterValue, Error = DebuggerError>,
    {
        T::try_from(self.read_by_id(id))
    }

    /// Splices `value` into the mirror at `info`.
    ///
    /// A value naturally wider than the register is a caller error; the
    /// kernel-facing flush happens in the process engine.
    pub fn write(&mut self, info: &RegisterInfo, value: RegisterValue) -> Result<()> {
        if value.size() > info.size {
            return Err(DebuggerError::RegisterValueTooLarge {
                register: info.name,
                register_size: info.size,
                value_size: value.size(),
            });
        }

        let wide = value.widen(info);
        let offset = info.offset;
        self.as_bytes_mut()[offset..offset + info.size].copy_from_slice(&wide[..info.size]);
        Ok(())
    }

    /// An aligned 8-byte window of the mirror, as the user-area poke wants it.
    pub(crate) fn aligned_word_at(&self, offset: usize) -> (usize, u64) {
        let aligned = offset & !0b111;
        let bytes = &self.as_bytes()[aligned..aligned + 8];
        (aligned, u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub(crate) fn gprs(&self) -> &user_regs_struct {
        &self.data.regs
    }

    pub(crate) fn gprs_mut(&mut self) -> &mut user_regs_struct {
        &mut self.data.regs
    }

    pub(crate) fn fprs(&self) -> &user_fpregs_struct {
        &self.data.i387
    }

    pub(crate) fn fprs_mut(&mut self) -> &mut user_fpregs_struct {
        &mut self.data.i387
    }

    pub(crate) fn debug_register(&self, index: usize) -> u64 {
        self.data.u_debugreg[index]
    }

    pub(crate) fn set_debug_register(&mut self, index: usize, value: u64) {
        self.data.u_debugreg[index] = value;
    }
}

/// Converts an `f64` into the 80-bit x87 extended format.
pub fn f64_to_f80(value: f64) -> [u8; 10] {
    let bits = value.to_bits();
    let sign = ((bits >> 63) & 1) as u16;
    let exp = ((bits >> 52) & 0x7ff) as u16;
    let frac = bits & 0x000f_ffff_ffff_ffff;

    let (ext_exp, mantissa) = if exp == 0x7ff {
        // infinity and NaN keep the explicit integer bit set
        (0x7fff, (1u64 << 63) | (frac << 11))
    } else if exp != 0 {
        (exp + 16383 - 1023, (1u64 << 63) | (frac << 11))
    } else if frac == 0 {
        (0, 0)
    } else {
        // subnormal doubles normalize in the wider exponent range
        let shift = frac.leading_zeros();
        (15372 - shift as u16, frac << shift)
    };

    let mut out = [0u8; 10];
    out[..8].copy_from_slice(&mantissa.to_le_bytes());
    out[8..].copy_from_slice(&((sign << 15) | ext_exp).to_le_bytes());
    out
}

/// Converts an 80-bit x87 extended value back to `f64`, rounding to nearest.
pub fn f80_to_f64(bytes: [u8; 10]) -> f64 {
    let mantissa = u64::from_le_bytes(bytes[..8].try_into().unwrap());
    let sign_exp = u16::from_le_bytes(bytes[8..].try_into().unwrap());
    let sign = u64::from(sign_exp >> 15);
    let ext_exp = i64::from(sign_exp & 0x7fff);

    if ext_exp == 0 && mantissa == 0 {
        return f64::from_bits(sign << 63);
    }
    if ext_exp == 0x7fff {
        let frac = if mantissa << 1 == 0 { 0 } else { 1u64 << 51 };
        return f64::from_bits((sign << 63) | (0x7ffu64 << 52) | frac);
    }

    let exp = ext_exp - 16383 + 1023;
    if exp >= 0x7ff {
        return f64::from_bits((sign << 63) | (0x7ffu64 << 52));
    }
    if exp <= 0 {
        // lands in the double's subnormal range
        let shift = 12 - exp;
        if shift >= 64 {
            return f64::from_bits(sign << 63);
        }
        return f64::from_bits((sign << 63) | (mantissa >> shift));
    }

    // drop the explicit integer bit, keep the top 52 fraction bits
    let frac = (mantissa << 1) >> 12;
    f64::from_bits((sign << 63) | ((exp as u64) << 52) | frac)
}
