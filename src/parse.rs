//! Literal parsing helpers for debugger front-ends.
//!
//! Command lines hand the engine addresses as hex literals, register values
//! as integers or floats, and vector register contents as bracketed byte
//! lists. These helpers turn those spellings into values, reporting malformed
//! input as [`DebuggerError::ParseStr`].

use crate::errors::{DebuggerError, Result};

/// Integer types parseable from a radix-prefixed literal.
pub trait Integral: Sized {
    fn from_str_radix(text: &str, radix: u32) -> std::result::Result<Self, std::num::ParseIntError>;
}

macro_rules! impl_integral {
    ($($t:ty),*) => {
        $(impl Integral for $t {
            fn from_str_radix(text: &str, radix: u32) -> std::result::Result<Self, std::num::ParseIntError> {
                <$t>::from_str_radix(text, radix)
            }
        })*
    };
}

impl_integral!(u8, u16, u32, u64, usize, i8, i16, i32, i64);

/// Parses an integer literal in the given radix.
///
/// Hex literals may carry a `0x` prefix.
pub fn to_integral<T: Integral>(text: &str, radix: u32) -> Result<T> {
    let digits = if radix == 16 {
        text.strip_prefix("0x").unwrap_or(text)
    } else {
        text
    };
    T::from_str_radix(digits, radix)
        .map_err(|_| DebuggerError::ParseStr(format!("invalid integer literal: {text}")))
}

/// Parses a float literal.
pub fn to_float(text: &str) -> Result<f64> {
    text.parse::<f64>()
        .map_err(|_| DebuggerError::ParseStr(format!("invalid float literal: {text}")))
}

/// Parses a fixed-width byte-vector literal of the form `[0xAA,0xBB,…]`.
///
/// Exactly `N` elements must be present; each element is a hex byte.
pub fn parse_vector<const N: usize>(text: &str) -> Result<[u8; N]> {
    let invalid = || DebuggerError::ParseStr(format!("invalid vector literal: {text}"));

    let inner = text
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .ok_or_else(invalid)?;

    let mut bytes = [0u8; N];
    let mut elements = inner.split(',');
    for slot in bytes.iter_mut() {
        let element = elements.next().ok_or_else(invalid)?.trim();
        *slot = to_integral::<u8>(element, 16).map_err(|_| invalid())?;
    }
    if elements.next().is_some() {
        return Err(invalid());
    }

    Ok(bytes)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_integral_literals() {
        assert_eq!(to_integral::<u64>("0xcafe", 16).unwrap(), 0xcafe);
        assert_eq!(to_integral::<u64>("cafe", 16).unwrap(), 0xcafe);
        assert_eq!(to_integral::<i32>("-42", 10).unwrap(), -42);
        assert!(to_integral::<u64>("0xstone", 16).is_err());
        assert!(to_integral::<u8>("256", 10).is_err());
    }

    #[test]
    fn test_float_literals() {
        assert_eq!(to_float("42.24").unwrap(), 42.24);
        assert!(to_float("fourty-two").is_err());
    }

    #[test]
    fn test_vector_literals() {
        assert_eq!(
            parse_vector::<8>("[0xff,0x00,0x11,0x22,0x33,0x44,0x55,0x66]").unwrap(),
            [0xff, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66]
        );
        assert!(parse_vector::<8>("[0xff]").is_err());
        assert!(parse_vector::<2>("[0xff,0x00,0x11]").is_err());
        assert!(parse_vector::<2>("0xff,0x00").is_err());
    }
}
