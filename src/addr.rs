//! # Address Types
//!
//! Two distinct address spaces flow through the engine: [`FileAddr`]
//! identifies a byte inside a particular ELF image, [`VirtAddr`] a byte in
//! the tracee's memory. Keeping them as separate types prevents accidental
//! cross-space arithmetic; converting between them goes through the image's
//! load bias and only succeeds inside a loaded section.

use std::fmt::Display;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::rc::Rc;

use serde::Serialize;

use crate::elf::Elf;

/// A runtime address in the tracee's virtual address space.
#[derive(Hash, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct VirtAddr(u64);

impl VirtAddr {
    /// The null address, also produced by failed conversions.
    pub const NULL: VirtAddr = VirtAddr(0);

    pub fn new(addr: u64) -> Self {
        VirtAddr(addr)
    }

    pub fn addr(&self) -> u64 {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// The raw pointer form ptrace wants for tracee addresses.
    pub fn as_ptr(&self) -> *mut std::ffi::c_void {
        self.0 as *mut std::ffi::c_void
    }

    /// Converts into the file address space of `elf`.
    ///
    /// Returns `None` when the address does not fall into any loaded section
    /// of the image.
    pub fn to_file_addr(&self, elf: &Rc<Elf>) -> Option<FileAddr> {
        elf.section_containing_virt_addr(*self)?;
        Some(FileAddr::new(elf, self.0 - elf.load_bias().addr()))
    }
}

impl Display for VirtAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl std::fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl From<u64> for VirtAddr {
    fn from(value: u64) -> Self {
        VirtAddr(value)
    }
}

impl From<VirtAddr> for u64 {
    fn from(value: VirtAddr) -> Self {
        value.0
    }
}

impl Add<u64> for VirtAddr {
    type Output = Self;
    fn add(self, rhs: u64) -> Self::Output {
        VirtAddr(self.0 + rhs)
    }
}

impl Add<usize> for VirtAddr {
    type Output = Self;
    fn add(self, rhs: usize) -> Self::Output {
        VirtAddr(self.0 + rhs as u64)
    }
}

impl Sub<u64> for VirtAddr {
    type Output = Self;
    fn sub(self, rhs: u64) -> Self::Output {
        VirtAddr(self.0 - rhs)
    }
}

impl Sub for VirtAddr {
    type Output = u64;
    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}

impl AddAssign<u64> for VirtAddr {
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl SubAssign<u64> for VirtAddr {
    fn sub_assign(&mut self, rhs: u64) {
        self.0 -= rhs;
    }
}

/// An offset into a specific ELF image.
///
/// Carries the image it belongs to; comparisons against addresses of a
/// different image are not defined (`PartialOrd` yields `None`).
#[derive(Clone)]
pub struct FileAddr {
    elf: Rc<Elf>,
    addr: u64,
}

impl FileAddr {
    pub fn new(elf: &Rc<Elf>, addr: u64) -> Self {
        FileAddr {
            elf: Rc::clone(elf),
            addr,
        }
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn elf(&self) -> &Rc<Elf> {
        &self.elf
    }

    /// Converts into the tracee's address space.
    ///
    /// Yields [`VirtAddr::NULL`] when the address lies outside every loaded
    /// section of the image.
    pub fn to_virt_addr(&self) -> VirtAddr {
        if self.elf.section_containing_file_addr(self).is_none() {
            return VirtAddr::NULL;
        }
        VirtAddr(self.addr + self.elf.load_bias().addr())
    }
}

impl PartialEq for FileAddr {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.elf, &other.elf) && self.addr == other.addr
    }
}

impl Eq for FileAddr {}

impl PartialOrd for FileAddr {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        if !Rc::ptr_eq(&self.elf, &other.elf) {
            return None;
        }
        self.addr.partial_cmp(&other.addr)
    }
}

impl Add<u64> for FileAddr {
    type Output = Self;
    fn add(self, rhs: u64) -> Self::Output {
        FileAddr {
            elf: self.elf,
            addr: self.addr + rhs,
        }
    }
}

impl Sub<u64> for FileAddr {
    type Output = Self;
    fn sub(self, rhs: u64) -> Self::Output {
        FileAddr {
            elf: self.elf,
            addr: self.addr - rhs,
        }
    }
}

impl Display for FileAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.addr)
    }
}

impl std::fmt::Debug for FileAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x} in {}", self.addr, self.elf.path().display())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_virt_addr_arithmetic() {
        let a = VirtAddr::new(100);
        assert_eq!((a + 50u64).addr(), 150);
        assert_eq!((a - 50u64).addr(), 50);
        assert_eq!(a + 50u64 - a, 50);
    }

    #[test]
    fn test_virt_addr_display() {
        let a = VirtAddr::new(0x1234);
        assert_eq!(format!("{a}"), "0x0000000000001234");
        assert!(!a.is_null());
        assert!(VirtAddr::NULL.is_null());
    }

    #[test]
    fn test_virt_addr_ordering() {
        assert!(VirtAddr::new(1) < VirtAddr::new(2));
        assert!(VirtAddr::new(2) >= VirtAddr::new(2));
    }
}
