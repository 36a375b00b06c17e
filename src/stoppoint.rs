//! Generic storage for stop-points (breakpoint sites and watchpoints).
//!
//! A [`StoppointCollection`] keeps its members ordered by creation, hands out
//! monotonically increasing ids that are never reused, and answers the id-
//! and address-keyed queries the engine needs. One collection holds at most
//! one member per address; inserting at an occupied address yields the
//! existing member.

use serde::Serialize;

use crate::addr::VirtAddr;
use crate::errors::{DebuggerError, Result};
use crate::registers::Registers;

/// What kind of access trips a hardware stop-point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StoppointMode {
    Write,
    ReadWrite,
    Execute,
}

/// Common surface of breakpoint sites and watchpoints.
pub trait Stoppoint {
    fn id(&self) -> i32;
    fn address(&self) -> VirtAddr;
    fn is_enabled(&self) -> bool;

    /// Disables the stop-point, releasing whatever it holds in the tracee
    /// (patched byte or hardware debug register).
    fn disable(&mut self, regs: &mut Registers) -> Result<()>;

    fn at_address(&self, addr: VirtAddr) -> bool {
        self.address() == addr
    }

    fn in_range(&self, low: VirtAddr, high: VirtAddr) -> bool {
        low <= self.address() && self.address() < high
    }
}

/// Ordered, id- and address-keyed storage for one kind of stop-point.
pub struct StoppointCollection<T: Stoppoint> {
    stoppoints: Vec<T>,
    next_id: i32,
}

impl<T: Stoppoint> Default for StoppointCollection<T> {
    fn default() -> Self {
        StoppointCollection {
            stoppoints: Vec::new(),
            next_id: 0,
        }
    }
}

impl<T: Stoppoint> StoppointCollection<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the next id. Ids are stable for the life of the debugger and
    /// never reused, even after removal.
    pub(crate) fn claim_id(&mut self) -> i32 {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn push(&mut self, stoppoint: T) -> &mut T {
        self.stoppoints.push(stoppoint);
        self.stoppoints.last_mut().expect("just pushed")
    }

    pub fn get_by_id(&self, id: i32) -> Option<&T> {
        self.stoppoints.iter().find(|point| point.id() == id)
    }

    pub fn get_by_id_mut(&mut self, id: i32) -> Option<&mut T> {
        self.stoppoints.iter_mut().find(|point| point.id() == id)
    }

    pub fn get_by_address(&self, addr: VirtAddr) -> Option<&T> {
        self.stoppoints.iter().find(|point| point.at_address(addr))
    }

    pub fn get_by_address_mut(&mut self, addr: VirtAddr) -> Option<&mut T> {
        self.stoppoints
            .iter_mut()
            .find(|point| point.at_address(addr))
    }

    pub fn contains_id(&self, id: i32) -> bool {
        self.get_by_id(id).is_some()
    }

    pub fn contains_address(&self, addr: VirtAddr) -> bool {
        self.get_by_address(addr).is_some()
    }

    pub fn enabled_stoppoint_at_address(&self, addr: VirtAddr) -> bool {
        self.get_by_address(addr).is_some_and(|p| p.is_enabled())
    }

    /// All members whose address falls into `[low, high)`.
    pub fn get_in_region(&self, low: VirtAddr, high: VirtAddr) -> impl Iterator<Item = &T> {
        self.stoppoints
            .iter()
            .filter(move |point| point.in_range(low, high))
    }

    /// Disables and drops the member with the given id.
    pub fn remove_by_id(&mut self, id: i32, regs: &mut Registers) -> Result<()> {
        let index = self
            .stoppoints
            .iter()
            .position(|point| point.id() == id)
            .ok_or(DebuggerError::UnknownStoppoint(id))?;
        self.stoppoints[index].disable(regs)?;
        self.stoppoints.remove(index);
        Ok(())
    }

    /// Disables and drops the member at the given address.
    pub fn remove_by_address(&mut self, addr: VirtAddr, regs: &mut Registers) -> Result<()> {
        match self.stoppoints.iter().position(|point| point.at_address(addr)) {
            Some(index) => {
                self.stoppoints[index].disable(regs)?;
                self.stoppoints.remove(index);
                Ok(())
            }
            None => Err(DebuggerError::UnknownStoppoint(-1)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.stoppoints.iter()
    }

    pub fn len(&self) -> usize {
        self.stoppoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stoppoints.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Dummy {
        id: i32,
        addr: VirtAddr,
        enabled: bool,
    }

    impl Stoppoint for Dummy {
        fn id(&self) -> i32 {
            self.id
        }
        fn address(&self) -> VirtAddr {
            self.addr
        }
        fn is_enabled(&self) -> bool {
            self.enabled
        }
        fn disable(&mut self, _regs: &mut Registers) -> Result<()> {
            self.enabled = false;
            Ok(())
        }
    }

    fn collection_with(addrs: &[u64]) -> StoppointCollection<Dummy> {
        let mut collection = StoppointCollection::new();
        for &addr in addrs {
            let id = collection.claim_id();
            collection.push(Dummy {
                id,
                addr: VirtAddr::new(addr),
                enabled: true,
            });
        }
        collection
    }

    #[test]
    fn test_ids_increase_and_are_not_reused() {
        let mut collection = collection_with(&[0x1000, 0x2000]);
        let mut regs = Registers::new();
        collection.remove_by_id(2, &mut regs).unwrap();
        let next = collection.claim_id();
        assert_eq!(next, 3);
    }

    #[test]
    fn test_queries() {
        let collection = collection_with(&[0x1000, 0x2000, 0x3000]);
        assert!(collection.contains_address(VirtAddr::new(0x2000)));
        assert!(!collection.contains_address(VirtAddr::new(0x2001)));
        assert!(collection.contains_id(3));
        assert_eq!(collection.get_by_address(VirtAddr::new(0x3000)).unwrap().id(), 3);
        assert_eq!(
            collection
                .get_in_region(VirtAddr::new(0x1800), VirtAddr::new(0x3000))
                .count(),
            1
        );
        assert_eq!(collection.len(), 3);
    }

    #[test]
    fn test_remove_disables_first() {
        let mut collection = collection_with(&[0x1000]);
        let mut regs = Registers::new();
        collection
            .remove_by_address(VirtAddr::new(0x1000), &mut regs)
            .unwrap();
        assert!(collection.is_empty());
        assert!(matches!(
            collection.remove_by_id(1, &mut regs),
            Err(DebuggerError::UnknownStoppoint(1))
        ));
    }
}
