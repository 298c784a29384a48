//! Physical memory capability used for page-table walking.

use std::sync::Arc;

/// Shared physical memory holding paging structures.
///
/// Unlike a device bus, this is deliberately narrow: the walker only ever
/// reads descriptors and commits status bits with a compare-and-swap on the
/// low 32 bits. Accessed and dirty both live below bit 32 in every supported
/// descriptor format, so a 32-bit CAS is enough for 64-bit entries too.
///
/// Implementations must be usable from several emulated cores at once; the
/// CAS is the only synchronization point between overlapping walks.
pub trait PageTableMemory {
    fn read_u32(&self, paddr: u64) -> u32;
    fn read_u64(&self, paddr: u64) -> u64;

    /// Atomically replace the 32-bit value at `paddr` with `new` if it still
    /// equals `current`. Returns whether the store happened.
    ///
    /// Backends that cannot address the location directly (MMIO-style
    /// windows) must perform the read-compare-write inside a globally
    /// exclusive section instead.
    fn cmpxchg_u32(&self, paddr: u64, current: u32, new: u32) -> bool;
}

impl<T: PageTableMemory + ?Sized> PageTableMemory for &T {
    #[inline]
    fn read_u32(&self, paddr: u64) -> u32 {
        <T as PageTableMemory>::read_u32(&**self, paddr)
    }

    #[inline]
    fn read_u64(&self, paddr: u64) -> u64 {
        <T as PageTableMemory>::read_u64(&**self, paddr)
    }

    #[inline]
    fn cmpxchg_u32(&self, paddr: u64, current: u32, new: u32) -> bool {
        <T as PageTableMemory>::cmpxchg_u32(&**self, paddr, current, new)
    }
}

impl<T: PageTableMemory + ?Sized> PageTableMemory for Arc<T> {
    #[inline]
    fn read_u32(&self, paddr: u64) -> u32 {
        <T as PageTableMemory>::read_u32(&**self, paddr)
    }

    #[inline]
    fn read_u64(&self, paddr: u64) -> u64 {
        <T as PageTableMemory>::read_u64(&**self, paddr)
    }

    #[inline]
    fn cmpxchg_u32(&self, paddr: u64, current: u32, new: u32) -> bool {
        <T as PageTableMemory>::cmpxchg_u32(&**self, paddr, current, new)
    }
}

/// Width of a paging-structure entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DescriptorSize {
    /// Legacy 32-bit paging.
    Four,
    /// PAE and long mode.
    Eight,
}

impl DescriptorSize {
    #[inline]
    pub(crate) fn bytes(self) -> u64 {
        match self {
            DescriptorSize::Four => 4,
            DescriptorSize::Eight => 8,
        }
    }
}
