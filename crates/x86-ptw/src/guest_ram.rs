//! Shared guest physical memory backing paging structures.
//!
//! RAM is stored as an array of `AtomicU64` words so several emulated cores
//! can walk (and set accessed/dirty bits in) the same tables without a lock.
//! MMIO windows are routed to an [`MmioHandler`]; since those cannot be
//! updated atomically, compare-and-swap and every store on them run inside
//! an exclusive section shared by every user of the memory.
//!
//! Reads that hit neither RAM nor MMIO return all-ones (open bus) and writes
//! to such addresses are dropped.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::trace;

use crate::phys::PageTableMemory;

/// Device window handler. Offsets are relative to the start of the window.
pub trait MmioHandler: Send + Sync {
    fn read(&self, offset: u64, data: &mut [u8]);
    fn write(&self, offset: u64, data: &[u8]);
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuestMemoryError {
    #[error("guest RAM size must be non-zero")]
    EmptyRam,

    #[error("guest RAM size {size:#x} does not fit in host memory")]
    TooLarge { size: u64 },

    #[error("MMIO window {start:#x}..{end:#x} is empty")]
    EmptyWindow { start: u64, end: u64 },

    #[error("MMIO window {start:#x}..{end:#x} overlaps an existing window")]
    Overlap { start: u64, end: u64 },
}

struct MmioRegion {
    range: Range<u64>,
    handler: Arc<dyn MmioHandler>,
}

/// Guest RAM plus MMIO windows, shareable across threads.
pub struct SharedGuestMemory {
    words: Box<[AtomicU64]>,
    size: u64,
    mmio: Vec<MmioRegion>,
    exclusive: Mutex<()>,
}

impl std::fmt::Debug for SharedGuestMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedGuestMemory")
            .field("size", &self.size)
            .field("mmio_windows", &self.mmio.len())
            .finish()
    }
}

impl SharedGuestMemory {
    pub fn new(size: u64) -> Result<Self, GuestMemoryError> {
        if size == 0 {
            return Err(GuestMemoryError::EmptyRam);
        }
        let words =
            usize::try_from(size.div_ceil(8)).map_err(|_| GuestMemoryError::TooLarge { size })?;
        let words = (0..words)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Self {
            words,
            size,
            mmio: Vec::new(),
            exclusive: Mutex::new(()),
        })
    }

    /// RAM size in bytes.
    #[inline]
    pub fn len(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Map an MMIO window. Windows take priority over RAM but may not overlap
    /// each other.
    pub fn register_mmio(
        &mut self,
        range: Range<u64>,
        handler: Arc<dyn MmioHandler>,
    ) -> Result<(), GuestMemoryError> {
        if range.is_empty() {
            return Err(GuestMemoryError::EmptyWindow {
                start: range.start,
                end: range.end,
            });
        }
        if self
            .mmio
            .iter()
            .any(|r| r.range.start < range.end && range.start < r.range.end)
        {
            return Err(GuestMemoryError::Overlap {
                start: range.start,
                end: range.end,
            });
        }
        self.mmio.push(MmioRegion { range, handler });
        Ok(())
    }

    pub fn read_u32(&self, paddr: u64) -> u32 {
        let mut buf = [0u8; 4];
        self.read_bytes(paddr, &mut buf);
        u32::from_le_bytes(buf)
    }

    pub fn read_u64(&self, paddr: u64) -> u64 {
        if let Some(word) = self.ram_word(paddr) {
            return word.load(Ordering::Acquire);
        }
        let mut buf = [0u8; 8];
        self.read_bytes(paddr, &mut buf);
        u64::from_le_bytes(buf)
    }

    pub fn write_u32(&self, paddr: u64, value: u32) {
        self.write_bytes(paddr, &value.to_le_bytes());
    }

    pub fn write_u64(&self, paddr: u64, value: u64) {
        if let Some(word) = self.ram_word(paddr) {
            word.store(value, Ordering::Release);
            return;
        }
        self.write_bytes(paddr, &value.to_le_bytes());
    }

    /// Read `dst.len()` bytes. Each part of the span is served by the window
    /// covering it, or by RAM.
    pub fn read_bytes(&self, paddr: u64, dst: &mut [u8]) {
        let mut done = 0;
        while done < dst.len() {
            let addr = paddr.wrapping_add(done as u64);
            let rest = &mut dst[done..];
            match self.mmio_at(addr) {
                Some((region, offset)) => {
                    let n = window_chunk(region, addr, rest.len());
                    region.handler.read(offset, &mut rest[..n]);
                    done += n;
                }
                None => {
                    rest[0] = self.ram_read_u8(addr).unwrap_or(0xff);
                    done += 1;
                }
            }
        }
    }

    /// Stores that reach an MMIO window run inside the exclusive section, so
    /// they cannot land between the compare and the write of a descriptor
    /// update.
    pub fn write_bytes(&self, paddr: u64, src: &[u8]) {
        if self.overlaps_mmio(paddr, src.len() as u64) {
            let _guard = self.lock_exclusive();
            self.store_bytes(paddr, src);
        } else {
            self.store_bytes(paddr, src);
        }
    }

    /// Unlocked store; callers touching MMIO must hold the exclusive section.
    fn store_bytes(&self, paddr: u64, src: &[u8]) {
        let mut done = 0;
        while done < src.len() {
            let addr = paddr.wrapping_add(done as u64);
            let rest = &src[done..];
            match self.mmio_at(addr) {
                Some((region, offset)) => {
                    let n = window_chunk(region, addr, rest.len());
                    region.handler.write(offset, &rest[..n]);
                    done += n;
                }
                None => {
                    self.ram_write_u8(addr, rest[0]);
                    done += 1;
                }
            }
        }
    }

    fn lock_exclusive(&self) -> MutexGuard<'_, ()> {
        self.exclusive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn mmio_at(&self, paddr: u64) -> Option<(&MmioRegion, u64)> {
        self.mmio
            .iter()
            .find(|r| r.range.contains(&paddr))
            .map(|r| (r, paddr - r.range.start))
    }

    fn overlaps_mmio(&self, paddr: u64, len: u64) -> bool {
        let end = paddr.saturating_add(len);
        self.mmio
            .iter()
            .any(|r| r.range.start < end && paddr < r.range.end)
    }

    /// The RAM word holding `paddr..paddr + 8`, if that span is an aligned
    /// word wholly inside RAM and outside every window.
    #[inline]
    fn ram_word(&self, paddr: u64) -> Option<&AtomicU64> {
        if paddr % 8 != 0 || paddr.checked_add(8)? > self.size || self.overlaps_mmio(paddr, 8) {
            return None;
        }
        self.words.get((paddr / 8) as usize)
    }

    #[inline]
    fn word(&self, paddr: u64) -> Option<&AtomicU64> {
        if paddr >= self.size {
            return None;
        }
        self.words.get((paddr / 8) as usize)
    }

    fn ram_read_u8(&self, paddr: u64) -> Option<u8> {
        let word = self.word(paddr)?;
        let shift = (paddr % 8) * 8;
        Some((word.load(Ordering::Acquire) >> shift) as u8)
    }

    fn ram_write_u8(&self, paddr: u64, value: u8) {
        let Some(word) = self.word(paddr) else {
            return;
        };
        let shift = (paddr % 8) * 8;
        let mask = 0xffu64 << shift;
        // The closure always returns `Some`, so this cannot fail.
        let _ = word.fetch_update(Ordering::AcqRel, Ordering::Acquire, |old| {
            Some((old & !mask) | (u64::from(value) << shift))
        });
    }

    /// Lock-free CAS on one 32-bit lane of a RAM word. A concurrent store to
    /// the other lane does not count as a conflict.
    fn ram_cmpxchg_u32(&self, word: &AtomicU64, lane: u64, current: u32, new: u32) -> bool {
        let shift = lane * 32;
        let mask = 0xffff_ffffu64 << shift;
        let mut observed = word.load(Ordering::Acquire);
        loop {
            if (observed >> shift) as u32 != current {
                return false;
            }
            let replacement = (observed & !mask) | (u64::from(new) << shift);
            match word.compare_exchange_weak(
                observed,
                replacement,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => observed = actual,
            }
        }
    }

    fn exclusive_cmpxchg_u32(&self, paddr: u64, current: u32, new: u32) -> bool {
        let _guard = self.lock_exclusive();
        let observed = self.read_u32(paddr);
        trace!(
            paddr,
            observed,
            current,
            "page-table update via exclusive section"
        );
        if observed != current {
            return false;
        }
        self.store_bytes(paddr, &new.to_le_bytes());
        true
    }
}

/// Bytes of a `len`-byte access at `addr` that fall inside `region`.
#[inline]
fn window_chunk(region: &MmioRegion, addr: u64, len: usize) -> usize {
    usize::try_from(region.range.end - addr).map_or(len, |room| room.min(len))
}

impl PageTableMemory for SharedGuestMemory {
    #[inline]
    fn read_u32(&self, paddr: u64) -> u32 {
        SharedGuestMemory::read_u32(self, paddr)
    }

    #[inline]
    fn read_u64(&self, paddr: u64) -> u64 {
        SharedGuestMemory::read_u64(self, paddr)
    }

    fn cmpxchg_u32(&self, paddr: u64, current: u32, new: u32) -> bool {
        if paddr % 4 == 0 && paddr.saturating_add(4) <= self.size && !self.overlaps_mmio(paddr, 4)
        {
            if let Some(word) = self.word(paddr) {
                return self.ram_cmpxchg_u32(word, (paddr % 8) / 4, current, new);
            }
        }
        self.exclusive_cmpxchg_u32(paddr, current, new)
    }
}
