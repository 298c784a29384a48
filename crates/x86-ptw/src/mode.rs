//! Paging mode selection from a control-register snapshot.

use bitflags::bitflags;

use crate::regs::*;

bitflags! {
    /// Paging features that influence a walk.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PagingFlags: u32 {
        const PAE = 1 << 0;
        const LMA = 1 << 1;
        const NXE = 1 << 2;
        const PSE = 1 << 3;
        const LA57 = 1 << 4;
        const WP = 1 << 16;
        const PKE = 1 << 17;
        const PKS = 1 << 18;
        const SMEP = 1 << 19;
        const SMAP = 1 << 20;
    }
}

impl PagingFlags {
    /// Flags that affect the descriptor format. Nested (stage-2) tables only
    /// honour these; the stage-2 walk is always a user-mode walk.
    pub const FORMAT: Self = Self::PAE
        .union(Self::LMA)
        .union(Self::NXE)
        .union(Self::PSE)
        .union(Self::LA57);

    fn from_regs(cr0: u64, cr4: u64, efer: u64) -> Self {
        let mut flags = PagingFlags::empty();
        if cr0 & CR0_WP != 0 {
            flags |= PagingFlags::WP;
        }
        if cr4 & CR4_PAE != 0 {
            flags |= PagingFlags::PAE;
            if efer & EFER_NXE != 0 {
                flags |= PagingFlags::NXE;
            }
        }
        if cr4 & CR4_PSE != 0 {
            flags |= PagingFlags::PSE;
        }
        if cr4 & CR4_SMEP != 0 {
            flags |= PagingFlags::SMEP;
        }
        if cr4 & CR4_SMAP != 0 {
            flags |= PagingFlags::SMAP;
        }
        if efer & EFER_LMA != 0 {
            flags |= PagingFlags::LMA;
            if cr4 & CR4_PKE != 0 {
                flags |= PagingFlags::PKE;
            }
            if cr4 & CR4_PKS != 0 {
                flags |= PagingFlags::PKS;
            }
            if cr4 & CR4_LA57 != 0 {
                flags |= PagingFlags::LA57;
            }
        }
        flags
    }
}

/// Descriptor layout and depth of the active paging structures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingFormat {
    /// 32-bit paging: 2 levels of 4-byte entries.
    Legacy2,
    /// PAE paging: 4-entry PDPT plus 2 levels of 8-byte entries.
    Pae3,
    /// IA-32e 4-level paging.
    Long4,
    /// IA-32e 5-level paging (CR4.LA57).
    Long5,
}

impl PagingFormat {
    #[inline]
    pub fn levels(self) -> u8 {
        match self {
            PagingFormat::Legacy2 => 2,
            PagingFormat::Pae3 => 3,
            PagingFormat::Long4 => 4,
            PagingFormat::Long5 => 5,
        }
    }

    #[inline]
    pub fn is_long(self) -> bool {
        matches!(self, PagingFormat::Long4 | PagingFormat::Long5)
    }

    /// Whether `vaddr` is canonical for this format. Only long mode has a
    /// canonical form; the other formats use 32-bit linear addresses.
    #[inline]
    pub fn is_canonical(self, vaddr: u64) -> bool {
        let shift = match self {
            PagingFormat::Long4 => 47,
            PagingFormat::Long5 => 56,
            PagingFormat::Legacy2 | PagingFormat::Pae3 => return true,
        };
        let sext = (vaddr as i64) >> shift;
        sext == 0 || sext == -1
    }
}

/// Nested paging (AMD NPT style) controls: the hypervisor's table root and
/// the host control registers that define its format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NestedPaging {
    pub root: u64,
    pub cr4: u64,
    pub efer: u64,
}

/// Read-only snapshot of the control state a translation depends on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlState {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,
    pub rflags: u64,
    pub pkru: u32,
    pub pkrs: u32,
    /// Force physical address bit 20 to zero (A20 gate closed).
    pub a20_masked: bool,
    /// Present while running a guest under two-stage translation.
    pub nested: Option<NestedPaging>,
}

impl ControlState {
    #[inline]
    pub fn paging_enabled(&self) -> bool {
        self.cr0 & CR0_PG != 0
    }

    #[inline]
    pub fn a20_mask(&self) -> u64 {
        if self.a20_masked {
            !(1u64 << 20)
        } else {
            u64::MAX
        }
    }

    /// Select the stage-1 paging context, or `None` when paging is disabled.
    ///
    /// Panics when EFER.LMA is set without CR0.PG and CR4.PAE: the CPU model
    /// must never present that combination.
    #[track_caller]
    pub fn paging_context(&self) -> Option<PagingContext> {
        let lma = self.efer & EFER_LMA != 0;
        if !self.paging_enabled() {
            assert!(!lma, "EFER.LMA set with paging disabled (efer={:#x})", self.efer);
            return None;
        }
        let flags = PagingFlags::from_regs(self.cr0, self.cr4, self.efer);
        Some(PagingContext::new(self.cr3, flags))
    }

    /// Context for walking the nested tables, when two-stage translation is
    /// active.
    #[track_caller]
    pub fn nested_context(&self) -> Option<PagingContext> {
        let nested = self.nested?;
        let flags = PagingFlags::from_regs(0, nested.cr4, nested.efer) & PagingFlags::FORMAT;
        Some(PagingContext::new(nested.root, flags))
    }
}

/// Active paging structures for one walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagingContext {
    pub root: u64,
    pub format: PagingFormat,
    pub flags: PagingFlags,
}

impl PagingContext {
    #[track_caller]
    pub fn new(root: u64, flags: PagingFlags) -> Self {
        let format = if flags.contains(PagingFlags::LMA) {
            assert!(
                flags.contains(PagingFlags::PAE),
                "long mode active without CR4.PAE ({flags:?})"
            );
            if flags.contains(PagingFlags::LA57) {
                PagingFormat::Long5
            } else {
                PagingFormat::Long4
            }
        } else if flags.contains(PagingFlags::PAE) {
            PagingFormat::Pae3
        } else {
            PagingFormat::Legacy2
        };
        Self {
            root,
            format,
            flags,
        }
    }

    #[inline]
    pub fn has(&self, flag: PagingFlags) -> bool {
        self.flags.contains(flag)
    }
}
