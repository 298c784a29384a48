//! Level-by-level descriptor walk.
//!
//! The walk is an explicit state machine. Any failed accessed/dirty commit
//! sends it back to [`State::SelectMode`]: the racing store may have changed
//! the mapping itself, so nothing read so far can be trusted.

use tracing::trace;

use crate::fault::{FaultKind, FaultRecord, Stage2Marker};
use crate::mode::{PagingContext, PagingFlags, PagingFormat};
use crate::phys::{DescriptorSize, PageTableMemory};
use crate::pkeys::key_rights;
use crate::regs::*;
use crate::stage2;
use crate::{AccessType, PageSize, Protection, TranslationResult};

/// Accumulated U/S, R/W and (inverted) NX while walking. NX is held as
/// "execute allowed" so every level can be merged with a plain AND.
const PERM_ALL: u64 = PTE_US | PTE_RW | PTE_NX;

const LEGACY_TABLE_MASK: u64 = 0xffff_f000;
const LEGACY_4MB_MASK: u64 = 0xffc0_0000;
const PAE_PDPT_MASK: u64 = 0xffff_ffe0;

/// Per-access inputs of one walk.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WalkParams {
    pub ctx: PagingContext,
    pub is_user: bool,
    /// Supervisor access with SMAP enforced (CR4.SMAP and RFLAGS.AC clear).
    pub smap: bool,
    pub pkru: u32,
    pub pkrs: u32,
    pub a20_mask: u64,
    pub max_phys_bits: u8,
}

impl WalkParams {
    /// Parameters for walking the nested tables: a user-mode walk with no
    /// keys, SMAP or A20 gate.
    pub(crate) fn stage2(ctx: PagingContext, max_phys_bits: u8) -> Self {
        Self {
            ctx,
            is_user: true,
            smap: false,
            pkru: 0,
            pkrs: 0,
            a20_mask: u64::MAX,
            max_phys_bits,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WalkCounters {
    pub restarts: u64,
    pub stage2_walks: u64,
}

/// Where a descriptor lives once any nested translation has been applied.
#[derive(Debug, Clone, Copy)]
struct Slot {
    addr: u64,
    size: DescriptorSize,
}

#[derive(Debug, Clone, Copy)]
struct Leaf {
    slot: Slot,
    /// Raw descriptor value as fetched; the commit compares against it.
    pte: u64,
    /// Effective U/S, R/W, NX across all levels (NX no longer inverted).
    perm: u64,
    page_size: PageSize,
    frame: u64,
}

#[derive(Debug, Clone, Copy)]
enum State {
    SelectMode,
    WalkLevel { level: u8, table: u64, perm: u64 },
    ProtectionCheck(Leaf),
    KeyCheck(Leaf, Protection),
    Stage2Compose(Leaf, Protection),
    CommitAccessedDirty(Leaf, TranslationResult),
}

pub(crate) struct Walker<'a, M: ?Sized> {
    mem: &'a M,
    params: WalkParams,
    stage2: Option<&'a WalkParams>,
    base_reserved: u64,
    pub(crate) counters: WalkCounters,
}

impl<'a, M: PageTableMemory + ?Sized> Walker<'a, M> {
    pub(crate) fn new(mem: &'a M, params: WalkParams, stage2: Option<&'a WalkParams>) -> Self {
        Self {
            mem,
            base_reserved: base_reserved_mask(&params),
            params,
            stage2,
            counters: WalkCounters::default(),
        }
    }

    pub(crate) fn translate(
        &mut self,
        vaddr: u64,
        access: AccessType,
    ) -> Result<TranslationResult, FaultRecord> {
        let mut state = State::SelectMode;
        loop {
            state = match state {
                State::SelectMode => self.select_mode(),
                State::WalkLevel { level, table, perm } => {
                    self.walk_level(vaddr, access, level, table, perm)?
                }
                State::ProtectionCheck(leaf) => {
                    State::KeyCheck(leaf, self.protection_check(vaddr, access, &leaf)?)
                }
                State::KeyCheck(leaf, prot) => {
                    State::Stage2Compose(leaf, self.key_check(vaddr, access, &leaf, prot)?)
                }
                State::Stage2Compose(leaf, prot) => {
                    State::CommitAccessedDirty(leaf, self.stage2_compose(vaddr, access, &leaf, prot)?)
                }
                State::CommitAccessedDirty(leaf, result) => {
                    match self.commit_leaf(access, &leaf, result.protection) {
                        Some(protection) => {
                            return Ok(TranslationResult {
                                protection,
                                ..result
                            })
                        }
                        None => self.restart(vaddr),
                    }
                }
            };
        }
    }

    fn format(&self) -> PagingFormat {
        self.params.ctx.format
    }

    fn has(&self, flag: PagingFlags) -> bool {
        self.params.ctx.flags.contains(flag)
    }

    fn fault(&self, kind: FaultKind, vaddr: u64, access: AccessType) -> FaultRecord {
        FaultRecord::page_fault(
            kind,
            vaddr,
            access,
            self.params.is_user,
            self.params.ctx.flags,
        )
    }

    fn restart(&mut self, vaddr: u64) -> State {
        self.counters.restarts += 1;
        trace!(vaddr, "paging-structure entry changed during walk; restarting");
        State::SelectMode
    }

    fn select_mode(&self) -> State {
        let root = self.params.ctx.root;
        let table = match self.format() {
            PagingFormat::Legacy2 => root & LEGACY_TABLE_MASK,
            PagingFormat::Pae3 => root & PAE_PDPT_MASK,
            PagingFormat::Long4 | PagingFormat::Long5 => root & PTE_ADDR_MASK,
        };
        State::WalkLevel {
            level: self.format().levels(),
            table,
            perm: PERM_ALL,
        }
    }

    fn walk_level(
        &mut self,
        vaddr: u64,
        access: AccessType,
        level: u8,
        table: u64,
        perm: u64,
    ) -> Result<State, FaultRecord> {
        let size = match self.format() {
            PagingFormat::Legacy2 => DescriptorSize::Four,
            _ => DescriptorSize::Eight,
        };
        let gpa = table.wrapping_add(self.index(vaddr, level) * size.bytes()) & self.params.a20_mask;
        let slot = self.descriptor_slot(gpa, size)?;
        let pte = self.fetch(slot);

        if pte & PTE_P == 0 {
            return Err(self.fault(FaultKind::NotPresent, vaddr, access));
        }

        let large = self.large_page(level, pte);
        if pte & self.reserved_mask(level, large) != 0 {
            return Err(self.fault(FaultKind::ReservedBit, vaddr, access));
        }

        // IA-32 PAE PDPTEs carry no U/S, R/W or accessed bit.
        let pae_pdpte = self.format() == PagingFormat::Pae3 && level == 3;
        let perm = if pae_pdpte { perm } else { perm & (pte ^ PTE_NX) };

        if level == 1 || large.is_some() {
            let page_size = large.unwrap_or(PageSize::Size4K);
            return Ok(State::ProtectionCheck(Leaf {
                slot,
                pte,
                perm: perm ^ PTE_NX,
                page_size,
                frame: self.leaf_frame(pte, page_size),
            }));
        }

        if !pae_pdpte && !self.commit(slot, pte, PTE_A) {
            return Ok(self.restart(vaddr));
        }

        let next = match self.format() {
            PagingFormat::Legacy2 => pte & LEGACY_TABLE_MASK,
            _ => pte & PTE_ADDR_MASK,
        };
        Ok(State::WalkLevel {
            level: level - 1,
            table: next,
            perm,
        })
    }

    fn index(&self, vaddr: u64, level: u8) -> u64 {
        let level = u32::from(level);
        match self.format() {
            PagingFormat::Legacy2 => (vaddr >> (12 + 10 * (level - 1))) & 0x3ff,
            PagingFormat::Pae3 if level == 3 => (vaddr >> 30) & 0x3,
            _ => (vaddr >> (12 + 9 * (level - 1))) & 0x1ff,
        }
    }

    /// Page size if this descriptor terminates the walk early.
    fn large_page(&self, level: u8, pte: u64) -> Option<PageSize> {
        if pte & PTE_PS == 0 {
            return None;
        }
        match (self.format(), level) {
            // Without CR4.PSE the PS bit of a 32-bit PDE is ignored.
            (PagingFormat::Legacy2, 2) if self.has(PagingFlags::PSE) => Some(PageSize::Size4M),
            (PagingFormat::Legacy2, _) => None,
            (_, 2) => Some(PageSize::Size2M),
            (PagingFormat::Long4 | PagingFormat::Long5, 3) => Some(PageSize::Size1G),
            _ => None,
        }
    }

    /// Bits that must be zero in a present descriptor at `level`.
    fn reserved_mask(&self, level: u8, large: Option<PageSize>) -> u64 {
        let format = self.format();
        if format == PagingFormat::Legacy2 {
            return match large {
                Some(_) => PSE36_RESERVED | pse36_unimplemented(self.params.max_phys_bits),
                None => 0,
            };
        }

        let mut mask = self.base_reserved;
        if format == PagingFormat::Pae3 && level == 3 {
            mask |= PTE_NX | PAE_PDPTE_RESERVED;
        }
        if format.is_long() && level >= 4 {
            mask |= PTE_PS;
        }
        if let Some(size) = large {
            mask |= (size.bytes() - 1) & PTE_ADDR_MASK & !PTE_LARGE_PAT;
        }
        mask
    }

    fn leaf_frame(&self, pte: u64, page_size: PageSize) -> u64 {
        match (self.format(), page_size) {
            (PagingFormat::Legacy2, PageSize::Size4M) => {
                (pte & LEGACY_4MB_MASK) | ((pte & PSE36_HI_MASK) << PSE36_HI_SHIFT)
            }
            (PagingFormat::Legacy2, _) => pte & LEGACY_TABLE_MASK,
            _ => pte & PTE_ADDR_MASK & !(page_size.bytes() - 1),
        }
    }

    fn protection_check(
        &self,
        vaddr: u64,
        access: AccessType,
        leaf: &Leaf,
    ) -> Result<Protection, FaultRecord> {
        let p = &self.params;
        let user_page = leaf.perm & PTE_US != 0;
        if p.is_user && !user_page {
            return Err(self.fault(FaultKind::Permission, vaddr, access));
        }

        let mut prot = Protection::empty();
        if !p.smap || !user_page {
            prot |= Protection::READ;
            if leaf.perm & PTE_RW != 0 || !(p.is_user || self.has(PagingFlags::WP)) {
                prot |= Protection::WRITE;
            }
        }
        if leaf.perm & PTE_NX == 0 && (p.is_user || !(self.has(PagingFlags::SMEP) && user_page)) {
            prot |= Protection::EXEC;
        }
        Ok(prot)
    }

    fn key_check(
        &self,
        vaddr: u64,
        access: AccessType,
        leaf: &Leaf,
        prot: Protection,
    ) -> Result<Protection, FaultRecord> {
        let p = &self.params;
        let rights = key_rights(
            p.ctx.flags,
            p.pkru,
            p.pkrs,
            leaf.pte,
            leaf.perm & PTE_US != 0,
            p.is_user,
            access,
        )
        .map_err(|()| self.fault(FaultKind::ProtectionKey, vaddr, access))?;

        let prot = prot & rights;
        if !prot.allows(access) {
            return Err(self.fault(FaultKind::Permission, vaddr, access));
        }
        Ok(prot)
    }

    fn stage2_compose(
        &mut self,
        vaddr: u64,
        access: AccessType,
        leaf: &Leaf,
        prot: Protection,
    ) -> Result<TranslationResult, FaultRecord> {
        let gpa = (leaf.frame | (vaddr & leaf.page_size.offset_mask())) & self.params.a20_mask;
        let stage1 = TranslationResult {
            physical_address: gpa,
            protection: prot,
            page_size: leaf.page_size,
        };
        let Some(s2) = self.stage2 else {
            return Ok(stage1);
        };

        let nested = stage2::translate_gpa(self.mem, s2, gpa, access, &mut self.counters)
            .map_err(|f| f.into_stage2(Stage2Marker::DuringGpa, gpa))?;
        let merged = stage2::compose(&stage1, &nested);
        if !merged.protection.allows(access) {
            return Err(self.fault(FaultKind::Permission, vaddr, access));
        }
        trace!(
            vaddr,
            gpa,
            paddr = merged.physical_address,
            "composed stage-2 translation"
        );
        Ok(merged)
    }

    /// Set A (and D for writes) on the leaf. A read or fetch of a clean page
    /// drops WRITE so the first store walks again and sets D.
    fn commit_leaf(&self, access: AccessType, leaf: &Leaf, prot: Protection) -> Option<Protection> {
        let mut set = PTE_A;
        let mut prot = prot;
        if access.is_write() {
            set |= PTE_D;
        } else if leaf.pte & PTE_D == 0 {
            prot.remove(Protection::WRITE);
        }
        self.commit(leaf.slot, leaf.pte, set).then_some(prot)
    }

    fn descriptor_slot(&mut self, gpa: u64, size: DescriptorSize) -> Result<Slot, FaultRecord> {
        let addr = match self.stage2 {
            None => gpa,
            // Walks may write A/D, so descriptor pages are translated as stores.
            Some(s2) => {
                stage2::translate_gpa(self.mem, s2, gpa, AccessType::Write, &mut self.counters)
                    .map_err(|f| f.into_stage2(Stage2Marker::DuringGpt, gpa))?
                    .physical_address
            }
        };
        Ok(Slot { addr, size })
    }

    fn fetch(&self, slot: Slot) -> u64 {
        match slot.size {
            DescriptorSize::Four => u64::from(self.mem.read_u32(slot.addr)),
            DescriptorSize::Eight => self.mem.read_u64(slot.addr),
        }
    }

    /// Commit `set` into the descriptor last read as `old`. Both A and D sit
    /// in the low dword, so only that half is compared and swapped.
    fn commit(&self, slot: Slot, old: u64, set: u64) -> bool {
        let old = old as u32;
        let set = set as u32;
        if set & !old == 0 {
            return true;
        }
        self.mem.cmpxchg_u32(slot.addr, old, old | set)
    }
}

/// Reserved bits shared by every level of a 64-bit format.
fn base_reserved_mask(params: &WalkParams) -> u64 {
    let mut mask = !phys_addr_mask(params.max_phys_bits) & PTE_ADDR_MASK;
    if !params.ctx.flags.contains(PagingFlags::NXE) {
        mask |= PTE_NX;
    }
    if params.ctx.format == PagingFormat::Pae3 {
        mask |= PTE_HI_IGNORED;
    }
    mask
}

/// PSE-36 high-address bits of a 4MB PDE that name unimplemented physical
/// address bits.
fn pse36_unimplemented(max_phys_bits: u8) -> u64 {
    let hi = !phys_addr_mask(max_phys_bits) & 0xff_0000_0000;
    (hi >> PSE36_HI_SHIFT) & PSE36_HI_MASK
}

#[inline]
fn phys_addr_mask(max_phys_bits: u8) -> u64 {
    (1u64 << max_phys_bits) - 1
}
