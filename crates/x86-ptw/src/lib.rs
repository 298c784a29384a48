//! x86/x86-64 guest page-table walker: linear → physical translation.
//!
//! Supported descriptor formats:
//! - No paging (identity mapping, A20 gate honoured)
//! - 32-bit paging (4KB / 4MB pages, PSE-36)
//! - PAE paging (4KB / 2MB pages)
//! - 4- and 5-level long mode paging (4KB / 2MB / 1GB pages) with canonical
//!   checks
//!
//! Every translation walks the tables afresh; there is no TLB. Accessed and
//! dirty bits are committed with a 32-bit compare-and-swap so several cores
//! can walk the same tables concurrently, and a lost race restarts the walk
//! from the root. With nested paging configured, descriptor fetches and the
//! final guest-physical address are translated again through the
//! hypervisor's tables.

mod fault;
mod guest_ram;
mod mode;
mod phys;
mod pkeys;
pub mod regs;
mod stage2;
mod walker;


use bitflags::bitflags;
use tracing::debug;

pub use fault::{FaultKind, FaultRecord, Stage2Marker, NPF_INFO_GPA, NPF_INFO_GPT, VECTOR_GP, VECTOR_PF};
pub use guest_ram::{GuestMemoryError, MmioHandler, SharedGuestMemory};
pub use mode::{ControlState, NestedPaging, PagingContext, PagingFlags, PagingFormat};
pub use phys::PageTableMemory;

use regs::RFLAGS_AC;
use walker::{WalkCounters, WalkParams, Walker};

/// Type of memory access being translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

impl AccessType {
    #[inline]
    pub fn is_write(self) -> bool {
        matches!(self, AccessType::Write)
    }

    #[inline]
    pub fn is_execute(self) -> bool {
        matches!(self, AccessType::Execute)
    }
}

bitflags! {
    /// Rights granted by a translation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl Protection {
    #[inline]
    pub fn allows(self, access: AccessType) -> bool {
        let needed = match access {
            AccessType::Read => Protection::READ,
            AccessType::Write => Protection::WRITE,
            AccessType::Execute => Protection::EXEC,
        };
        self.contains(needed)
    }
}

/// Size of the page a translation hit. Ordered by size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PageSize {
    Size4K,
    Size2M,
    Size4M,
    Size1G,
}

impl PageSize {
    #[inline]
    pub fn bytes(self) -> u64 {
        match self {
            PageSize::Size4K => 4 * 1024,
            PageSize::Size2M => 2 * 1024 * 1024,
            PageSize::Size4M => 4 * 1024 * 1024,
            PageSize::Size1G => 1024 * 1024 * 1024,
        }
    }

    #[inline]
    pub fn offset_mask(self) -> u64 {
        self.bytes() - 1
    }
}

/// Which translation regime a request uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MmuIndex {
    /// Normal guest linear address through the guest's paging structures.
    #[default]
    Paged,
    /// Address is already physical; identity mapped.
    Phys,
    /// Address is guest-physical and only goes through the nested tables.
    Nested,
}

/// One access to translate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationRequest {
    pub vaddr: u64,
    pub access: AccessType,
    /// Current privilege level; CPL 3 is user mode.
    pub cpl: u8,
    pub index: MmuIndex,
}

impl TranslationRequest {
    #[inline]
    pub fn new(vaddr: u64, access: AccessType, cpl: u8) -> Self {
        Self {
            vaddr,
            access,
            cpl,
            index: MmuIndex::Paged,
        }
    }

    #[inline]
    pub fn with_index(self, index: MmuIndex) -> Self {
        Self { index, ..self }
    }

    #[inline]
    pub fn is_user(&self) -> bool {
        self.cpl == 3
    }
}

/// A successful translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationResult {
    pub physical_address: u64,
    /// Everything the mapping permits, not just the requested access. WRITE is
    /// withheld from clean pages until a write access marks them dirty.
    pub protection: Protection,
    pub page_size: PageSize,
}

impl TranslationResult {
    fn identity(paddr: u64) -> Self {
        Self {
            physical_address: paddr,
            protection: Protection::all(),
            page_size: PageSize::Size4K,
        }
    }
}

/// Optional walker statistics.
///
/// When the `stats` feature is disabled, this type contains no fields and
/// [`Mmu::stats`] will always return `None`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MmuStats {
    /// Calls to [`Mmu::translate`].
    #[cfg(feature = "stats")]
    pub translations: u64,
    /// Stage-1 page-table walks started (restarts not included).
    #[cfg(feature = "stats")]
    pub page_walks: u64,
    /// Walks restarted after losing an accessed/dirty race.
    #[cfg(feature = "stats")]
    pub walk_restarts: u64,
    /// Nested-table walks, for descriptors and final addresses alike.
    #[cfg(feature = "stats")]
    pub stage2_walks: u64,
    /// Translations that ended in a fault.
    #[cfg(feature = "stats")]
    pub faults: u64,
}

impl MmuStats {
    #[inline]
    pub fn translations(&self) -> u64 {
        #[cfg(feature = "stats")]
        {
            self.translations
        }
        #[cfg(not(feature = "stats"))]
        {
            0
        }
    }

    #[inline]
    pub fn page_walks(&self) -> u64 {
        #[cfg(feature = "stats")]
        {
            self.page_walks
        }
        #[cfg(not(feature = "stats"))]
        {
            0
        }
    }

    #[inline]
    pub fn walk_restarts(&self) -> u64 {
        #[cfg(feature = "stats")]
        {
            self.walk_restarts
        }
        #[cfg(not(feature = "stats"))]
        {
            0
        }
    }

    #[inline]
    pub fn stage2_walks(&self) -> u64 {
        #[cfg(feature = "stats")]
        {
            self.stage2_walks
        }
        #[cfg(not(feature = "stats"))]
        {
            0
        }
    }

    #[inline]
    pub fn faults(&self) -> u64 {
        #[cfg(feature = "stats")]
        {
            self.faults
        }
        #[cfg(not(feature = "stats"))]
        {
            0
        }
    }
}

/// Per-core translation engine.
///
/// Holds no paging state of its own: every call reads the control registers
/// from the supplied [`ControlState`] and the tables from memory.
#[derive(Debug, Clone)]
pub struct Mmu {
    max_phys_bits: u8,
    #[cfg(feature = "stats")]
    stats: MmuStats,
}

impl Default for Mmu {
    fn default() -> Self {
        Self::new()
    }
}

impl Mmu {
    pub fn new() -> Self {
        Self {
            max_phys_bits: 52,
            #[cfg(feature = "stats")]
            stats: MmuStats::default(),
        }
    }

    /// Returns current walker statistics when the `stats` feature is enabled.
    pub fn stats(&self) -> Option<MmuStats> {
        #[cfg(feature = "stats")]
        {
            Some(self.stats)
        }

        #[cfg(not(feature = "stats"))]
        {
            None
        }
    }

    /// Resets statistics counters back to 0 when the `stats` feature is enabled.
    #[inline]
    pub fn reset_stats(&mut self) {
        #[cfg(feature = "stats")]
        {
            self.stats = MmuStats::default();
        }
    }

    #[inline]
    pub fn max_phys_bits(&self) -> u8 {
        self.max_phys_bits
    }

    /// Implemented physical address width (MAXPHYADDR). Descriptor address
    /// bits at or above it are reserved.
    #[track_caller]
    pub fn set_max_phys_bits(&mut self, bits: u8) {
        assert!(
            (1..=52).contains(&bits),
            "max_phys_bits must be 1..=52 (got {bits})"
        );
        self.max_phys_bits = bits;
    }

    /// Translate one access.
    ///
    /// Guest-visible failures are returned as [`FaultRecord`]s; check
    /// [`FaultRecord::stage2`] before injecting one, as nested-table faults
    /// belong to the hypervisor. Panics if `ctrl` describes a paging mode the
    /// CPU can never enter, or if a [`MmuIndex::Nested`] request is made
    /// without nested paging configured.
    pub fn translate<M: PageTableMemory + ?Sized>(
        &mut self,
        mem: &M,
        ctrl: &ControlState,
        req: TranslationRequest,
    ) -> Result<TranslationResult, FaultRecord> {
        let mut counters = WalkCounters::default();
        let res = self.translate_inner(mem, ctrl, req, &mut counters);
        self.record(&counters, res.is_err());

        if let Err(fault) = &res {
            debug!(
                vaddr = req.vaddr,
                access = ?req.access,
                cpl = req.cpl,
                kind = ?fault.kind,
                error_code = fault.error_code,
                addr = fault.addr,
                stage2 = ?fault.stage2,
                "translation fault"
            );
        }
        res
    }

    fn translate_inner<M: PageTableMemory + ?Sized>(
        &mut self,
        mem: &M,
        ctrl: &ControlState,
        req: TranslationRequest,
        counters: &mut WalkCounters,
    ) -> Result<TranslationResult, FaultRecord> {
        let nested = ctrl
            .nested_context()
            .map(|ctx| WalkParams::stage2(ctx, self.max_phys_bits));

        match req.index {
            MmuIndex::Paged => {}
            MmuIndex::Phys => {
                return Ok(TranslationResult::identity(req.vaddr & ctrl.a20_mask()));
            }
            MmuIndex::Nested => {
                let Some(s2) = nested else {
                    panic!("nested translation requested without nested paging configured");
                };
                return Self::nested_only(mem, &s2, req.vaddr, req.access, counters);
            }
        }

        let Some(ctx) = ctrl.paging_context() else {
            let paddr = (req.vaddr & 0xffff_ffff) & ctrl.a20_mask();
            return match &nested {
                None => Ok(TranslationResult::identity(paddr)),
                Some(s2) => Self::nested_only(mem, s2, paddr, req.access, counters),
            };
        };

        let vaddr = if ctx.format.is_long() {
            if !ctx.format.is_canonical(req.vaddr) {
                return Err(FaultRecord::non_canonical(req.vaddr));
            }
            req.vaddr
        } else {
            req.vaddr & 0xffff_ffff
        };

        let is_user = req.is_user();
        let params = WalkParams {
            ctx,
            is_user,
            smap: !is_user && ctx.has(PagingFlags::SMAP) && ctrl.rflags & RFLAGS_AC == 0,
            pkru: ctrl.pkru,
            pkrs: ctrl.pkrs,
            a20_mask: ctrl.a20_mask(),
            max_phys_bits: self.max_phys_bits,
        };

        #[cfg(feature = "stats")]
        {
            self.stats.page_walks = self.stats.page_walks.wrapping_add(1);
        }

        let mut walker = Walker::new(mem, params, nested.as_ref());
        let res = walker.translate(vaddr, req.access);
        counters.restarts += walker.counters.restarts;
        counters.stage2_walks += walker.counters.stage2_walks;
        res
    }

    /// Guest-physical address straight through the nested tables.
    fn nested_only<M: PageTableMemory + ?Sized>(
        mem: &M,
        s2: &WalkParams,
        gpa: u64,
        access: AccessType,
        counters: &mut WalkCounters,
    ) -> Result<TranslationResult, FaultRecord> {
        stage2::translate_gpa(mem, s2, gpa, access, counters)
            .map_err(|f| f.into_stage2(Stage2Marker::DuringGpa, gpa))
    }

    #[inline]
    fn record(&mut self, counters: &WalkCounters, faulted: bool) {
        #[cfg(feature = "stats")]
        {
            self.stats.translations = self.stats.translations.wrapping_add(1);
            self.stats.walk_restarts = self.stats.walk_restarts.wrapping_add(counters.restarts);
            self.stats.stage2_walks = self.stats.stage2_walks.wrapping_add(counters.stage2_walks);
            if faulted {
                self.stats.faults = self.stats.faults.wrapping_add(1);
            }
        }
        #[cfg(not(feature = "stats"))]
        {
            let _ = (counters, faulted);
        }
    }
}
