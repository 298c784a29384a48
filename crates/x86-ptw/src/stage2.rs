//! Two-stage (nested) translation helpers.
//!
//! The nested tables use the ordinary x86 descriptor formats, so a stage-2
//! lookup is just another [`Walker`] run over a user-mode context with no
//! nested stage of its own.

use crate::fault::FaultRecord;
use crate::phys::PageTableMemory;
use crate::walker::{WalkCounters, WalkParams, Walker};
use crate::{AccessType, TranslationResult};

/// Translate a guest-physical address through the nested tables.
///
/// Faults come back untagged; the caller knows whether `gpa` was a
/// descriptor or the final address and marks them accordingly.
pub(crate) fn translate_gpa<M: PageTableMemory + ?Sized>(
    mem: &M,
    params: &WalkParams,
    gpa: u64,
    access: AccessType,
    counters: &mut WalkCounters,
) -> Result<TranslationResult, FaultRecord> {
    counters.stage2_walks += 1;
    let mut walker = Walker::new(mem, *params, None);
    let res = walker.translate(gpa, access);
    counters.restarts += walker.counters.restarts;
    res
}

/// Merge a stage-1 result (whose address is guest-physical) with the nested
/// translation of that address.
///
/// Rights are intersected and the reported page size is the larger of the
/// two, matching how the composed mapping is cached.
pub(crate) fn compose(stage1: &TranslationResult, nested: &TranslationResult) -> TranslationResult {
    let offset_mask = nested.page_size.offset_mask();
    TranslationResult {
        physical_address: (nested.physical_address & !offset_mask)
            | (stage1.physical_address & offset_mask),
        protection: stage1.protection & nested.protection,
        page_size: stage1.page_size.max(nested.page_size),
    }
}
