//! Architectural fault records produced by a failed translation.

use thiserror::Error;

use crate::mode::PagingFlags;
use crate::regs::*;
use crate::AccessType;

/// Exception vectors a translation fault is delivered as.
pub const VECTOR_GP: u8 = 13;
pub const VECTOR_PF: u8 = 14;

/// SVM #NPF EXITINFO1 bits distinguishing where the nested walk failed.
pub const NPF_INFO_GPA: u64 = 1 << 32;
pub const NPF_INFO_GPT: u64 = 1 << 33;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// A descriptor on the path had P=0.
    NotPresent,
    /// A descriptor had a bit set that its format requires to be zero.
    ReservedBit,
    /// U/S, R/W, NX, SMEP or SMAP denied the access.
    Permission,
    /// The leaf's protection key denied the access.
    ProtectionKey,
    /// Long-mode linear address is not sign-extended; raised as #GP(0)
    /// before any memory access.
    NonCanonical,
}

/// Which nested translation failed, if any.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Stage2Marker {
    #[default]
    None,
    /// Translating the final guest-physical address of the access.
    DuringGpa,
    /// Translating the guest-physical address of a stage-1 descriptor.
    DuringGpt,
}

/// A guest-visible translation failure.
///
/// For stage-1 faults `addr` is the faulting linear address (CR2). For
/// stage-2 faults it is the guest-physical address that failed and
/// `error_code` comes from the nested walk; callers must route these to the
/// nested-exit path instead of injecting them into the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{kind:?} fault at {addr:#x} (error code {error_code:#x}, stage 2: {stage2:?})")]
pub struct FaultRecord {
    pub kind: FaultKind,
    pub error_code: u32,
    pub addr: u64,
    pub stage2: Stage2Marker,
}

impl FaultRecord {
    /// Build a #PF record, synthesizing the error code.
    pub(crate) fn page_fault(
        kind: FaultKind,
        addr: u64,
        access: AccessType,
        is_user: bool,
        flags: PagingFlags,
    ) -> Self {
        Self {
            kind,
            error_code: pf_error_code(kind, access, is_user, flags),
            addr,
            stage2: Stage2Marker::None,
        }
    }

    pub(crate) fn non_canonical(addr: u64) -> Self {
        Self {
            kind: FaultKind::NonCanonical,
            error_code: 0,
            addr,
            stage2: Stage2Marker::None,
        }
    }

    /// Re-tag a fault from the nested walk of `gpa`.
    pub(crate) fn into_stage2(self, marker: Stage2Marker, gpa: u64) -> Self {
        debug_assert_ne!(marker, Stage2Marker::None);
        Self {
            addr: gpa,
            stage2: marker,
            ..self
        }
    }

    /// Where the nested walk failed; `None` for stage-1 faults.
    #[inline]
    pub fn stage2(&self) -> Stage2Marker {
        self.stage2
    }

    #[inline]
    pub fn is_stage2(&self) -> bool {
        self.stage2 != Stage2Marker::None
    }

    /// Exception vector for ordinary (stage-1) delivery.
    #[inline]
    pub fn vector(&self) -> u8 {
        match self.kind {
            FaultKind::NonCanonical => VECTOR_GP,
            _ => VECTOR_PF,
        }
    }

    /// EXITINFO1 for a nested page fault exit, or `None` for stage-1 faults.
    pub fn npf_exit_info(&self) -> Option<u64> {
        let marker = match self.stage2 {
            Stage2Marker::None => return None,
            Stage2Marker::DuringGpa => NPF_INFO_GPA,
            Stage2Marker::DuringGpt => NPF_INFO_GPT,
        };
        Some(u64::from(self.error_code) | marker)
    }
}

/// #PF error code as per Intel SDM Vol. 3 4.7.
///
/// I/D is only reported when the processor distinguishes fetches, i.e. with
/// EFER.NXE or CR4.SMEP active; stores never set it.
pub(crate) fn pf_error_code(
    kind: FaultKind,
    access: AccessType,
    is_user: bool,
    flags: PagingFlags,
) -> u32 {
    let mut code = match kind {
        FaultKind::NotPresent | FaultKind::NonCanonical => 0,
        FaultKind::Permission => PF_ERROR_P,
        FaultKind::ReservedBit => PF_ERROR_P | PF_ERROR_RSVD,
        FaultKind::ProtectionKey => PF_ERROR_P | PF_ERROR_PK,
    };
    if is_user {
        code |= PF_ERROR_U;
    }
    if access.is_write() {
        code |= PF_ERROR_W;
    } else if access.is_execute() && flags.intersects(PagingFlags::NXE | PagingFlags::SMEP) {
        code |= PF_ERROR_ID;
    }
    code
}
