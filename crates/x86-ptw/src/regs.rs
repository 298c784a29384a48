//! Architectural bit positions consumed by the walker.

pub const CR0_WP: u64 = 1 << 16;
pub const CR0_PG: u64 = 1 << 31;

pub const CR4_PSE: u64 = 1 << 4;
pub const CR4_PAE: u64 = 1 << 5;
pub const CR4_LA57: u64 = 1 << 12;
pub const CR4_SMEP: u64 = 1 << 20;
pub const CR4_SMAP: u64 = 1 << 21;
pub const CR4_PKE: u64 = 1 << 22;
pub const CR4_PKS: u64 = 1 << 24;

pub const EFER_LME: u64 = 1 << 8;
pub const EFER_LMA: u64 = 1 << 10;
pub const EFER_NXE: u64 = 1 << 11;

pub const RFLAGS_AC: u64 = 1 << 18;

pub const PTE_P: u64 = 1 << 0;
pub const PTE_RW: u64 = 1 << 1;
pub const PTE_US: u64 = 1 << 2;
pub const PTE_A: u64 = 1 << 5;
pub const PTE_D: u64 = 1 << 6;
pub const PTE_PS: u64 = 1 << 7;
pub const PTE_NX: u64 = 1 << 63;

/// Protection key field of a 64-bit leaf (bits 59..=62).
pub const PTE_PKEY_SHIFT: u32 = 59;
pub const PTE_PKEY_MASK: u64 = 0xf << PTE_PKEY_SHIFT;

/// Physical address field of 64-bit descriptors (bits 12..=51).
pub const PTE_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// PAT bit of 2MB/1GB leaves; sits inside the address field but is not an
/// address bit.
pub(crate) const PTE_LARGE_PAT: u64 = 1 << 12;

/// Bits 52..=62: ignored in long mode, reserved under PAE paging.
pub(crate) const PTE_HI_IGNORED: u64 = 0x7ff0_0000_0000_0000;

/// IA-32 PAE PDPTE bits that must be zero: R/W, U/S and 5..=8.
pub(crate) const PAE_PDPTE_RESERVED: u64 = (1 << 1) | (1 << 2) | (0xf << 5);

/// 4MB PDE: bits 13..=20 carry physical address bits 32..=39.
pub(crate) const PSE36_HI_MASK: u64 = 0x001f_e000;
pub(crate) const PSE36_HI_SHIFT: u32 = 32 - 13;
/// 4MB PDE bit 21 is always reserved.
pub(crate) const PSE36_RESERVED: u64 = 1 << 21;

pub const PF_ERROR_P: u32 = 1 << 0;
pub const PF_ERROR_W: u32 = 1 << 1;
pub const PF_ERROR_U: u32 = 1 << 2;
pub const PF_ERROR_RSVD: u32 = 1 << 3;
pub const PF_ERROR_ID: u32 = 1 << 4;
pub const PF_ERROR_PK: u32 = 1 << 5;
