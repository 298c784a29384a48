//! Protection keys (PKU/PKS).

use crate::mode::PagingFlags;
use crate::regs::{PTE_PKEY_MASK, PTE_PKEY_SHIFT};
use crate::{AccessType, Protection};

const PKR_AD: u32 = 1 << 0;
const PKR_WD: u32 = 1 << 1;

/// Rights granted by the protection-key registers for a leaf.
///
/// `user_page` selects PKRU (CR4.PKE) or PKRS (CR4.PKS); a disabled feature
/// or a zero register grants everything. Execute is never restricted by
/// keys. Returns `Err(())` when `access` itself is denied.
pub(crate) fn key_rights(
    flags: PagingFlags,
    pkru: u32,
    pkrs: u32,
    leaf: u64,
    user_page: bool,
    is_user: bool,
    access: AccessType,
) -> Result<Protection, ()> {
    let pkr = if user_page {
        if flags.contains(PagingFlags::PKE) {
            pkru
        } else {
            0
        }
    } else if flags.contains(PagingFlags::PKS) {
        pkrs
    } else {
        0
    };
    if pkr == 0 {
        return Ok(Protection::all());
    }

    let key = ((leaf & PTE_PKEY_MASK) >> PTE_PKEY_SHIFT) as u32;
    let bits = (pkr >> (key * 2)) & (PKR_AD | PKR_WD);

    let mut rights = Protection::all();
    if bits & PKR_AD != 0 {
        rights.remove(Protection::READ | Protection::WRITE);
    } else if bits & PKR_WD != 0 && (is_user || flags.contains(PagingFlags::WP)) {
        rights.remove(Protection::WRITE);
    }

    if rights.allows(access) {
        Ok(rights)
    } else {
        Err(())
    }
}
