use super::{EntryFlags, PageTableLevel, PageTableWalk, walk::EntryReader};
use crate::{Pa, SimDriver};

const ROOT_MASK: u64 = 0xffff_c000;
const COARSE_MASK: u64 = 0xffff_fc00;
const SECTION_MASK: u64 = 0xfff0_0000;
const LARGE_MASK: u64 = 0xffff_0000;
const SMALL_MASK: u64 = 0xffff_f000;

const SECTION_SIZE: u64 = 0x10_0000;
const LARGE_PAGE_SIZE: u64 = 0x1_0000;
const SMALL_PAGE_SIZE: u64 = 0x1000;

/// Decodes the two access permission bits at `shift`.
///
/// `AP == 3` is full access, `AP == 2` is user read-only, lower values
/// are kernel only.
///
/// Short descriptors carry no accessed flag unless the access flag model
/// is enabled, in which case it replaces `AP[0]`. The walk cannot tell the
/// two apart, so `ACCESSED` is never reported.
fn access_permissions(value: u64, shift: u32) -> EntryFlags {
    let mut flags = EntryFlags::empty();
    let ap = (value >> shift) & 3;

    flags.set(EntryFlags::WRITABLE, ap == 3);
    flags.set(EntryFlags::USER, ap >= 2);
    flags
}

/// First-level descriptor: 1 = coarse table, 2 = section.
pub(super) fn first_level_flags(value: u64) -> EntryFlags {
    match value & 3 {
        1 => EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER,
        2 => {
            let mut flags = EntryFlags::PRESENT | EntryFlags::LARGE | access_permissions(value, 10);
            flags.set(EntryFlags::NO_EXECUTE, (value >> 4) & 1 != 0);
            flags
        }
        _ => EntryFlags::empty(),
    }
}

/// Second-level descriptor: 1 = 64 KiB large page, 2 or 3 = 4 KiB small page.
pub(super) fn second_level_flags(value: u64) -> EntryFlags {
    match value & 3 {
        0 => EntryFlags::empty(),
        1 => {
            let mut flags = EntryFlags::PRESENT | EntryFlags::LARGE | access_permissions(value, 4);
            flags.set(EntryFlags::NO_EXECUTE, (value >> 15) & 1 != 0);
            flags
        }
        _ => {
            let mut flags = EntryFlags::PRESENT | access_permissions(value, 4);
            flags.set(EntryFlags::NO_EXECUTE, value & 1 != 0);
            flags
        }
    }
}

pub(super) fn walk<Driver>(reader: &EntryReader<'_, Driver>, walk: &mut PageTableWalk)
where
    Driver: SimDriver,
{
    let va = walk.va.0 & 0xffff_ffff;

    let fld_address = Pa((walk.root.0 & ROOT_MASK) | ((va >> 20) << 2));
    let Some((fld, flags)) =
        walk.visit(reader, PageTableLevel::Pd, fld_address, first_level_flags)
    else {
        return;
    };

    if flags.contains(EntryFlags::LARGE) {
        walk.resolve(fld & SECTION_MASK, SECTION_SIZE);
        return;
    }

    let sld_address = Pa((fld & COARSE_MASK) | (((va >> 12) & 0xff) << 2));
    let Some((sld, flags)) =
        walk.visit(reader, PageTableLevel::Pt, sld_address, second_level_flags)
    else {
        return;
    };

    if flags.contains(EntryFlags::LARGE) {
        walk.resolve(sld & LARGE_MASK, LARGE_PAGE_SIZE);
    } else {
        walk.resolve(sld & SMALL_MASK, SMALL_PAGE_SIZE);
    }
}
