use super::{EntryFlags, PageTableLevel, PageTableWalk, entry::x86_flags, walk::EntryReader};
use crate::{Pa, SimDriver};

const TABLE_MASK: u64 = 0xffff_f000;
const LARGE_MASK: u64 = 0xffc0_0000;

const PAGE_SIZE: u64 = 0x1000;
const LARGE_PAGE_SIZE: u64 = 0x40_0000;

pub(super) fn walk<Driver>(reader: &EntryReader<'_, Driver>, walk: &mut PageTableWalk)
where
    Driver: SimDriver,
{
    let va = walk.va.0 & 0xffff_ffff;

    let pde_address = Pa((walk.root.0 & TABLE_MASK) + ((va >> 22) & 0x3ff) * 4);
    let Some((pde, flags)) = walk.visit(reader, PageTableLevel::Pd, pde_address, |value| {
        x86_flags(value, PageTableLevel::Pd, false)
    }) else {
        return;
    };

    if flags.contains(EntryFlags::LARGE) {
        walk.resolve(pde & LARGE_MASK, LARGE_PAGE_SIZE);
        return;
    }

    let pte_address = Pa((pde & TABLE_MASK) + ((va >> 12) & 0x3ff) * 4);
    let Some((pte, _)) = walk.visit(reader, PageTableLevel::Pt, pte_address, |value| {
        x86_flags(value, PageTableLevel::Pt, false)
    }) else {
        return;
    };

    walk.resolve(pte & TABLE_MASK, PAGE_SIZE);
}
