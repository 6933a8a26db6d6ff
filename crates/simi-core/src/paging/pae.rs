use super::{EntryFlags, PageTableLevel, PageTableWalk, entry::x86_flags, walk::EntryReader};
use crate::{Pa, SimDriver};

const ROOT_MASK: u64 = 0xffff_ffe0;
const TABLE_MASK: u64 = 0x000f_ffff_ffff_f000;
const LARGE_MASK: u64 = 0x000f_ffff_ffe0_0000;

const PAGE_SIZE: u64 = 0x1000;
const LARGE_PAGE_SIZE: u64 = 0x20_0000;

pub(super) fn walk<Driver>(reader: &EntryReader<'_, Driver>, walk: &mut PageTableWalk)
where
    Driver: SimDriver,
{
    let va = walk.va.0 & 0xffff_ffff;

    let pdpte_address = Pa((walk.root.0 & ROOT_MASK) + ((va >> 30) & 0x3) * 8);
    let Some((pdpte, _)) = walk.visit(reader, PageTableLevel::Pdpt, pdpte_address, |value| {
        // PDPTEs carry no access rights.
        let mut flags = EntryFlags::WRITABLE | EntryFlags::USER;
        flags.set(EntryFlags::PRESENT, value & 1 != 0);
        flags
    }) else {
        return;
    };

    let pde_address = Pa((pdpte & TABLE_MASK) + ((va >> 21) & 0x1ff) * 8);
    let Some((pde, flags)) = walk.visit(reader, PageTableLevel::Pd, pde_address, |value| {
        x86_flags(value, PageTableLevel::Pd, true)
    }) else {
        return;
    };

    if flags.contains(EntryFlags::LARGE) {
        walk.resolve(pde & LARGE_MASK, LARGE_PAGE_SIZE);
        return;
    }

    let pte_address = Pa((pde & TABLE_MASK) + ((va >> 12) & 0x1ff) * 8);
    let Some((pte, _)) = walk.visit(reader, PageTableLevel::Pt, pte_address, |value| {
        x86_flags(value, PageTableLevel::Pt, true)
    }) else {
        return;
    };

    walk.resolve(pte & TABLE_MASK, PAGE_SIZE);
}
