use super::{EntryFlags, PageTableLevel, PageTableWalk, entry::x86_flags, walk::EntryReader};
use crate::{Pa, SimDriver};

/// Bits 12 through 50 of CR3 and of every table pointer.
const TABLE_MASK: u64 = 0x0007_ffff_ffff_f000;

const PAGE_SIZE: u64 = 0x1000;
const LARGE_PAGE_SIZE: u64 = 0x20_0000;
const HUGE_PAGE_SIZE: u64 = 0x4000_0000;

fn index(va: u64, level: PageTableLevel) -> u64 {
    let shift = match level {
        PageTableLevel::Pt => 12,
        PageTableLevel::Pd => 21,
        PageTableLevel::Pdpt => 30,
        PageTableLevel::Pml4 => 39,
    };

    (va >> shift) & 0x1ff
}

pub(super) fn walk<Driver>(reader: &EntryReader<'_, Driver>, walk: &mut PageTableWalk)
where
    Driver: SimDriver,
{
    let va = walk.va.0;
    let mut table = walk.root.0 & TABLE_MASK;
    let mut level = PageTableLevel::Pml4;

    loop {
        let address = Pa(table + index(va, level) * 8);
        let Some((value, flags)) = walk.visit(reader, level, address, |value| {
            x86_flags(value, level, true)
        }) else {
            return;
        };

        if flags.contains(EntryFlags::LARGE) {
            match level {
                PageTableLevel::Pdpt => {
                    walk.resolve(value & TABLE_MASK & !(HUGE_PAGE_SIZE - 1), HUGE_PAGE_SIZE);
                    return;
                }
                PageTableLevel::Pd => {
                    walk.resolve(value & TABLE_MASK & !(LARGE_PAGE_SIZE - 1), LARGE_PAGE_SIZE);
                    return;
                }
                // PS is reserved in a PML4E.
                _ => {}
            }
        }

        match level.next() {
            Some(next) => {
                table = value & TABLE_MASK;
                level = next;
            }
            None => {
                walk.resolve(value & TABLE_MASK, PAGE_SIZE);
                return;
            }
        }
    }
}
