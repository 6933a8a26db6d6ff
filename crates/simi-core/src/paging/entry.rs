use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::{EntryFlags, PageTableLevel};

/// A 4-byte paging entry (32-bit paging, ARM short descriptors).
#[repr(transparent)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct RawEntry32(pub u32);

/// An 8-byte paging entry (PAE, 4-level paging).
#[repr(transparent)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct RawEntry64(pub u64);

impl From<RawEntry32> for u64 {
    fn from(value: RawEntry32) -> Self {
        value.0 as u64
    }
}

impl From<RawEntry64> for u64 {
    fn from(value: RawEntry64) -> Self {
        value.0
    }
}

/// Decodes the control bits of an x86 paging entry.
///
/// Bit 7 means "large page" only above the PT level; in a PT entry it
/// selects the PAT. Bit 63 is XD only for 8-byte entries.
pub(super) fn x86_flags(value: u64, level: PageTableLevel, wide: bool) -> EntryFlags {
    let mut flags = EntryFlags::empty();
    let bit = |n: u32| (value >> n) & 1 != 0;

    flags.set(EntryFlags::PRESENT, bit(0));
    flags.set(EntryFlags::WRITABLE, bit(1));
    flags.set(EntryFlags::USER, bit(2));
    flags.set(EntryFlags::ACCESSED, bit(5));
    flags.set(EntryFlags::LARGE, level != PageTableLevel::Pt && bit(7));
    flags.set(EntryFlags::NO_EXECUTE, wide && bit(63));
    flags
}
