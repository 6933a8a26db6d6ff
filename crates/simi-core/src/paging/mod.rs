//! Page table walker.
//!
//! A walk resolves one virtual address under one paging mode by reading
//! the paging structures straight out of guest physical memory. It never
//! fails as a whole: each level that could be read is recorded, and the
//! first level that is missing (not present, or not readable because the
//! simulator does not back the frame) ends the walk. Callers inspect the
//! result field by field.
//!
//! # Paging modes
//!
//! - [`PagingMode::Legacy32`]: two levels of 4-byte entries (10/10/12 split),
//!   with 4 MiB pages when `PDE.PS` is set.
//! - [`PagingMode::Pae`]: a 4-entry pointer table followed by two levels of
//!   8-byte entries (2/9/9/12 split), with 2 MiB pages.
//! - [`PagingMode::Ia32e`]: four levels of 8-byte entries (9/9/9/9/12
//!   split), with 1 GiB and 2 MiB pages.
//! - [`PagingMode::ArmShort`]: ARMv7 short descriptors, a 4096-entry first
//!   level (1 MiB sections or coarse tables) and a 256-entry second level
//!   (64 KiB large or 4 KiB small pages).
//!
//! # Overrides
//!
//! [`EntryOverride`] substitutes a known value for one entry. It lets a
//! caller that just observed a write to a paging structure re-walk with the
//! written value instead of re-reading memory that the kernel may already
//! be changing again.

mod arm;
mod entry;
mod ia32e;
mod legacy;
mod mappings;
mod pae;
mod walk;

#[cfg(test)]
mod walk_tests;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub use self::{
    entry::{RawEntry32, RawEntry64},
    mappings::PageMapping,
};
pub(crate) use self::{mappings::user_mappings, walk::walk};
use crate::{Pa, Va};

/// Page table format in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PagingMode {
    /// 32-bit paging.
    Legacy32,

    /// Physical Address Extension.
    Pae,

    /// 4-level paging.
    Ia32e,

    /// ARMv7 short-descriptor translation tables.
    ArmShort,
}

impl PagingMode {
    /// Returns the address width (i.e. pointer size) of the paging mode in
    /// bytes.
    pub fn address_width(self) -> usize {
        match self {
            Self::Legacy32 | Self::Pae | Self::ArmShort => 4,
            Self::Ia32e => 8,
        }
    }

    /// Returns the size of one paging structure entry in bytes.
    pub fn entry_size(self) -> u64 {
        match self {
            Self::Legacy32 | Self::ArmShort => 4,
            Self::Pae | Self::Ia32e => 8,
        }
    }

    /// Returns the highest level walked in this mode.
    pub fn top_level(self) -> PageTableLevel {
        match self {
            Self::Legacy32 | Self::ArmShort => PageTableLevel::Pd,
            Self::Pae => PageTableLevel::Pdpt,
            Self::Ia32e => PageTableLevel::Pml4,
        }
    }
}

/// The levels in the page table hierarchy.
///
/// ARM first-level descriptors are reported as [`Pd`](Self::Pd) and
/// second-level descriptors as [`Pt`](Self::Pt).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PageTableLevel {
    /// Page Table, the lowest level, pointing directly to pages.
    Pt,

    /// Page Directory, pointing to page tables or large pages.
    Pd,

    /// Page Directory Pointer Table.
    Pdpt,

    /// Page Map Level 4.
    Pml4,
}

impl PageTableLevel {
    /// Returns the next lower level in the page table hierarchy.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Pt => None,
            Self::Pd => Some(Self::Pt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pml4 => Some(Self::Pdpt),
        }
    }

    /// Returns the next higher level in the page table hierarchy.
    pub fn previous(self) -> Option<Self> {
        match self {
            Self::Pt => Some(Self::Pd),
            Self::Pd => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pml4),
            Self::Pml4 => None,
        }
    }
}

bitflags::bitflags! {
    /// Architecture-neutral view of a paging entry's control bits.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EntryFlags: u8 {
        /// The entry maps something.
        const PRESENT = 1 << 0;

        /// Writes are allowed.
        const WRITABLE = 1 << 1;

        /// User mode may access the mapping.
        const USER = 1 << 2;

        /// Instruction fetches are not allowed.
        const NO_EXECUTE = 1 << 3;

        /// The entry has been used for a translation.
        const ACCESSED = 1 << 4;

        /// The entry maps a page directly instead of the next table.
        const LARGE = 1 << 5;
    }
}

/// One paging structure entry visited during a walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableEntry {
    /// The level of the paging structure holding the entry.
    pub level: PageTableLevel,

    /// The physical address of the entry.
    pub address: Pa,

    /// The raw entry, or `None` if it could not be read.
    pub value: Option<u64>,

    /// The decoded control bits.
    pub flags: EntryFlags,
}

impl TableEntry {
    /// Checks whether the entry was read and is present.
    pub fn present(&self) -> bool {
        self.flags.contains(EntryFlags::PRESENT)
    }

    /// Checks whether the entry maps a page (a leaf).
    pub fn is_leaf(&self) -> bool {
        self.present() && (self.level == PageTableLevel::Pt || self.flags.contains(EntryFlags::LARGE))
    }
}

/// Collection of entries visited by a walk, top level first.
pub type TableEntries = SmallVec<[TableEntry; 4]>;

/// Substitute value for one paging entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryOverride {
    /// The physical address of the entry.
    pub address: Pa,

    /// The value to use instead of guest memory.
    pub value: u64,
}

impl EntryOverride {
    /// Creates a new entry override.
    pub fn new(address: Pa, value: u64) -> Self {
        Self { address, value }
    }
}

/// The result of walking one virtual address.
///
/// Created fresh per lookup and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTableWalk {
    pub(crate) va: Va,
    pub(crate) root: Pa,
    pub(crate) mode: PagingMode,
    pub(crate) entries: TableEntries,
    pub(crate) pa: Option<Pa>,
    pub(crate) page_size: Option<u64>,
}

impl PageTableWalk {
    pub(crate) fn new(va: Va, root: Pa, mode: PagingMode) -> Self {
        Self {
            va,
            root,
            mode,
            entries: TableEntries::new(),
            pa: None,
            page_size: None,
        }
    }

    /// Returns the walked virtual address.
    pub fn va(&self) -> Va {
        self.va
    }

    /// Returns the translation root the walk started from.
    pub fn root(&self) -> Pa {
        self.root
    }

    /// Returns the paging mode of the walk.
    pub fn mode(&self) -> PagingMode {
        self.mode
    }

    /// Returns the entries visited, top level first.
    pub fn entries(&self) -> &[TableEntry] {
        &self.entries
    }

    /// Returns the resolved physical address, including the page offset.
    pub fn pa(&self) -> Option<Pa> {
        self.pa
    }

    /// Returns the size of the mapped page, if resolved.
    pub fn page_size(&self) -> Option<u64> {
        self.page_size
    }

    /// Checks whether the address is fully mapped.
    pub fn is_resolved(&self) -> bool {
        self.pa.is_some()
    }

    /// Returns the entry visited at `level`.
    pub fn entry(&self, level: PageTableLevel) -> Option<&TableEntry> {
        self.entries.iter().find(|entry| entry.level == level)
    }

    /// Checks whether the page directory is reachable.
    ///
    /// Always true for two-level modes, where the directory is the root.
    pub fn directory_exists(&self) -> bool {
        match self.mode {
            PagingMode::Legacy32 | PagingMode::ArmShort => true,
            PagingMode::Pae | PagingMode::Ia32e => self.entry(PageTableLevel::Pd).is_some(),
        }
    }

    /// Checks whether the page table (or a large page in its place) exists.
    pub fn table_exists(&self) -> bool {
        self.entry(PageTableLevel::Pd)
            .is_some_and(|entry| entry.present())
    }

    /// Checks whether the page exists.
    pub fn page_exists(&self) -> bool {
        self.pa.is_some()
    }

    /// Returns the physical address of the page directory entry.
    pub fn directory_entry_address(&self) -> Option<Pa> {
        self.entry(PageTableLevel::Pd).map(|entry| entry.address)
    }

    /// Returns the physical address of the page table entry.
    pub fn table_entry_address(&self) -> Option<Pa> {
        self.entry(PageTableLevel::Pt).map(|entry| entry.address)
    }

    /// Returns the physical address of the page base.
    pub fn page_base(&self) -> Option<Pa> {
        match (self.pa, self.page_size) {
            (Some(pa), Some(size)) => Some(pa & !(size - 1)),
            _ => None,
        }
    }

    /// Returns the entry that stopped the walk, or `None` if the walk
    /// resolved.
    ///
    /// This is the deepest entry whose location is known, i.e. the most
    /// specific place to watch for the mapping to appear.
    pub fn blocking_entry(&self) -> Option<&TableEntry> {
        if self.is_resolved() {
            return None;
        }

        self.entries.last()
    }

    /// Checks if all visited entries allow writes.
    pub fn writable(&self) -> bool {
        self.all(EntryFlags::WRITABLE)
    }

    /// Checks if all visited entries allow user-mode access.
    pub fn user(&self) -> bool {
        self.all(EntryFlags::USER)
    }

    /// Checks if any visited entry forbids instruction fetches.
    pub fn no_execute(&self) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.flags.contains(EntryFlags::NO_EXECUTE))
    }

    /// Checks if the leaf entry has been accessed.
    pub fn accessed(&self) -> bool {
        self.entries
            .last()
            .is_some_and(|entry| entry.flags.contains(EntryFlags::ACCESSED))
    }

    fn all(&self, flag: EntryFlags) -> bool {
        self.is_resolved() && self.entries.iter().all(|entry| entry.flags.contains(flag))
    }
}

impl IntoIterator for PageTableWalk {
    type Item = TableEntry;
    type IntoIter = <TableEntries as IntoIterator>::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl std::fmt::Display for PageTableWalk {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} @ {} ({:?}):", self.va, self.root, self.mode)?;

        for entry in &self.entries {
            match entry.value {
                Some(value) => write!(f, " {:?}[{}]={:#x}", entry.level, entry.address, value)?,
                None => write!(f, " {:?}[{}]=?", entry.level, entry.address)?,
            }
        }

        match self.pa {
            Some(pa) => write!(f, " -> {}", pa),
            None => write!(f, " -> not present"),
        }
    }
}
