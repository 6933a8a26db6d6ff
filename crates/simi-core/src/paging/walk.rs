use super::{
    EntryFlags, EntryOverride, PageTableLevel, PageTableWalk, PagingMode, RawEntry32, RawEntry64,
    TableEntry, arm, ia32e, legacy, pae,
};
use crate::{AccessContext, Pa, SimCore, SimDriver, Va};

/// Reads paging entries, honoring an optional override.
pub(super) struct EntryReader<'a, Driver>
where
    Driver: SimDriver,
{
    vmi: &'a SimCore<Driver>,
    entry_override: Option<EntryOverride>,
}

impl<Driver> EntryReader<'_, Driver>
where
    Driver: SimDriver,
{
    /// Reads the entry at `address`, or `None` if the frame is not readable.
    pub fn read(&self, address: Pa, mode: PagingMode) -> Option<u64> {
        if let Some(entry_override) = self.entry_override
            && entry_override.address == address
        {
            return Some(entry_override.value);
        }

        let ctx = AccessContext::direct(address);
        let result = match mode.entry_size() {
            4 => self.vmi.read_struct::<RawEntry32>(ctx).map(u64::from),
            _ => self.vmi.read_struct::<RawEntry64>(ctx).map(u64::from),
        };

        match result {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::debug!(%address, ?err, "paging entry not readable");
                None
            }
        }
    }
}

/// Walks `va` under `mode`, starting at `root`.
pub(crate) fn walk<Driver>(
    vmi: &SimCore<Driver>,
    va: Va,
    root: Pa,
    mode: PagingMode,
    entry_override: Option<EntryOverride>,
) -> PageTableWalk
where
    Driver: SimDriver,
{
    let reader = EntryReader {
        vmi,
        entry_override,
    };

    let mut walk = PageTableWalk::new(va, root, mode);
    match mode {
        PagingMode::Legacy32 => legacy::walk(&reader, &mut walk),
        PagingMode::Pae => pae::walk(&reader, &mut walk),
        PagingMode::Ia32e => ia32e::walk(&reader, &mut walk),
        PagingMode::ArmShort => arm::walk(&reader, &mut walk),
    }

    tracing::trace!(%walk, "walk");
    walk
}

impl PageTableWalk {
    /// Records the entry at `address` and returns it if it is present.
    pub(super) fn visit<Driver>(
        &mut self,
        reader: &EntryReader<'_, Driver>,
        level: PageTableLevel,
        address: Pa,
        decode: impl FnOnce(u64) -> EntryFlags,
    ) -> Option<(u64, EntryFlags)>
    where
        Driver: SimDriver,
    {
        let value = reader.read(address, self.mode);
        let flags = value.map(decode).unwrap_or_default();

        self.entries.push(TableEntry {
            level,
            address,
            value,
            flags,
        });

        match value {
            Some(value) if flags.contains(EntryFlags::PRESENT) => Some((value, flags)),
            _ => None,
        }
    }

    /// Marks the walk as resolved to a page of `size` bytes at `base`.
    pub(super) fn resolve(&mut self, base: u64, size: u64) {
        self.pa = Some(Pa(base | (self.va.0 & (size - 1))));
        self.page_size = Some(size);
    }
}
