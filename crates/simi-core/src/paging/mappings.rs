use super::{
    EntryFlags, PageTableLevel, PagingMode, RawEntry32, RawEntry64,
    arm::{first_level_flags, second_level_flags},
    entry::x86_flags,
};
use crate::{AccessContext, Pa, SimCore, SimDriver, SimError, Va};

/// A present mapping found by scanning a whole address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageMapping {
    /// The first virtual address of the mapping.
    pub va: Va,

    /// The physical base of the mapping.
    pub pa: Pa,

    /// The size of the mapping in bytes.
    pub size: u64,

    /// The mapping allows writes.
    pub writable: bool,
}

impl PageMapping {
    fn new(va: u64, pa: u64, size: u64, flags: EntryFlags) -> Self {
        Self {
            va: Va(va),
            pa: Pa(pa),
            size,
            writable: flags.contains(EntryFlags::WRITABLE),
        }
    }
}

/// Lists present mappings below `limit`, in address order.
///
/// Tables that cannot be read are skipped.
pub(crate) fn user_mappings<Driver>(
    vmi: &SimCore<Driver>,
    mode: PagingMode,
    root: Pa,
    limit: Va,
) -> Result<Vec<PageMapping>, SimError>
where
    Driver: SimDriver,
{
    let mut result = Vec::new();

    match mode {
        PagingMode::Legacy32 => legacy(vmi, root, limit.0, &mut result)?,
        PagingMode::Pae => pae(vmi, root, limit.0, &mut result)?,
        PagingMode::ArmShort => arm(vmi, root, limit.0, &mut result)?,
        PagingMode::Ia32e => return Err(SimError::NotSupported),
    }

    Ok(result)
}

fn read_table<Driver, T>(vmi: &SimCore<Driver>, address: u64) -> Option<T>
where
    Driver: SimDriver,
    T: zerocopy::FromBytes + zerocopy::IntoBytes,
{
    match vmi.read_struct::<T>(AccessContext::direct(address)) {
        Ok(table) => Some(table),
        Err(err) => {
            tracing::debug!(address = %Pa(address), ?err, "paging table not readable");
            None
        }
    }
}

fn legacy<Driver>(
    vmi: &SimCore<Driver>,
    root: Pa,
    limit: u64,
    result: &mut Vec<PageMapping>,
) -> Result<(), SimError>
where
    Driver: SimDriver,
{
    let pd = vmi.read_struct::<[RawEntry32; 1024]>(AccessContext::direct(root.0 & 0xffff_f000))?;

    for (i, pde) in pd.iter().enumerate() {
        let va = (i as u64) << 22;
        if va >= limit {
            break;
        }

        let pde = u64::from(*pde);
        let flags = x86_flags(pde, PageTableLevel::Pd, false);
        if !flags.contains(EntryFlags::PRESENT) {
            continue;
        }

        if flags.contains(EntryFlags::LARGE) {
            result.push(PageMapping::new(va, pde & 0xffc0_0000, 0x40_0000, flags));
            continue;
        }

        let Some(pt) = read_table::<_, [RawEntry32; 1024]>(vmi, pde & 0xffff_f000) else {
            continue;
        };

        for (j, pte) in pt.iter().enumerate() {
            let va = va | (j as u64) << 12;
            if va >= limit {
                break;
            }

            let pte = u64::from(*pte);
            let flags = x86_flags(pte, PageTableLevel::Pt, false);
            if flags.contains(EntryFlags::PRESENT) {
                result.push(PageMapping::new(va, pte & 0xffff_f000, 0x1000, flags));
            }
        }
    }

    Ok(())
}

fn pae<Driver>(
    vmi: &SimCore<Driver>,
    root: Pa,
    limit: u64,
    result: &mut Vec<PageMapping>,
) -> Result<(), SimError>
where
    Driver: SimDriver,
{
    const MASK: u64 = 0x000f_ffff_ffff_f000;

    let pdpt = vmi.read_struct::<[RawEntry64; 4]>(AccessContext::direct(root.0 & 0xffff_ffe0))?;

    for (i, pdpte) in pdpt.iter().enumerate() {
        let pdpte = u64::from(*pdpte);
        let va = (i as u64) << 30;
        if va >= limit {
            break;
        }

        if pdpte & 1 == 0 {
            continue;
        }

        let Some(pd) = read_table::<_, [RawEntry64; 512]>(vmi, pdpte & MASK) else {
            continue;
        };

        for (j, pde) in pd.iter().enumerate() {
            let va = va | (j as u64) << 21;
            if va >= limit {
                break;
            }

            let pde = u64::from(*pde);
            let flags = x86_flags(pde, PageTableLevel::Pd, true);
            if !flags.contains(EntryFlags::PRESENT) {
                continue;
            }

            if flags.contains(EntryFlags::LARGE) {
                result.push(PageMapping::new(va, pde & 0x000f_ffff_ffe0_0000, 0x20_0000, flags));
                continue;
            }

            let Some(pt) = read_table::<_, [RawEntry64; 512]>(vmi, pde & MASK) else {
                continue;
            };

            for (k, pte) in pt.iter().enumerate() {
                let va = va | (k as u64) << 12;
                if va >= limit {
                    break;
                }

                let pte = u64::from(*pte);
                let flags = x86_flags(pte, PageTableLevel::Pt, true);
                if flags.contains(EntryFlags::PRESENT) {
                    result.push(PageMapping::new(va, pte & MASK, 0x1000, flags));
                }
            }
        }
    }

    Ok(())
}

fn arm<Driver>(
    vmi: &SimCore<Driver>,
    root: Pa,
    limit: u64,
    result: &mut Vec<PageMapping>,
) -> Result<(), SimError>
where
    Driver: SimDriver,
{
    let first =
        vmi.read_struct::<[RawEntry32; 4096]>(AccessContext::direct(root.0 & 0xffff_c000))?;

    for (i, fld) in first.iter().enumerate() {
        let va = (i as u64) << 20;
        if va >= limit {
            break;
        }

        let fld = u64::from(*fld);
        let flags = first_level_flags(fld);
        if !flags.contains(EntryFlags::PRESENT) {
            continue;
        }

        if flags.contains(EntryFlags::LARGE) {
            result.push(PageMapping::new(va, fld & 0xfff0_0000, 0x10_0000, flags));
            continue;
        }

        let Some(second) = read_table::<_, [RawEntry32; 256]>(vmi, fld & 0xffff_fc00) else {
            continue;
        };

        // A 64 KiB large page is replicated over 16 consecutive entries.
        let mut skip = 0;
        for (j, sld) in second.iter().enumerate() {
            if skip > 0 {
                skip -= 1;
                continue;
            }

            let va = va | (j as u64) << 12;
            if va >= limit {
                break;
            }

            let sld = u64::from(*sld);
            let flags = second_level_flags(sld);
            if !flags.contains(EntryFlags::PRESENT) {
                continue;
            }

            if flags.contains(EntryFlags::LARGE) {
                result.push(PageMapping::new(va, sld & 0xffff_0000, 0x1_0000, flags));
                skip = 15;
            } else {
                result.push(PageMapping::new(va, sld & 0xffff_f000, 0x1000, flags));
            }
        }
    }

    Ok(())
}
