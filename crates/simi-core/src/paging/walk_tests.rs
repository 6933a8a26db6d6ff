use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
};

use super::*;
use crate::{
    AccessContext, AddressContext, Architecture, BreakpointHandle, BreakpointRequest, CpuId,
    EventMonitor, EventReason, Gfn, Instruction, InstructionClass, Pa, ProcessorMode, Registers,
    SimCore, SimDriver, SimError, SimEvent, SimEventResponse, SimHandler, SimInfo, SimMappedPage,
    Va,
};

//////////////////////////////////////////////////////////////////////////////
// Mock architecture and driver
//////////////////////////////////////////////////////////////////////////////

struct MockArch;

#[derive(Debug, Default, Clone, Copy)]
struct MockRegisters;

impl Architecture for MockArch {
    const PAGE_SIZE: u64 = 0x1000;
    const PAGE_SHIFT: u64 = 12;
    const PAGE_MASK: u64 = !0xfff;

    type Registers = MockRegisters;

    fn classify_instruction(_instruction: &Instruction) -> InstructionClass {
        InstructionClass::Other
    }
}

impl Registers for MockRegisters {
    type Architecture = MockArch;

    fn instruction_pointer(&self) -> u64 {
        0
    }

    fn set_instruction_pointer(&mut self, _ip: u64) {}

    fn stack_pointer(&self) -> u64 {
        0
    }

    fn set_stack_pointer(&mut self, _sp: u64) {}

    fn result(&self) -> u64 {
        0
    }

    fn set_result(&mut self, _result: u64) {}

    fn address_width(&self) -> usize {
        4
    }

    fn privilege(&self) -> ProcessorMode {
        ProcessorMode::Kernel
    }

    fn paging_mode(&self) -> Option<PagingMode> {
        None
    }

    fn translation_root(&self, _va: Va) -> Pa {
        Pa(0)
    }

    fn segment_base(&self) -> u64 {
        0
    }
}

struct MockDriver {
    pages: RefCell<HashMap<Gfn, Vec<u8>>>,
    /// Guest stores performed while the simulation runs, one per event.
    stores: RefCell<VecDeque<(u64, u32)>>,
}

impl MockDriver {
    fn new() -> Self {
        Self {
            pages: RefCell::new(HashMap::new()),
            stores: RefCell::new(VecDeque::new()),
        }
    }

    fn queue_store(&self, pa: u64, value: u32) {
        self.stores.borrow_mut().push_back((pa, value));
    }

    fn write(&self, pa: u64, bytes: &[u8]) {
        let gfn = Gfn(pa >> 12);
        let offset = (pa & 0xfff) as usize;
        let mut pages = self.pages.borrow_mut();
        let page = pages.entry(gfn).or_insert_with(|| vec![0u8; 0x1000]);
        page[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn write_u32(&self, pa: u64, value: u32) {
        self.write(pa, &value.to_le_bytes());
    }

    fn write_u64(&self, pa: u64, value: u64) {
        self.write(pa, &value.to_le_bytes());
    }
}

impl SimDriver for MockDriver {
    type Architecture = MockArch;

    fn info(&self) -> Result<SimInfo, SimError> {
        Ok(SimInfo {
            page_size: 0x1000,
            page_shift: 12,
            max_gfn: Gfn(0xfffff),
            cpus: 1,
        })
    }

    fn read_page(&self, gfn: Gfn) -> Result<SimMappedPage, SimError> {
        match self.pages.borrow().get(&gfn) {
            Some(page) => Ok(SimMappedPage::new(page.clone())),
            None => Err(SimError::Unmapped(Pa(gfn.0 << 12))),
        }
    }

    fn registers(&self, _cpu: CpuId) -> Result<MockRegisters, SimError> {
        Ok(MockRegisters)
    }

    fn set_registers(&self, _cpu: CpuId, _registers: MockRegisters) -> Result<(), SimError> {
        Ok(())
    }

    fn disassemble(&self, _cpu: CpuId, _va: Va) -> Result<Instruction, SimError> {
        Err(SimError::NotSupported)
    }

    fn set_breakpoint(&self, _request: BreakpointRequest) -> Result<BreakpointHandle, SimError> {
        Err(SimError::NotSupported)
    }

    fn remove_breakpoint(&self, handle: BreakpointHandle) -> Result<(), SimError> {
        Err(SimError::BreakpointNotFound(handle))
    }

    fn monitor_enable(&self, _option: EventMonitor) -> Result<(), SimError> {
        Ok(())
    }

    fn monitor_disable(&self, _option: EventMonitor) -> Result<(), SimError> {
        Ok(())
    }

    fn request_continue(&self) -> Result<(), SimError> {
        Ok(())
    }

    fn request_stop(&self, _reason: &str) -> Result<(), SimError> {
        Ok(())
    }

    fn wait_for_event(
        &self,
        mut handler: impl FnMut(&SimEvent<MockArch>) -> SimEventResponse<MockArch>,
    ) -> Result<(), SimError> {
        let (pa, value) = self
            .stores
            .borrow_mut()
            .pop_front()
            .ok_or(SimError::NotSupported)?;
        self.write_u32(pa, value);

        handler(&SimEvent::new(CpuId(0), MockRegisters, EventReason::Stop));
        Ok(())
    }
}

fn make_vmi(driver: MockDriver) -> Result<SimCore<MockDriver>, SimError> {
    let mut vmi = SimCore::new(driver)?;
    vmi.disable_gfn_cache();
    Ok(vmi)
}

//////////////////////////////////////////////////////////////////////////////
// Fixtures
//////////////////////////////////////////////////////////////////////////////

/// 0x0804_8123: PDE index 0x20, PTE index 0x48.
const VA: u64 = 0x0804_8123;
const PAGE: u64 = 0x0030_0000;

const LEGACY_PD: u64 = 0x10000;
const LEGACY_PT: u64 = 0x11000;

const PAE_PDPT: u64 = 0x20000;
const PAE_PD: u64 = 0x21000;
const PAE_PT: u64 = 0x22000;

fn legacy_tables(driver: &MockDriver) {
    driver.write_u32(LEGACY_PD + 0x20 * 4, (LEGACY_PT | 0x7) as u32);
    driver.write_u32(LEGACY_PT + 0x48 * 4, (PAGE | 0x67) as u32);
}

fn pae_tables(driver: &MockDriver) {
    driver.write_u64(PAE_PDPT, PAE_PD | 0x1);
    driver.write_u64(PAE_PD + 0x40 * 8, PAE_PT | 0x7);
    driver.write_u64(PAE_PT + 0x48 * 8, PAGE | 0x67);
}

fn ctx(va: u64, root: u64, mode: PagingMode) -> AddressContext {
    AddressContext::new(va, root, mode)
}

//////////////////////////////////////////////////////////////////////////////
// 32-bit paging
//////////////////////////////////////////////////////////////////////////////

#[test]
fn legacy_resolves_small_page() -> Result<(), SimError> {
    let driver = MockDriver::new();
    legacy_tables(&driver);
    let vmi = make_vmi(driver)?;

    let walk = vmi.walk(ctx(VA, LEGACY_PD, PagingMode::Legacy32));
    assert_eq!(walk.pa(), Some(Pa(0x0030_0123)));
    assert_eq!(walk.page_size(), Some(0x1000));
    assert_eq!(walk.page_base(), Some(Pa(PAGE)));
    assert!(walk.directory_exists());
    assert!(walk.table_exists());
    assert!(walk.page_exists());
    assert_eq!(walk.directory_entry_address(), Some(Pa(LEGACY_PD + 0x80)));
    assert_eq!(walk.table_entry_address(), Some(Pa(LEGACY_PT + 0x120)));
    assert!(walk.writable());
    assert!(walk.user());
    assert!(walk.accessed());
    assert!(!walk.no_execute());
    assert!(walk.blocking_entry().is_none());

    Ok(())
}

#[test]
fn legacy_resolves_large_page() -> Result<(), SimError> {
    let driver = MockDriver::new();
    driver.write_u32(LEGACY_PD + 0x20 * 4, 0x0080_0000 | 0x83);
    let vmi = make_vmi(driver)?;

    let walk = vmi.walk(ctx(VA, LEGACY_PD, PagingMode::Legacy32));
    assert_eq!(walk.pa(), Some(Pa(0x0080_0000 | (VA & 0x3f_ffff))));
    assert_eq!(walk.page_size(), Some(0x40_0000));
    assert_eq!(walk.entries().len(), 1);
    assert!(walk.entries()[0].is_leaf());

    Ok(())
}

#[test]
fn walk_is_idempotent() -> Result<(), SimError> {
    let driver = MockDriver::new();
    legacy_tables(&driver);
    pae_tables(&driver);
    let vmi = make_vmi(driver)?;

    for va in [VA, VA + 0x1000, 0xc000_0000, 0] {
        for (root, mode) in [
            (LEGACY_PD, PagingMode::Legacy32),
            (PAE_PDPT, PagingMode::Pae),
        ] {
            let first = vmi.walk(ctx(va, root, mode));
            let second = vmi.walk(ctx(va, root, mode));
            assert_eq!(first, second);
        }
    }

    Ok(())
}

#[test]
fn legacy_and_pae_agree_on_equivalent_tables() -> Result<(), SimError> {
    let driver = MockDriver::new();
    legacy_tables(&driver);
    pae_tables(&driver);
    let vmi = make_vmi(driver)?;

    let legacy = vmi.walk(ctx(VA, LEGACY_PD, PagingMode::Legacy32));
    let pae = vmi.walk(ctx(VA, PAE_PDPT, PagingMode::Pae));

    assert_eq!(legacy.pa(), Some(Pa(0x0030_0123)));
    assert_eq!(legacy.pa(), pae.pa());
    assert_eq!(legacy.writable(), pae.writable());
    assert_eq!(legacy.user(), pae.user());

    Ok(())
}

#[test]
fn missing_pte_reports_deepest_level() -> Result<(), SimError> {
    let driver = MockDriver::new();
    driver.write_u32(LEGACY_PD + 0x20 * 4, (LEGACY_PT | 0x7) as u32);
    driver.write_u32(LEGACY_PT, 0);
    let vmi = make_vmi(driver)?;

    let walk = vmi.walk(ctx(VA, LEGACY_PD, PagingMode::Legacy32));
    assert!(!walk.is_resolved());
    assert!(walk.table_exists());
    assert!(!walk.page_exists());

    let blocking = walk.blocking_entry().ok_or(SimError::Other("no blocking entry"))?;
    assert_eq!(blocking.level, PageTableLevel::Pt);
    assert_eq!(blocking.address, Pa(LEGACY_PT + 0x120));
    assert_eq!(blocking.value, Some(0));

    assert!(matches!(
        vmi.translate_address(ctx(VA, LEGACY_PD, PagingMode::Legacy32)),
        Err(SimError::PageFault(_))
    ));

    Ok(())
}

#[test]
fn unreadable_table_stops_walk() -> Result<(), SimError> {
    let driver = MockDriver::new();
    // The page table frame is not backed.
    driver.write_u32(LEGACY_PD + 0x20 * 4, 0x0077_7000 | 0x7);
    let vmi = make_vmi(driver)?;

    let walk = vmi.walk(ctx(VA, LEGACY_PD, PagingMode::Legacy32));
    assert!(!walk.is_resolved());
    assert!(walk.table_exists());

    let blocking = walk.blocking_entry().ok_or(SimError::Other("no blocking entry"))?;
    assert_eq!(blocking.level, PageTableLevel::Pt);
    assert_eq!(blocking.value, None);

    Ok(())
}

#[test]
fn override_replaces_guest_value() -> Result<(), SimError> {
    let driver = MockDriver::new();
    driver.write_u32(LEGACY_PD + 0x20 * 4, (LEGACY_PT | 0x7) as u32);
    driver.write_u32(LEGACY_PT, 0);
    let vmi = make_vmi(driver)?;

    let pte = EntryOverride::new(Pa(LEGACY_PT + 0x120), PAGE | 0x7);
    let walk = vmi.walk_with(ctx(VA, LEGACY_PD, PagingMode::Legacy32), pte);
    assert_eq!(walk.pa(), Some(Pa(0x0030_0123)));

    // Guest memory itself is untouched.
    assert!(!vmi.walk(ctx(VA, LEGACY_PD, PagingMode::Legacy32)).is_resolved());

    Ok(())
}

//////////////////////////////////////////////////////////////////////////////
// PAE and 4-level paging
//////////////////////////////////////////////////////////////////////////////

#[test]
fn pae_reports_no_execute() -> Result<(), SimError> {
    let driver = MockDriver::new();
    pae_tables(&driver);
    driver.write_u64(PAE_PT + 0x48 * 8, PAGE | 0x5 | (1 << 63));
    let vmi = make_vmi(driver)?;

    let walk = vmi.walk(ctx(VA, PAE_PDPT, PagingMode::Pae));
    assert_eq!(walk.pa(), Some(Pa(0x0030_0123)));
    assert!(walk.no_execute());
    assert!(!walk.writable());

    Ok(())
}

#[test]
fn pae_missing_pointer_entry() -> Result<(), SimError> {
    let driver = MockDriver::new();
    driver.write_u64(PAE_PDPT, 0);
    let vmi = make_vmi(driver)?;

    let walk = vmi.walk(ctx(VA, PAE_PDPT, PagingMode::Pae));
    assert!(!walk.directory_exists());
    assert!(!walk.table_exists());
    assert_eq!(
        walk.blocking_entry().map(|entry| entry.level),
        Some(PageTableLevel::Pdpt)
    );

    Ok(())
}

#[test]
fn ia32e_resolves_small_and_large_pages() -> Result<(), SimError> {
    let driver = MockDriver::new();
    driver.write_u64(0x1000 + 8, 0x2000 | 0x7);
    driver.write_u64(0x2000 + 8, 0x3000 | 0x7);
    driver.write_u64(0x3000 + 8, 0x4000 | 0x7);
    driver.write_u64(0x4000 + 3 * 8, 0x5000 | 0x7);
    driver.write_u64(0x3000 + 2 * 8, 0x0020_0000 | 0x87);
    let vmi = make_vmi(driver)?;

    let base = (1u64 << 39) | (1 << 30);

    let small = vmi.walk(ctx(base | (1 << 21) | (3 << 12) | 0x123, 0x1000, PagingMode::Ia32e));
    assert_eq!(small.pa(), Some(Pa(0x5123)));
    assert_eq!(small.entries().len(), 4);

    let large = vmi.walk(ctx(base | (2 << 21) | 0x1_2345, 0x1000, PagingMode::Ia32e));
    assert_eq!(large.pa(), Some(Pa(0x0021_2345)));
    assert_eq!(large.page_size(), Some(0x20_0000));
    assert_eq!(large.entries().len(), 3);

    Ok(())
}

//////////////////////////////////////////////////////////////////////////////
// ARM short descriptors
//////////////////////////////////////////////////////////////////////////////

const TTBR: u64 = 0x4000;

#[test]
fn arm_resolves_small_page_and_section() -> Result<(), SimError> {
    let driver = MockDriver::new();
    driver.write_u32(TTBR + 4 * 4, 0x0005_0001);
    driver.write_u32(0x0005_0000 + 2 * 4, 0x0060_0032);
    driver.write_u32(TTBR + 5 * 4, 0x0070_0c02);
    let vmi = make_vmi(driver)?;

    let small = vmi.walk(ctx(0x0040_2345, TTBR, PagingMode::ArmShort));
    assert_eq!(small.pa(), Some(Pa(0x0060_0345)));
    assert!(small.writable());
    assert!(small.user());
    assert!(!small.no_execute());

    let section = vmi.walk(ctx(0x0050_1234, TTBR, PagingMode::ArmShort));
    assert_eq!(section.pa(), Some(Pa(0x0070_1234)));
    assert_eq!(section.page_size(), Some(0x10_0000));

    let missing = vmi.walk(ctx(0x0060_0000, TTBR, PagingMode::ArmShort));
    assert!(!missing.table_exists());
    assert_eq!(
        missing.directory_entry_address(),
        Some(Pa(TTBR + 6 * 4))
    );

    Ok(())
}

#[test]
fn arm_permissions_without_accessed_flag() -> Result<(), SimError> {
    let driver = MockDriver::new();
    // Section, AP = 2: user read-only.
    driver.write_u32(TTBR + 4 * 4, 0x0040_0802);
    // Section, AP = 1: kernel only.
    driver.write_u32(TTBR + 5 * 4, 0x0050_0402);
    let vmi = make_vmi(driver)?;

    let read_only = vmi.walk(ctx(0x0040_0010, TTBR, PagingMode::ArmShort));
    assert_eq!(read_only.pa(), Some(Pa(0x0040_0010)));
    assert!(read_only.user());
    assert!(!read_only.writable());
    assert!(!read_only.accessed());

    let kernel = vmi.walk(ctx(0x0050_0010, TTBR, PagingMode::ArmShort));
    assert!(kernel.is_resolved());
    assert!(!kernel.user());
    assert!(!kernel.accessed());

    Ok(())
}

//////////////////////////////////////////////////////////////////////////////
// Address space enumeration
//////////////////////////////////////////////////////////////////////////////

#[test]
fn legacy_user_mappings_stop_at_limit() -> Result<(), SimError> {
    let driver = MockDriver::new();
    legacy_tables(&driver);
    driver.write_u32(LEGACY_PT + 0x49 * 4, (0x0030_1000 | 0x5) as u32);
    // Kernel half, above the limit.
    driver.write_u32(LEGACY_PD + 0x300 * 4, 0x0100_0000 | 0x83);
    let vmi = make_vmi(driver)?;

    let mappings = vmi.user_mappings(PagingMode::Legacy32, Pa(LEGACY_PD), Va(0xc000_0000))?;
    assert_eq!(mappings.len(), 2);
    assert_eq!(mappings[0].va, Va(0x0804_8000));
    assert_eq!(mappings[0].pa, Pa(PAGE));
    assert!(mappings[0].writable);
    assert_eq!(mappings[1].va, Va(0x0804_9000));
    assert!(!mappings[1].writable);

    assert!(matches!(
        vmi.user_mappings(PagingMode::Ia32e, Pa(0x1000), Va(0xc000_0000)),
        Err(SimError::NotSupported)
    ));

    Ok(())
}

//////////////////////////////////////////////////////////////////////////////
// Event loop and reads
//////////////////////////////////////////////////////////////////////////////

const COUNTER: u64 = 0x4000;

struct CounterSampler {
    seen: Vec<u32>,
    wanted: usize,
}

impl SimHandler<MockDriver> for CounterSampler {
    type Output = Vec<u32>;

    fn handle_event(
        &mut self,
        vmi: &SimCore<MockDriver>,
        _event: &SimEvent<MockArch>,
    ) -> SimEventResponse<MockArch> {
        if let Ok(value) = vmi.read_u32(AccessContext::direct(COUNTER)) {
            self.seen.push(value);
        }

        SimEventResponse::default()
    }

    fn check_completion(&self) -> Option<Vec<u32>> {
        (self.seen.len() >= self.wanted).then(|| self.seen.clone())
    }
}

#[test]
fn run_sees_guest_stores_through_the_cache() -> Result<(), SimError> {
    let driver = MockDriver::new();
    driver.write_u32(COUNTER, 0);
    for value in 1..=3 {
        driver.queue_store(COUNTER, value);
    }

    let vmi = SimCore::new(driver)?.with_gfn_cache(4);
    assert_eq!(vmi.info()?.page_shift, 12);

    // Pulls the frame into the cache before the guest runs.
    assert_eq!(vmi.read_u32(AccessContext::direct(COUNTER))?, 0);

    let mut sampler = CounterSampler {
        seen: Vec::new(),
        wanted: 3,
    };
    assert_eq!(vmi.run(&mut sampler)?, vec![1, 2, 3]);

    Ok(())
}

#[test]
fn run_stops_on_driver_failure() -> Result<(), SimError> {
    let driver = MockDriver::new();
    driver.queue_store(COUNTER, 7);
    let vmi = make_vmi(driver)?;

    let mut sampler = CounterSampler {
        seen: Vec::new(),
        wanted: 2,
    };
    assert!(matches!(vmi.run(&mut sampler), Err(SimError::NotSupported)));
    assert_eq!(sampler.seen, vec![7]);

    Ok(())
}

#[test]
fn strings_respect_the_configured_limit() -> Result<(), SimError> {
    let driver = MockDriver::new();
    driver.write(0x5000, b"/bin/busybox\0");
    // Ends on the last byte of a frame whose successor is not backed.
    driver.write(0x6ffd, b"sh\0");
    driver.write(0xaffe, b"xy");
    let vmi = make_vmi(driver)?.with_read_string_length_limit(4);

    assert_eq!(vmi.read_string(AccessContext::direct(0x5000u64))?, "/bin");
    assert_eq!(
        vmi.read_string_limited(AccessContext::direct(0x5000u64), 64)?,
        "/bin/busybox"
    );
    assert_eq!(
        vmi.read_string_limited(AccessContext::direct(0x6ffdu64), 64)?,
        "sh"
    );
    assert!(matches!(
        vmi.read_string_limited(AccessContext::direct(0xaffeu64), 8),
        Err(SimError::Unmapped(Pa(0xb000)))
    ));

    Ok(())
}

#[test]
fn reads_cross_frame_boundaries() -> Result<(), SimError> {
    let driver = MockDriver::new();
    driver.write(0x8ffe, &[0x11, 0x22]);
    driver.write(0x9000, &[0x33, 0x44]);
    let vmi = make_vmi(driver)?;

    assert_eq!(vmi.read_u32(AccessContext::direct(0x8ffeu64))?, 0x4433_2211);
    assert_eq!(vmi.read_uint(AccessContext::direct(0x9001u64), 1)?, 0x44);
    assert!(matches!(
        vmi.read_uint(AccessContext::direct(0x9000u64), 3),
        Err(SimError::InvalidAddressWidth)
    ));

    Ok(())
}
