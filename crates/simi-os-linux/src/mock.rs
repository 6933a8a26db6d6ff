use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, HashSet},
};

use indexmap::IndexMap;
use simi_arch_x86::{Registers, X86};
use simi_core::{
    BreakpointHandle, BreakpointRequest, CpuId, EventMonitor, Gfn, Instruction, Pa, SimCore,
    SimDriver, SimError, SimEvent, SimEventResponse, SimInfo, SimMappedPage, Va,
};

/// A simulator with paging disabled, so that virtual and physical
/// addresses coincide.
pub(crate) struct MockDriver {
    pages: RefCell<HashMap<Gfn, Vec<u8>>>,
    instructions: RefCell<HashMap<Va, Instruction>>,
    breakpoints: RefCell<IndexMap<BreakpointHandle, BreakpointRequest>>,
    next_handle: Cell<u64>,
    monitors: RefCell<HashSet<EventMonitor>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            pages: RefCell::new(HashMap::new()),
            instructions: RefCell::new(HashMap::new()),
            breakpoints: RefCell::new(IndexMap::new()),
            next_handle: Cell::new(1),
            monitors: RefCell::new(HashSet::new()),
        }
    }

    pub fn write(&self, pa: u64, bytes: &[u8]) {
        for (index, byte) in bytes.iter().enumerate() {
            let pa = pa + index as u64;
            let mut pages = self.pages.borrow_mut();
            let page = pages
                .entry(Gfn(pa >> 12))
                .or_insert_with(|| vec![0u8; 0x1000]);
            page[(pa & 0xfff) as usize] = *byte;
        }
    }

    pub fn write_u32(&self, pa: u64, value: u32) {
        self.write(pa, &value.to_le_bytes());
    }

    pub fn map_zeroed(&self, pa: u64, len: u64) {
        let mut pages = self.pages.borrow_mut();
        for gfn in (pa >> 12)..=((pa + len - 1) >> 12) {
            pages.entry(Gfn(gfn)).or_insert_with(|| vec![0u8; 0x1000]);
        }
    }

    pub fn add_instruction(&self, va: u64, length: u64, text: &str) {
        self.instructions
            .borrow_mut()
            .insert(Va(va), Instruction::new(va, length, text));
    }

    pub fn breakpoints(&self) -> Vec<(BreakpointHandle, BreakpointRequest)> {
        self.breakpoints
            .borrow()
            .iter()
            .map(|(handle, request)| (*handle, *request))
            .collect()
    }

    pub fn monitoring(&self, option: EventMonitor) -> bool {
        self.monitors.borrow().contains(&option)
    }
}

impl SimDriver for MockDriver {
    type Architecture = X86;

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

    fn registers(&self, _cpu: CpuId) -> Result<Registers, SimError> {
        Ok(Registers::default())
    }

    fn set_registers(&self, _cpu: CpuId, _registers: Registers) -> Result<(), SimError> {
        Ok(())
    }

    fn disassemble(&self, _cpu: CpuId, va: Va) -> Result<Instruction, SimError> {
        self.instructions
            .borrow()
            .get(&va)
            .cloned()
            .ok_or(SimError::page_fault((va, Pa(0))))
    }

    fn set_breakpoint(&self, request: BreakpointRequest) -> Result<BreakpointHandle, SimError> {
        let handle = BreakpointHandle(self.next_handle.get());
        self.next_handle.set(handle.0 + 1);
        self.breakpoints.borrow_mut().insert(handle, request);
        Ok(handle)
    }

    fn remove_breakpoint(&self, handle: BreakpointHandle) -> Result<(), SimError> {
        match self.breakpoints.borrow_mut().shift_remove(&handle) {
            Some(_) => Ok(()),
            None => Err(SimError::BreakpointNotFound(handle)),
        }
    }

    fn monitor_enable(&self, option: EventMonitor) -> Result<(), SimError> {
        self.monitors.borrow_mut().insert(option);
        Ok(())
    }

    fn monitor_disable(&self, option: EventMonitor) -> Result<(), SimError> {
        self.monitors.borrow_mut().remove(&option);
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
        _handler: impl FnMut(&SimEvent<X86>) -> SimEventResponse<X86>,
    ) -> Result<(), SimError> {
        Err(SimError::NotSupported)
    }
}

pub(crate) fn make_vmi(driver: MockDriver) -> SimCore<MockDriver> {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();

    let mut vmi = SimCore::new(driver).unwrap();
    vmi.disable_gfn_cache();
    vmi
}

/// Registers of a 32-bit kernel thread with paging disabled.
pub(crate) fn kernel_registers(rip: u64, rsp: u64) -> Registers {
    Registers {
        rip,
        rsp,
        cs: 0x60,
        ..Default::default()
    }
}

/// Registers of a 32-bit user thread with paging disabled.
pub(crate) fn user_registers(rip: u64, rsp: u64) -> Registers {
    Registers {
        rip,
        rsp,
        cs: 0x73,
        ..Default::default()
    }
}
