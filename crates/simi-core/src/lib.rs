//! Core functionality for introspecting a guest inside a full-system
//! simulator.
//!
//! The simulator is reached through a [`SimDriver`]. [`SimCore`] layers
//! typed memory access and virtual address translation on top of it, and
//! runs [`SimHandler`]s against the events the simulator delivers.

pub mod arch;
mod breakpoint;
mod core;
mod driver;
mod error;
mod event;
mod handler;
mod instruction;
mod page;
pub mod paging;
mod struct_reader;
pub mod watch;

use std::{cell::RefCell, num::NonZeroUsize};

use lru::LruCache;
use zerocopy::{FromBytes, IntoBytes};

pub use self::{
    arch::{Architecture, InstructionClass, ProcessorMode, Registers},
    breakpoint::{AddressSpace, BreakpointHandle, BreakpointRequest},
    core::{AccessContext, AddressContext, CpuId, Gfn, MemoryAccess, Pa, SimInfo, Va},
    driver::SimDriver,
    error::{PageFault, PageFaults, SimError},
    event::{
        EventBreakpoint, EventMonitor, EventReason, SimEvent, SimEventResponse,
        SimEventResponseFlags,
    },
    handler::SimHandler,
    instruction::Instruction,
    page::SimMappedPage,
    paging::{EntryOverride, PageMapping, PageTableLevel, PageTableWalk, PagingMode},
    struct_reader::{Field, StructReader},
};

const DEFAULT_GFN_CACHE_SIZE: usize = 8192;

fn gfn_cache(size: usize) -> RefCell<LruCache<Gfn, SimMappedPage>> {
    RefCell::new(LruCache::new(
        NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN),
    ))
}

/// A simulator session with typed guest memory access.
///
/// Frames are cached between simulator callbacks. The guest may have run
/// since the last callback, so [`run`] drops the cache before each event.
///
/// [`run`]: Self::run
pub struct SimCore<Driver>
where
    Driver: SimDriver,
{
    driver: Driver,
    gfn_cache: RefCell<LruCache<Gfn, SimMappedPage>>,
    read_page_fn: fn(&Self, Gfn) -> Result<SimMappedPage, SimError>,
    string_limit: Option<usize>,
}

impl<Driver> SimCore<Driver>
where
    Driver: SimDriver,
{
    /// Wraps `driver` with an 8192-frame cache and no string limit.
    pub fn new(driver: Driver) -> Result<Self, SimError> {
        Ok(Self {
            driver,
            gfn_cache: gfn_cache(DEFAULT_GFN_CACHE_SIZE),
            read_page_fn: Self::read_page_cache,
            string_limit: None,
        })
    }

    /// Replaces the frame cache with one holding `size` frames (at least
    /// one).
    pub fn with_gfn_cache(self, size: usize) -> Self {
        Self {
            gfn_cache: gfn_cache(size),
            read_page_fn: Self::read_page_cache,
            ..self
        }
    }

    /// Sends every frame read straight to the simulator.
    pub fn disable_gfn_cache(&mut self) {
        self.read_page_fn = Self::read_page_nocache;
    }

    /// Drops every cached frame.
    pub fn flush_gfn_cache(&self) {
        self.gfn_cache.borrow_mut().clear();
    }

    /// Caps [`read_string`] at `limit` bytes.
    ///
    /// [`read_string`]: Self::read_string
    pub fn with_read_string_length_limit(self, limit: usize) -> Self {
        Self {
            string_limit: Some(limit),
            ..self
        }
    }

    /// The simulator binding.
    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    /// Page geometry, RAM size and processor count.
    pub fn info(&self) -> Result<SimInfo, SimError> {
        self.driver.info()
    }

    /// Reads the register file of `cpu`.
    pub fn registers(
        &self,
        cpu: CpuId,
    ) -> Result<<Driver::Architecture as Architecture>::Registers, SimError> {
        self.driver.registers(cpu)
    }

    /// Overwrites the register file of `cpu`.
    pub fn set_registers(
        &self,
        cpu: CpuId,
        registers: <Driver::Architecture as Architecture>::Registers,
    ) -> Result<(), SimError> {
        self.driver.set_registers(cpu, registers)
    }

    /// Disassembles the instruction at `va` on `cpu` and sorts it into the
    /// classes the trackers care about.
    pub fn classify(&self, cpu: CpuId, va: Va) -> Result<(Instruction, InstructionClass), SimError> {
        let instruction = self.driver.disassemble(cpu, va)?;
        let class = Driver::Architecture::classify_instruction(&instruction);
        Ok((instruction, class))
    }

    /// Installs a breakpoint and returns the simulator's handle for it.
    pub fn set_breakpoint(&self, request: BreakpointRequest) -> Result<BreakpointHandle, SimError> {
        self.driver.set_breakpoint(request)
    }

    /// Removes a breakpoint installed by [`set_breakpoint`].
    ///
    /// [`set_breakpoint`]: Self::set_breakpoint
    pub fn remove_breakpoint(&self, handle: BreakpointHandle) -> Result<(), SimError> {
        self.driver.remove_breakpoint(handle)
    }

    /// Starts delivering `option` events.
    pub fn monitor_enable(&self, option: EventMonitor) -> Result<(), SimError> {
        self.driver.monitor_enable(option)
    }

    /// Stops delivering `option` events.
    pub fn monitor_disable(&self, option: EventMonitor) -> Result<(), SimError> {
        self.driver.monitor_disable(option)
    }

    /// Resumes the simulation once the current callback returns.
    pub fn request_continue(&self) -> Result<(), SimError> {
        self.driver.request_continue()
    }

    /// Halts the simulation and hands control to the operator.
    pub fn request_stop(&self, reason: &str) -> Result<(), SimError> {
        self.driver.request_stop(reason)
    }

    /// Runs the simulation until the next callback and passes it to
    /// `handler`.
    pub fn wait_for_event(
        &self,
        handler: impl FnMut(&SimEvent<Driver::Architecture>) -> SimEventResponse<Driver::Architecture>,
    ) -> Result<(), SimError> {
        self.driver.wait_for_event(handler)
    }

    /// Feeds callbacks to `handler` until it reports completion or the
    /// simulator fails.
    pub fn run<Handler>(&self, handler: &mut Handler) -> Result<Handler::Output, SimError>
    where
        Handler: SimHandler<Driver>,
    {
        loop {
            self.driver.wait_for_event(|event| {
                self.flush_gfn_cache();
                handler.handle_event(self, event)
            })?;

            if let Some(output) = handler.check_completion() {
                return Ok(output);
            }
        }
    }

    /// Fills `buffer` from guest memory, crossing frame boundaries as
    /// needed.
    pub fn read(&self, ctx: impl Into<AccessContext>, buffer: &mut [u8]) -> Result<(), SimError> {
        let ctx = ctx.into();
        let mut done = 0;

        while done < buffer.len() {
            let pa = self.translate_access_context(ctx + done as u64)?;
            let offset = Driver::Architecture::pa_offset(pa) as usize;
            let page = self.read_page(Driver::Architecture::gfn_from_pa(pa))?;

            let available = page.get(offset..).ok_or(SimError::OutOfBounds)?;
            let size = usize::min(buffer.len() - done, available.len());
            if size == 0 {
                return Err(SimError::OutOfBounds);
            }

            buffer[done..done + size].copy_from_slice(&available[..size]);
            done += size;
        }

        Ok(())
    }

    /// Reads a little-endian `u16`.
    pub fn read_u16(&self, ctx: impl Into<AccessContext>) -> Result<u16, SimError> {
        Ok(u16::from_le_bytes(self.read_array(ctx)?))
    }

    /// Reads a little-endian `u32`.
    pub fn read_u32(&self, ctx: impl Into<AccessContext>) -> Result<u32, SimError> {
        Ok(u32::from_le_bytes(self.read_array(ctx)?))
    }

    /// Reads a little-endian `u64`.
    pub fn read_u64(&self, ctx: impl Into<AccessContext>) -> Result<u64, SimError> {
        Ok(u64::from_le_bytes(self.read_array(ctx)?))
    }

    /// Reads a little-endian integer of 1, 2, 4 or 8 bytes.
    pub fn read_uint(&self, ctx: impl Into<AccessContext>, size: usize) -> Result<u64, SimError> {
        match size {
            1 => Ok(u64::from(self.read_array::<1>(ctx)?[0])),
            2 => self.read_u16(ctx).map(u64::from),
            4 => self.read_u32(ctx).map(u64::from),
            8 => self.read_u64(ctx),
            _ => Err(SimError::InvalidAddressWidth),
        }
    }

    /// Reads a guest pointer of `address_width` bytes (4 or 8).
    pub fn read_va(
        &self,
        ctx: impl Into<AccessContext>,
        address_width: usize,
    ) -> Result<Va, SimError> {
        match address_width {
            4 => self.read_va32(ctx),
            8 => self.read_u64(ctx).map(Va),
            _ => Err(SimError::InvalidAddressWidth),
        }
    }

    /// Reads a 32-bit guest pointer.
    pub fn read_va32(&self, ctx: impl Into<AccessContext>) -> Result<Va, SimError> {
        self.read_u32(ctx).map(|value| Va(u64::from(value)))
    }

    /// Reads a NUL-terminated string of at most `limit` bytes.
    ///
    /// Reads one frame at a time, so a string that ends just before an
    /// unmapped page is still returned. Invalid UTF-8 is replaced.
    pub fn read_string_limited(
        &self,
        ctx: impl Into<AccessContext>,
        limit: usize,
    ) -> Result<String, SimError> {
        let mut ctx = ctx.into();
        let mut bytes = Vec::new();

        while bytes.len() < limit {
            let in_page = Driver::Architecture::PAGE_SIZE
                - (ctx.address() & !Driver::Architecture::PAGE_MASK);
            let chunk = usize::min(in_page as usize, limit - bytes.len());

            let mut buffer = vec![0u8; chunk];
            self.read(ctx, &mut buffer)?;

            if let Some(end) = buffer.iter().position(|&b| b == 0) {
                bytes.extend_from_slice(&buffer[..end]);
                break;
            }

            bytes.extend_from_slice(&buffer);
            ctx += chunk as u64;
        }

        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Reads a NUL-terminated string, bounded by the configured limit.
    pub fn read_string(&self, ctx: impl Into<AccessContext>) -> Result<String, SimError> {
        self.read_string_limited(ctx, self.string_limit.unwrap_or(usize::MAX))
    }

    /// Reads a plain-data structure in one piece.
    pub fn read_struct<T>(&self, ctx: impl Into<AccessContext>) -> Result<T, SimError>
    where
        T: FromBytes + IntoBytes,
    {
        let mut result = T::new_zeroed();
        self.read(ctx, result.as_mut_bytes())?;
        Ok(result)
    }

    fn read_array<const N: usize>(
        &self,
        ctx: impl Into<AccessContext>,
    ) -> Result<[u8; N], SimError> {
        let mut buffer = [0u8; N];
        self.read(ctx, &mut buffer)?;
        Ok(buffer)
    }

    /// Walks the page tables for `ctx.va`.
    pub fn walk(&self, ctx: impl Into<AddressContext>) -> PageTableWalk {
        let ctx = ctx.into();
        paging::walk(self, ctx.va, ctx.root, ctx.mode, None)
    }

    /// Walks as [`walk`] does, but reads `entry_override` in place of the
    /// guest's entry at its address. Used to see what a pending page table
    /// write would map.
    ///
    /// [`walk`]: Self::walk
    pub fn walk_with(
        &self,
        ctx: impl Into<AddressContext>,
        entry_override: EntryOverride,
    ) -> PageTableWalk {
        let ctx = ctx.into();
        paging::walk(self, ctx.va, ctx.root, ctx.mode, Some(entry_override))
    }

    /// Lists present mappings below `limit` in the address space rooted at
    /// `root`.
    pub fn user_mappings(
        &self,
        mode: PagingMode,
        root: Pa,
        limit: Va,
    ) -> Result<Vec<PageMapping>, SimError> {
        paging::user_mappings(self, mode, root, limit)
    }

    /// Translates a virtual address, or reports the page fault.
    pub fn translate_address(&self, ctx: impl Into<AddressContext>) -> Result<Pa, SimError> {
        let ctx = ctx.into();
        self.walk(ctx)
            .pa()
            .ok_or_else(|| SimError::page_fault((ctx.va, ctx.root)))
    }

    /// Resolves `ctx` to the physical address it reads from.
    pub fn translate_access_context(&self, ctx: AccessContext) -> Result<Pa, SimError> {
        match ctx {
            AccessContext::Physical(pa) => Ok(pa),
            AccessContext::Virtual(ctx) => self.translate_address(ctx),
        }
    }

    /// Reads one frame, through the cache unless it is disabled.
    pub fn read_page(&self, gfn: Gfn) -> Result<SimMappedPage, SimError> {
        (self.read_page_fn)(self, gfn)
    }

    fn read_page_nocache(&self, gfn: Gfn) -> Result<SimMappedPage, SimError> {
        self.driver.read_page(gfn)
    }

    fn read_page_cache(&self, gfn: Gfn) -> Result<SimMappedPage, SimError> {
        let mut cache = self.gfn_cache.borrow_mut();
        let page = cache.try_get_or_insert(gfn, || self.read_page_nocache(gfn))?;
        Ok(page.clone())
    }
}
