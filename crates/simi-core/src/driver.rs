use crate::{
    Architecture, BreakpointHandle, BreakpointRequest, CpuId, EventMonitor, Gfn, Instruction,
    SimError, SimEvent, SimEventResponse, SimInfo, SimMappedPage, Va,
};

/// A binding to a full-system simulator.
///
/// All methods are called from inside a stopped-simulation callback; the
/// target never runs concurrently with the caller.
pub trait SimDriver {
    /// The architecture of the simulated target.
    type Architecture: Architecture + ?Sized;

    /// Retrieves information about the simulated machine.
    fn info(&self) -> Result<SimInfo, SimError>;

    /// Reads a page of guest physical memory.
    ///
    /// Fails with [`SimError::Unmapped`] if the frame is not backed.
    fn read_page(&self, gfn: Gfn) -> Result<SimMappedPage, SimError>;

    /// Retrieves the registers of a specific processor.
    fn registers(
        &self,
        cpu: CpuId,
    ) -> Result<<Self::Architecture as Architecture>::Registers, SimError>;

    /// Sets the registers of a specific processor.
    fn set_registers(
        &self,
        cpu: CpuId,
        registers: <Self::Architecture as Architecture>::Registers,
    ) -> Result<(), SimError>;

    /// Disassembles the instruction at a virtual address.
    fn disassemble(&self, cpu: CpuId, va: Va) -> Result<Instruction, SimError>;

    /// Installs a breakpoint.
    fn set_breakpoint(&self, request: BreakpointRequest) -> Result<BreakpointHandle, SimError>;

    /// Removes a breakpoint.
    fn remove_breakpoint(&self, handle: BreakpointHandle) -> Result<(), SimError>;

    /// Enables monitoring of specific events.
    fn monitor_enable(&self, option: EventMonitor) -> Result<(), SimError>;

    /// Disables monitoring of specific events.
    fn monitor_disable(&self, option: EventMonitor) -> Result<(), SimError>;

    /// Asks the simulator to resume once the current callback returns.
    fn request_continue(&self) -> Result<(), SimError>;

    /// Asks the simulator to stop, reporting a stop event.
    fn request_stop(&self, reason: &str) -> Result<(), SimError>;

    /// Waits for the next event, processes it with the provided handler and
    /// applies the response.
    fn wait_for_event(
        &self,
        handler: impl FnMut(&SimEvent<Self::Architecture>) -> SimEventResponse<Self::Architecture>,
    ) -> Result<(), SimError>;
}
