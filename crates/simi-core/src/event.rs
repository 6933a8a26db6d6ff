use serde::{Deserialize, Serialize};

use crate::{Architecture, BreakpointHandle, CpuId, MemoryAccess, ProcessorMode};

/// Events the simulator reports only while monitoring is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventMonitor {
    /// Transitions between user and kernel mode.
    ModeChange,

    /// Delivery of the exception with the given vector.
    Exception(u8),
}

/// Details of a breakpoint hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventBreakpoint {
    /// The breakpoint that fired.
    pub handle: BreakpointHandle,

    /// The accessed address, in the breakpoint's address space.
    pub address: u64,

    /// The kind of access.
    pub access: MemoryAccess,

    /// The value written, for write accesses the simulator can report.
    pub value: Option<u64>,
}

/// The reason for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventReason {
    /// A breakpoint fired.
    Breakpoint(EventBreakpoint),

    /// The processor changed privilege mode.
    ///
    /// The registers are those of the instruction that caused the
    /// transition.
    ModeChange {
        /// The mode before the transition.
        from: ProcessorMode,

        /// The mode after the transition.
        to: ProcessorMode,
    },

    /// The simulation stopped after a single step, an exhausted instruction
    /// budget or an explicit stop request.
    Stop,

    /// An exception is being delivered.
    Exception {
        /// The exception vector.
        vector: u8,
    },
}

/// An event delivered by the simulator.
///
/// The simulation is stopped for as long as the event is being handled.
#[derive(Debug, Clone, Copy)]
pub struct SimEvent<Arch>
where
    Arch: Architecture + ?Sized,
{
    /// The processor where the event occurred.
    cpu: CpuId,

    /// The CPU register state at the time of the event.
    registers: Arch::Registers,

    /// The reason for the event.
    reason: EventReason,
}

impl<Arch> SimEvent<Arch>
where
    Arch: Architecture + ?Sized,
{
    /// Creates a new event.
    pub fn new(cpu: CpuId, registers: Arch::Registers, reason: EventReason) -> Self {
        Self {
            cpu,
            registers,
            reason,
        }
    }

    /// Returns the processor where the event occurred.
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// Returns a reference to the CPU registers at the time of the event.
    pub fn registers(&self) -> &Arch::Registers {
        &self.registers
    }

    /// Returns a reference to the reason for the event.
    pub fn reason(&self) -> &EventReason {
        &self.reason
    }

    /// Returns the breakpoint details if this is a breakpoint event.
    pub fn breakpoint(&self) -> Option<&EventBreakpoint> {
        match &self.reason {
            EventReason::Breakpoint(breakpoint) => Some(breakpoint),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    /// Flags that can be set in an event response.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct SimEventResponseFlags: u8 {
        /// Keep the simulation stopped and hand control to the operator.
        const STOP = 1 << 0;

        /// Execute a single instruction and report a stop event.
        const SINGLESTEP = 1 << 1;
    }
}

/// A response to an event.
///
/// The default response resumes the simulation without a budget.
#[derive(Debug)]
pub struct SimEventResponse<Arch>
where
    Arch: Architecture + ?Sized,
{
    /// Flags associated with the response.
    pub flags: SimEventResponseFlags,

    /// Number of instructions to run before reporting a stop event.
    pub budget: Option<u64>,

    /// The registers to set before resuming.
    pub registers: Option<Arch::Registers>,
}

impl<Arch> Default for SimEventResponse<Arch>
where
    Arch: Architecture + ?Sized,
{
    fn default() -> Self {
        Self {
            flags: SimEventResponseFlags::empty(),
            budget: None,
            registers: None,
        }
    }
}

impl<Arch> SimEventResponse<Arch>
where
    Arch: Architecture + ?Sized,
{
    /// Creates a response that keeps the simulation stopped.
    pub fn stop() -> Self {
        Self::default().and_stop()
    }

    /// Creates a response that single-steps one instruction.
    pub fn singlestep() -> Self {
        Self::default().and_singlestep()
    }

    /// Creates a response that runs `instructions` before stopping again.
    pub fn run_for(instructions: u64) -> Self {
        Self::default().and_run_for(instructions)
    }

    /// Creates a response to set specific CPU registers.
    pub fn set_registers(registers: Arch::Registers) -> Self {
        Self::default().and_set_registers(registers)
    }

    /// Adds the stop flag to the response.
    pub fn and_stop(self) -> Self {
        Self {
            flags: self.flags | SimEventResponseFlags::STOP,
            ..self
        }
    }

    /// Adds the single-step flag to the response.
    pub fn and_singlestep(self) -> Self {
        Self {
            flags: self.flags | SimEventResponseFlags::SINGLESTEP,
            ..self
        }
    }

    /// Sets the instruction budget of the response.
    pub fn and_run_for(self, instructions: u64) -> Self {
        Self {
            budget: Some(instructions),
            ..self
        }
    }

    /// Sets specific CPU registers for the response.
    pub fn and_set_registers(self, registers: Arch::Registers) -> Self {
        Self {
            registers: Some(registers),
            ..self
        }
    }

    /// Checks whether the response keeps the simulation stopped.
    pub fn is_stop(&self) -> bool {
        self.flags.contains(SimEventResponseFlags::STOP)
    }
}
