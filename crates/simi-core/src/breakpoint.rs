use serde::{Deserialize, Serialize};

use crate::{MemoryAccess, Pa, Va};

/// The address space a breakpoint is installed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressSpace {
    /// Guest physical memory.
    Physical,

    /// Guest linear (virtual) memory of the current context.
    Linear,
}

/// A request to install a breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BreakpointRequest {
    /// The address space of [`address`](Self::address).
    pub space: AddressSpace,

    /// The kind of access that triggers the breakpoint.
    pub access: MemoryAccess,

    /// The first byte covered by the breakpoint.
    pub address: u64,

    /// The number of bytes covered by the breakpoint.
    pub length: u64,
}

impl BreakpointRequest {
    /// Creates a breakpoint on guest physical memory.
    pub fn physical(pa: Pa, access: MemoryAccess, length: u64) -> Self {
        Self {
            space: AddressSpace::Physical,
            access,
            address: pa.0,
            length,
        }
    }

    /// Creates a breakpoint on guest linear memory.
    pub fn linear(va: Va, access: MemoryAccess, length: u64) -> Self {
        Self {
            space: AddressSpace::Linear,
            access,
            address: va.0,
            length,
        }
    }

    /// Creates an execution breakpoint on a single instruction.
    pub fn execute(va: Va) -> Self {
        Self::linear(va, MemoryAccess::X, 1)
    }

    /// Checks whether `address` in `space` falls inside the breakpoint.
    pub fn covers(&self, space: AddressSpace, address: u64) -> bool {
        self.space == space
            && address >= self.address
            && address - self.address < self.length.max(1)
    }
}

/// A handle to an installed breakpoint, as returned by the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BreakpointHandle(pub u64);

impl std::fmt::Display for BreakpointHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
