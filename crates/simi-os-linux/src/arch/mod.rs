#[cfg(feature = "arch-arm")]
mod arm;
#[cfg(feature = "arch-x86")]
mod x86;

use simi_core::{Architecture, SimCore, SimDriver, SimError, Va};

use crate::{SyscallEntry, SyscallFrame};

/// Architecture-specific knowledge of the Linux kernel.
pub trait ArchAdapter<Driver>: Architecture
where
    Driver: SimDriver<Architecture = Self>,
{
    /// Reads the task pointer from the `thread_info` at the bottom of the
    /// kernel stack.
    ///
    /// Only meaningful while the processor runs in kernel mode on a
    /// kernel stack of `thread_size` bytes.
    fn current_task_hint(
        vmi: &SimCore<Driver>,
        registers: &<Self as Architecture>::Registers,
        thread_size: u64,
    ) -> Result<Va, SimError>;

    /// Reads the syscall frame at an entry point.
    fn syscall_frame(
        vmi: &SimCore<Driver>,
        registers: &<Self as Architecture>::Registers,
        entry: SyscallEntry,
    ) -> Result<SyscallFrame, SimError>;

    /// Checks whether the interrupt return about to execute returns into the
    /// kernel, i.e. ends a nested interrupt rather than a syscall.
    fn returns_to_kernel(
        vmi: &SimCore<Driver>,
        registers: &<Self as Architecture>::Registers,
        kernel_base: Va,
    ) -> Result<bool, SimError>;
}
