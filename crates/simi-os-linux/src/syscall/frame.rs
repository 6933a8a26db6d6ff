use simi_core::Va;

/// The path a syscall took into the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyscallEntry {
    /// The fast system call instruction (`sysenter`, `syscall`).
    FastEntry,

    /// The software interrupt gate (`int 0x80`, `svc`).
    Trap,

    /// The handler reached through the syscall table.
    Computed,
}

/// The calling-convention view of a syscall at its entry point.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyscallFrame {
    /// The syscall number.
    pub callnum: u64,

    /// The first six arguments.
    pub params: [u64; 6],

    /// The user stack pointer.
    pub sp: Va,

    /// The user return address.
    pub pc: Va,
}

impl SyscallFrame {
    /// Returns the argument at `index` (zero-based), or zero when out of
    /// range.
    pub fn param(&self, index: usize) -> u64 {
        self.params.get(index).copied().unwrap_or_default()
    }
}

impl std::fmt::Display for SyscallFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "callnum: {}", self.callnum)?;
        for (index, param) in self.params.iter().enumerate() {
            write!(f, " param{}: {:#x}", index + 1, param)?;
        }
        write!(f, " sp: {} pc: {}", self.sp, self.pc)
    }
}
