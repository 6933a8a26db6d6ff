use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// The frame pushed by the processor on an interrupt from user mode in
/// 32-bit protected mode.
///
/// At the first instruction of an interrupt gate the kernel stack pointer
/// addresses this frame, so the user return address and user stack pointer
/// are recovered from it.
#[expect(missing_docs)]
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct InterruptFrame32 {
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

impl InterruptFrame32 {
    /// Checks whether the frame returns to user mode (CPL 3).
    pub fn returns_to_user(&self) -> bool {
        self.cs & 3 == 3
    }
}

/// The register image the 32-bit kernel saves on syscall entry
/// (`struct pt_regs`).
///
/// Once the entry stub has dispatched through the syscall table, the
/// handler's first stack argument points at this structure.
#[expect(missing_docs)]
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PtRegs32 {
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub eax: u32,
    pub ds: u32,
    pub es: u32,
    pub fs: u32,
    pub gs: u32,
    pub orig_eax: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}
