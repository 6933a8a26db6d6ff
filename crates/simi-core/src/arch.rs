//! Architecture abstraction.
//!
//! The guest's processor family decides the page size, how register state is
//! laid out, how privilege and paging are derived from it, and how the few
//! instructions that matter for syscall boundaries are spelled by the
//! disassembler. Everything else in the workspace is written against these
//! two traits.

use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::{AccessContext, AddressContext, Gfn, Instruction, Pa, PagingMode, Va};

/// CPU architecture-specific operations and constants.
pub trait Architecture {
    /// The size of a memory page in bytes.
    ///
    /// # Architecture-specific
    ///
    /// - **x86**: `0x1000`
    /// - **ARM**: `0x1000` (small page)
    const PAGE_SIZE: u64;

    /// The number of bits to shift when converting between page numbers and
    /// physical addresses.
    const PAGE_SHIFT: u64;

    /// A bitmask used to isolate the page number from a full address.
    const PAGE_MASK: u64;

    /// The complete set of CPU registers for the architecture.
    type Registers: Registers;

    /// Converts a guest physical address (GPA) to a guest frame number (GFN).
    fn gfn_from_pa(pa: Pa) -> Gfn {
        Gfn(pa.0 >> Self::PAGE_SHIFT)
    }

    /// Converts a guest frame number (GFN) to a guest physical address (GPA).
    fn pa_from_gfn(gfn: Gfn) -> Pa {
        Pa(gfn.0 << Self::PAGE_SHIFT)
    }

    /// Extracts the offset within a page from a physical address.
    fn pa_offset(pa: Pa) -> u64 {
        pa.0 & !Self::PAGE_MASK
    }

    /// Extracts the offset within a page from a virtual address.
    fn va_offset(va: Va) -> u64 {
        va.0 & !Self::PAGE_MASK
    }

    /// Classifies a disassembled instruction by its role in syscall entry
    /// and exit.
    ///
    /// # Architecture-specific
    ///
    /// - **x86**: `int 0x80`, `sysenter`, `iretd`, `sysexit` and the
    ///   `[eax*4+disp]` table dispatch
    /// - **ARM**: `svc`/`swi`, `movs pc, lr`, `ldm ... ^` and the
    ///   `ldr pc, [..., r7, lsl #2]` table dispatch
    fn classify_instruction(instruction: &Instruction) -> InstructionClass;
}

/// Privilege level of the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessorMode {
    /// Kernel (supervisor) mode.
    Kernel,

    /// User mode.
    User,
}

/// The role an instruction plays at a user/kernel boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstructionClass {
    /// Software interrupt used as a syscall gate.
    SoftInterrupt,

    /// Fast system call entry instruction.
    FastEntry,

    /// Return from interrupt.
    InterruptReturn,

    /// Fast system call return instruction.
    FastExit,

    /// Indexed jump through the syscall table.
    SyscallTableDispatch {
        /// Signed table base as encoded in the instruction.
        displacement: i64,

        /// General-purpose register that holds the table base, when the
        /// base is not an immediate.
        base_register: Option<u8>,
    },

    /// Anything else.
    Other,
}

/// Complete set of CPU registers for a specific architecture.
pub trait Registers
where
    Self: Debug + Default + Clone + Copy,
{
    /// The specific CPU architecture implementation.
    type Architecture: Architecture + ?Sized;

    /// Returns the current value of the instruction pointer.
    ///
    /// # Architecture-specific
    ///
    /// - **x86**: `EIP`/`RIP`
    /// - **ARM**: `PC`
    fn instruction_pointer(&self) -> u64;

    /// Sets the value of the instruction pointer.
    fn set_instruction_pointer(&mut self, ip: u64);

    /// Returns the current value of the stack pointer.
    fn stack_pointer(&self) -> u64;

    /// Sets the value of the stack pointer.
    fn set_stack_pointer(&mut self, sp: u64);

    /// Returns the current value of the result register.
    ///
    /// # Architecture-specific
    ///
    /// - **x86**: `EAX`/`RAX`
    /// - **ARM**: `R0`
    fn result(&self) -> u64;

    /// Sets the value of the result register.
    fn set_result(&mut self, result: u64);

    /// Returns the address width (i.e. pointer size) in bytes.
    fn address_width(&self) -> usize;

    /// Returns the current privilege level.
    fn privilege(&self) -> ProcessorMode;

    /// Returns the paging mode in effect, or `None` when paging is off.
    fn paging_mode(&self) -> Option<PagingMode>;

    /// Returns the physical address of the root of the current page table
    /// hierarchy for a given virtual address.
    fn translation_root(&self, va: Va) -> Pa;

    /// Returns a general-purpose register by its architectural number.
    ///
    /// # Architecture-specific
    ///
    /// - **x86**: not numbered, always `None`
    /// - **ARM**: `R0` to `R15`
    fn general_purpose(&self, _index: u8) -> Option<u64> {
        None
    }

    /// Returns the base of the segment that holds per-CPU data.
    ///
    /// # Architecture-specific
    ///
    /// - **x86**: `FS` base
    /// - **ARM**: `0`
    fn segment_base(&self) -> u64;

    /// Creates an address context for a given virtual address, if paging is
    /// enabled.
    fn address_context(&self, va: Va) -> Option<AddressContext> {
        self.paging_mode()
            .map(|mode| AddressContext::new(va, self.translation_root(va), mode))
    }

    /// Creates an access context for a given virtual address.
    ///
    /// With paging off, virtual and physical addresses coincide.
    fn access_context(&self, va: Va) -> AccessContext {
        match self.address_context(va) {
            Some(ctx) => ctx.into(),
            None => AccessContext::direct(va.0),
        }
    }
}
