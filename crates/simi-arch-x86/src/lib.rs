//! IA-32 and x86-64 architecture definitions.

mod classify;
mod cr;
mod efer;
mod frame;
mod registers;

use simi_core::{
    Architecture, Instruction, InstructionClass, Pa, PagingMode, ProcessorMode, Va,
};

pub use self::{
    cr::{Cr0, Cr4},
    efer::MsrEfer,
    frame::{InterruptFrame32, PtRegs32},
    registers::Registers,
};

/// IA-32 / x86-64 architecture.
#[derive(Debug)]
pub struct X86;

impl Architecture for X86 {
    const PAGE_SIZE: u64 = 0x1000;
    const PAGE_SHIFT: u64 = 12;
    const PAGE_MASK: u64 = 0xFFFFFFFFFFFFF000;

    type Registers = Registers;

    fn classify_instruction(instruction: &Instruction) -> InstructionClass {
        classify::classify(instruction)
    }
}

impl X86 {
    /// Determine the paging mode of the processor based on control register
    /// values.
    ///
    /// # Paging Modes
    ///
    /// - **No Paging**: When paging is disabled (CR0.PG = 0)
    /// - **32-bit Paging**: Used when CR0.PG = 1 and CR4.PAE = 0
    /// - **PAE Paging**: Used when CR0.PG = 1, CR4.PAE = 1, and IA32_EFER.LME = 0
    /// - **4-level Paging**: Used when CR0.PG = 1, CR4.PAE = 1 and IA32_EFER.LME = 1
    ///
    /// If paging is disabled, the function returns `None`.
    pub fn paging_mode(registers: &Registers) -> Option<PagingMode> {
        if !registers.cr0.paging() {
            return None;
        }

        if !registers.cr4.physical_address_extension() {
            return Some(PagingMode::Legacy32);
        }

        if !registers.msr_efer.long_mode_enable() {
            return Some(PagingMode::Pae);
        }

        Some(PagingMode::Ia32e)
    }
}

impl simi_core::Registers for Registers {
    type Architecture = X86;

    fn instruction_pointer(&self) -> u64 {
        self.rip
    }

    fn set_instruction_pointer(&mut self, ip: u64) {
        self.rip = ip;
    }

    fn stack_pointer(&self) -> u64 {
        self.rsp
    }

    fn set_stack_pointer(&mut self, sp: u64) {
        self.rsp = sp;
    }

    fn result(&self) -> u64 {
        self.rax
    }

    fn set_result(&mut self, result: u64) {
        self.rax = result;
    }

    fn address_width(&self) -> usize {
        if self.msr_efer.long_mode_active() {
            8
        } else {
            4
        }
    }

    fn privilege(&self) -> ProcessorMode {
        match self.cs & 3 {
            0 => ProcessorMode::Kernel,
            _ => ProcessorMode::User,
        }
    }

    fn paging_mode(&self) -> Option<PagingMode> {
        X86::paging_mode(self)
    }

    fn translation_root(&self, _va: Va) -> Pa {
        Pa(self.cr3)
    }

    fn segment_base(&self) -> u64 {
        self.fs_base
    }
}

#[cfg(test)]
mod tests {
    use simi_core::Registers as _;

    use super::*;

    #[test]
    fn paging_mode_selection() {
        let mut registers = Registers::default();
        assert_eq!(registers.paging_mode(), None);

        registers.cr0 = Cr0(0x8000_0011);
        assert_eq!(registers.paging_mode(), Some(PagingMode::Legacy32));

        registers.cr4 = Cr4(1 << 5);
        assert_eq!(registers.paging_mode(), Some(PagingMode::Pae));

        registers.msr_efer = MsrEfer((1 << 8) | (1 << 10));
        assert_eq!(registers.paging_mode(), Some(PagingMode::Ia32e));
        assert_eq!(registers.address_width(), 8);
    }

    #[test]
    fn privilege_from_cs() {
        let mut registers = Registers {
            cs: 0x60,
            ..Default::default()
        };
        assert_eq!(registers.privilege(), ProcessorMode::Kernel);

        registers.cs = 0x73;
        assert_eq!(registers.privilege(), ProcessorMode::User);
    }
}
