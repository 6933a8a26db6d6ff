//! ARMv7 architecture definitions.

mod classify;
mod cpsr;
mod registers;

use simi_core::{
    Architecture, Instruction, InstructionClass, Pa, PagingMode, ProcessorMode, Va,
};

pub use self::{
    cpsr::{Cpsr, CpsrMode},
    registers::Registers,
};

/// ARMv7 architecture with short-descriptor translation tables.
#[derive(Debug)]
pub struct Arm;

impl Architecture for Arm {
    const PAGE_SIZE: u64 = 0x1000;
    const PAGE_SHIFT: u64 = 12;
    const PAGE_MASK: u64 = 0xFFFFF000;

    type Registers = Registers;

    fn classify_instruction(instruction: &Instruction) -> InstructionClass {
        classify::classify(instruction)
    }
}

impl simi_core::Registers for Registers {
    type Architecture = Arm;

    fn instruction_pointer(&self) -> u64 {
        self.pc as u64
    }

    fn set_instruction_pointer(&mut self, ip: u64) {
        self.pc = ip as u32;
    }

    fn stack_pointer(&self) -> u64 {
        self.sp as u64
    }

    fn set_stack_pointer(&mut self, sp: u64) {
        self.sp = sp as u32;
    }

    fn result(&self) -> u64 {
        self.r0 as u64
    }

    fn set_result(&mut self, result: u64) {
        self.r0 = result as u32;
    }

    fn address_width(&self) -> usize {
        4
    }

    fn privilege(&self) -> ProcessorMode {
        match self.cpsr.mode() {
            CpsrMode::User => ProcessorMode::User,
            _ => ProcessorMode::Kernel,
        }
    }

    fn paging_mode(&self) -> Option<PagingMode> {
        Some(PagingMode::ArmShort)
    }

    fn translation_root(&self, _va: Va) -> Pa {
        Pa(self.ttbr0 as u64)
    }

    fn general_purpose(&self, index: u8) -> Option<u64> {
        self.gpr(index).map(u64::from)
    }

    fn segment_base(&self) -> u64 {
        0
    }
}

#[cfg(test)]
mod tests {
    use simi_core::Registers as _;

    use super::*;

    #[test]
    fn privilege_from_cpsr() {
        let mut registers = Registers {
            cpsr: Cpsr(0x6000_0013),
            ..Default::default()
        };
        assert_eq!(registers.privilege(), ProcessorMode::Kernel);

        registers.cpsr = Cpsr(0x6000_0010);
        assert_eq!(registers.privilege(), ProcessorMode::User);
        assert_eq!(registers.paging_mode(), Some(PagingMode::ArmShort));
    }

    #[test]
    fn numbered_registers() {
        let registers = Registers {
            r7: 5,
            r8: 0xc000_f000,
            ..Default::default()
        };
        assert_eq!(registers.general_purpose(7), Some(5));
        assert_eq!(registers.general_purpose(8), Some(0xc000_f000));
        assert_eq!(registers.general_purpose(16), None);
    }
}
