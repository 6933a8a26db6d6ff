use super::Cpsr;

/// The state of the CPU registers.
///
/// The banked user-mode `SP` and `LR` are kept separately, since a syscall
/// handler runs on the supervisor bank.
#[expect(missing_docs)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Registers {
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
    pub r4: u32,
    pub r5: u32,
    pub r6: u32,
    pub r7: u32,
    pub r8: u32,
    pub r9: u32,
    pub r10: u32,
    pub r11: u32,
    pub r12: u32,
    pub sp: u32,
    pub lr: u32,
    pub pc: u32,
    pub cpsr: Cpsr,

    pub ttbr0: u32,

    pub sp_usr: u32,
    pub lr_usr: u32,
}

impl Registers {
    /// Returns a register by its architectural number.
    pub fn gpr(&self, index: u8) -> Option<u32> {
        let value = match index {
            0 => self.r0,
            1 => self.r1,
            2 => self.r2,
            3 => self.r3,
            4 => self.r4,
            5 => self.r5,
            6 => self.r6,
            7 => self.r7,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.sp,
            14 => self.lr,
            15 => self.pc,
            _ => return None,
        };

        Some(value)
    }
}
