/// Current Program Status Register.
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct Cpsr(pub u32);

/// Processor mode encoded in `CPSR.M`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpsrMode {
    /// Unprivileged.
    User,
    /// Fast interrupt.
    Fiq,
    /// Interrupt.
    Irq,
    /// Supervisor, entered by `svc`.
    Supervisor,
    /// Abort.
    Abort,
    /// Undefined instruction.
    Undefined,
    /// Privileged, sharing the user register bank.
    System,
    /// Anything else.
    Unknown(u8),
}

impl Cpsr {
    /// Returns the processor mode.
    pub fn mode(self) -> CpsrMode {
        match (self.0 & 0x1f) as u8 {
            0x10 => CpsrMode::User,
            0x11 => CpsrMode::Fiq,
            0x12 => CpsrMode::Irq,
            0x13 => CpsrMode::Supervisor,
            0x17 => CpsrMode::Abort,
            0x1b => CpsrMode::Undefined,
            0x1f => CpsrMode::System,
            other => CpsrMode::Unknown(other),
        }
    }

    /// Checks if the processor executes in the Thumb state.
    pub fn thumb(self) -> bool {
        (self.0 >> 5) & 1 != 0
    }
}

impl std::fmt::Debug for Cpsr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Cpsr")
            .field("mode", &self.mode())
            .field("thumb", &self.thumb())
            .finish()
    }
}

impl From<u32> for Cpsr {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Cpsr> for u32 {
    fn from(value: Cpsr) -> Self {
        value.0
    }
}
