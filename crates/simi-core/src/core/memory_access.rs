use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Kind of access a breakpoint triggers on.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MemoryAccess: u8 {
        /// Read access.
        const R = 0b00000001;

        /// Write access.
        const W = 0b00000010;

        /// Instruction fetch.
        const X = 0b00000100;

        /// Read or write.
        const RW = Self::R.bits() | Self::W.bits();

        /// Any access.
        const RWX = Self::R.bits() | Self::W.bits() | Self::X.bits();
    }
}

impl std::fmt::Display for MemoryAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let flag = |access, c| if self.contains(access) { c } else { '-' };

        write!(
            f,
            "{}{}{}",
            flag(MemoryAccess::R, 'r'),
            flag(MemoryAccess::W, 'w'),
            flag(MemoryAccess::X, 'x')
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(MemoryAccess::RW.to_string(), "rw-");
        assert_eq!(MemoryAccess::X.to_string(), "--x");
        assert_eq!(MemoryAccess::empty().to_string(), "---");
    }
}
