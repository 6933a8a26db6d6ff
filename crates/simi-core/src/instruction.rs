use crate::Va;

/// A disassembled instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// The address of the instruction.
    pub address: Va,

    /// The length of the instruction in bytes.
    pub length: u64,

    /// The mnemonic followed by its operands, as printed by the simulator
    /// (for example `call dword ptr [eax*4-0x3fe8e000]`).
    pub text: String,
}

impl Instruction {
    /// Creates a new instruction.
    pub fn new(address: impl Into<Va>, length: u64, text: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            length,
            text: text.into(),
        }
    }

    /// Returns the mnemonic.
    pub fn mnemonic(&self) -> &str {
        self.text.split_whitespace().next().unwrap_or_default()
    }

    /// Returns the operands, with surrounding whitespace removed.
    pub fn operands(&self) -> &str {
        let text = self.text.trim_start();
        match text.find(char::is_whitespace) {
            Some(index) => text[index..].trim(),
            None => "",
        }
    }

    /// Returns the address of the instruction that follows this one.
    pub fn next_address(&self) -> Va {
        self.address + self.length
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}: {}", self.address, self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split() {
        let insn = Instruction::new(0xc0102a00, 7, "call dword ptr [eax*4-0x3fe8e000]");
        assert_eq!(insn.mnemonic(), "call");
        assert_eq!(insn.operands(), "dword ptr [eax*4-0x3fe8e000]");
        assert_eq!(insn.next_address(), Va(0xc0102a07));

        let insn = Instruction::new(0xc0102a00, 1, "iretd");
        assert_eq!(insn.mnemonic(), "iretd");
        assert_eq!(insn.operands(), "");
    }
}
