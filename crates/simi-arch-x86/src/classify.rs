use std::sync::LazyLock;

use regex::Regex;
use simi_core::{Instruction, InstructionClass};

/// `call dword ptr [eax*4-0x3fe8e000]`, `mov eax,dword ptr [eax*4+0xc1234560]`
/// and the 64-bit `[rax*8+...]` variants.
static TABLE_DISPATCH: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"^(?:call|jmp|mov)\b[^\[]*\[\s*[er]ax\s*\*\s*[48]\s*([+-])\s*(0x[0-9a-f]+|[0-9]+)\s*\]",
    )
    .ok()
});

pub(crate) fn classify(instruction: &Instruction) -> InstructionClass {
    let text = instruction.text.trim().to_ascii_lowercase();

    match instruction.mnemonic().to_ascii_lowercase().as_str() {
        "iret" | "iretd" | "iretq" => return InstructionClass::InterruptReturn,
        "sysexit" | "sysret" | "sysretq" => return InstructionClass::FastExit,
        "sysenter" | "syscall" => return InstructionClass::FastEntry,
        "int" if is_linux_gate(instruction.operands()) => {
            return InstructionClass::SoftInterrupt;
        }
        _ => {}
    }

    match table_displacement(&text) {
        Some(displacement) => InstructionClass::SyscallTableDispatch {
            displacement,
            base_register: None,
        },
        None => InstructionClass::Other,
    }
}

fn is_linux_gate(operand: &str) -> bool {
    matches!(operand.trim().to_ascii_lowercase().as_str(), "128" | "0x80" | "80h")
}

fn table_displacement(text: &str) -> Option<i64> {
    let captures = TABLE_DISPATCH.as_ref()?.captures(text)?;
    let magnitude = parse_number(captures.get(2)?.as_str())?;

    match captures.get(1)?.as_str() {
        "-" => Some(-magnitude),
        _ => Some(magnitude),
    }
}

fn parse_number(text: &str) -> Option<i64> {
    match text.strip_prefix("0x") {
        Some(hex) => i64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use simi_core::Va;

    use super::*;

    fn insn(text: &str) -> Instruction {
        Instruction::new(Va(0xc100_0000), 2, text)
    }

    #[test]
    fn boundary_instructions() {
        assert_eq!(classify(&insn("int 128")), InstructionClass::SoftInterrupt);
        assert_eq!(classify(&insn("int 0x80")), InstructionClass::SoftInterrupt);
        assert_eq!(classify(&insn("int 3")), InstructionClass::Other);
        assert_eq!(classify(&insn("sysenter")), InstructionClass::FastEntry);
        assert_eq!(classify(&insn("iretd")), InstructionClass::InterruptReturn);
        assert_eq!(classify(&insn("sysexit")), InstructionClass::FastExit);
        assert_eq!(classify(&insn("mov eax,ebx")), InstructionClass::Other);
    }

    #[test]
    fn table_dispatch_keeps_sign() {
        assert_eq!(
            classify(&insn("call dword ptr [eax*4-0x3fe8e000]")),
            InstructionClass::SyscallTableDispatch {
                displacement: -0x3fe8_e000,
                base_register: None,
            }
        );
        assert_eq!(
            classify(&insn("mov eax,dword ptr [eax*4+0xc15a1140]")),
            InstructionClass::SyscallTableDispatch {
                displacement: 0xc15a_1140,
                base_register: None,
            }
        );
        assert_eq!(
            classify(&insn("call dword ptr [ebx*4-0x3fe8e000]")),
            InstructionClass::Other
        );
    }
}
