use std::sync::LazyLock;

use regex::Regex;
use simi_core::{Instruction, InstructionClass};

/// `ldr pc, [r8, r7, lsl #2]` and the conditional `ldrcc` form.
static TABLE_DISPATCH: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^ldr(?:[a-z]{2})?\s+pc\s*,\s*\[\s*r(\d+)\s*,\s*r7\s*,\s*lsl\s*#2\s*\]").ok()
});

pub(crate) fn classify(instruction: &Instruction) -> InstructionClass {
    let text = instruction.text.trim().to_ascii_lowercase();
    let mnemonic = instruction.mnemonic().to_ascii_lowercase();

    if mnemonic.starts_with("svc") || mnemonic.starts_with("swi") {
        return InstructionClass::SoftInterrupt;
    }

    if is_exception_return(&mnemonic, instruction.operands()) {
        return InstructionClass::FastExit;
    }

    if mnemonic.starts_with("rfe") || (mnemonic.starts_with("ldm") && text.ends_with('^')) {
        return InstructionClass::InterruptReturn;
    }

    match table_base(&text) {
        Some(base_register) => InstructionClass::SyscallTableDispatch {
            displacement: 0,
            base_register: Some(base_register),
        },
        None => InstructionClass::Other,
    }
}

/// `movs pc, lr` and `subs pc, lr, #n` restore CPSR from SPSR.
fn is_exception_return(mnemonic: &str, operands: &str) -> bool {
    let operands = operands.replace(' ', "").to_ascii_lowercase();
    matches!(mnemonic, "movs" | "subs") && operands.starts_with("pc,lr")
}

fn table_base(text: &str) -> Option<u8> {
    let captures = TABLE_DISPATCH.as_ref()?.captures(text)?;
    captures.get(1)?.as_str().parse().ok()
}
