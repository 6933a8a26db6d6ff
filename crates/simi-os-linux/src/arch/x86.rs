use simi_arch_x86::{InterruptFrame32, PtRegs32, Registers, X86};
use simi_core::{Registers as _, SimCore, SimDriver, SimError, Va};

use super::ArchAdapter;
use crate::{SyscallEntry, SyscallFrame};

impl<Driver> ArchAdapter<Driver> for X86
where
    Driver: SimDriver<Architecture = Self>,
{
    fn current_task_hint(
        vmi: &SimCore<Driver>,
        registers: &Registers,
        thread_size: u64,
    ) -> Result<Va, SimError> {
        // struct thread_info { struct task_struct *task; ... }
        let thread_info = Va(registers.rsp & !(thread_size - 1));
        vmi.read_va(
            registers.access_context(thread_info),
            registers.address_width(),
        )
    }

    fn syscall_frame(
        vmi: &SimCore<Driver>,
        registers: &Registers,
        entry: SyscallEntry,
    ) -> Result<SyscallFrame, SimError> {
        if registers.address_width() == 8 {
            return match entry {
                SyscallEntry::FastEntry => Ok(frame_from_registers_64(registers)),
                _ => Err(SimError::NotSupported),
            };
        }

        match entry {
            SyscallEntry::FastEntry => Ok(frame_from_registers_32(registers)),
            SyscallEntry::Trap => {
                let mut frame = frame_from_registers_32(registers);

                let trapped: InterruptFrame32 =
                    vmi.read_struct(registers.access_context(Va(registers.rsp)))?;
                frame.pc = Va(trapped.eip as u64);
                frame.sp = Va(trapped.esp as u64);

                Ok(frame)
            }
            SyscallEntry::Computed => {
                // The handler's first stack argument is the saved pt_regs.
                let pt_regs: PtRegs32 =
                    vmi.read_struct(registers.access_context(Va(registers.rsp + 4)))?;

                Ok(SyscallFrame {
                    callnum: pt_regs.orig_eax as u64,
                    params: [
                        pt_regs.ebx as u64,
                        pt_regs.ecx as u64,
                        pt_regs.edx as u64,
                        pt_regs.esi as u64,
                        pt_regs.edi as u64,
                        pt_regs.ebp as u64,
                    ],
                    sp: Va(pt_regs.esp as u64),
                    pc: Va(pt_regs.eip as u64),
                })
            }
        }
    }

    fn returns_to_kernel(
        vmi: &SimCore<Driver>,
        registers: &Registers,
        kernel_base: Va,
    ) -> Result<bool, SimError> {
        let frame: InterruptFrame32 =
            vmi.read_struct(registers.access_context(Va(registers.rsp)))?;
        Ok(Va(frame.eip as u64) >= kernel_base)
    }
}

fn frame_from_registers_32(registers: &Registers) -> SyscallFrame {
    let low = |value: u64| value & 0xffff_ffff;

    SyscallFrame {
        callnum: low(registers.rax),
        params: [
            low(registers.rbx),
            low(registers.rcx),
            low(registers.rdx),
            low(registers.rsi),
            low(registers.rdi),
            low(registers.rbp),
        ],
        sp: Va(low(registers.rsp)),
        pc: Va(low(registers.rip)),
    }
}

fn frame_from_registers_64(registers: &Registers) -> SyscallFrame {
    SyscallFrame {
        callnum: registers.rax,
        params: [
            registers.rdi,
            registers.rsi,
            registers.rdx,
            registers.r10,
            registers.r8,
            registers.r9,
        ],
        sp: Va(registers.rsp),
        pc: Va(registers.rcx),
    }
}
