use simi_arch_arm::{Arm, Registers};
use simi_core::{ProcessorMode, Registers as _, SimCore, SimDriver, SimError, Va};

use super::ArchAdapter;
use crate::{SyscallEntry, SyscallFrame};

/// Offset of `thread_info.task`.
const THREAD_INFO_TASK: u64 = 12;

impl<Driver> ArchAdapter<Driver> for Arm
where
    Driver: SimDriver<Architecture = Self>,
{
    fn current_task_hint(
        vmi: &SimCore<Driver>,
        registers: &Registers,
        thread_size: u64,
    ) -> Result<Va, SimError> {
        let thread_info = Va(registers.sp as u64 & !(thread_size - 1));
        vmi.read_va32(registers.access_context(thread_info + THREAD_INFO_TASK))
    }

    fn syscall_frame(
        _vmi: &SimCore<Driver>,
        registers: &Registers,
        _entry: SyscallEntry,
    ) -> Result<SyscallFrame, SimError> {
        // The arguments stay in r0-r5 on every entry path; only the user
        // SP/LR move to the banked registers once in supervisor mode.
        let (sp, pc) = match registers.privilege() {
            ProcessorMode::Kernel => (registers.sp_usr, registers.lr),
            ProcessorMode::User => (registers.sp, registers.pc),
        };

        Ok(SyscallFrame {
            callnum: registers.r7 as u64,
            params: [
                registers.r0 as u64,
                registers.r1 as u64,
                registers.r2 as u64,
                registers.r3 as u64,
                registers.r4 as u64,
                registers.r5 as u64,
            ],
            sp: Va(sp as u64),
            pc: Va(pc as u64),
        })
    }

    fn returns_to_kernel(
        _vmi: &SimCore<Driver>,
        registers: &Registers,
        kernel_base: Va,
    ) -> Result<bool, SimError> {
        Ok(Va(registers.lr as u64) >= kernel_base)
    }
}
