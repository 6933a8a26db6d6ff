use std::collections::HashSet;

use simi_core::{
    BreakpointRequest, EventMonitor, EventReason, InstructionClass, ProcessorMode,
    Registers as _, SimCore, SimDriver, SimError, SimEvent, SimEventResponse, Va,
};

use super::{Discoverer, DiscoveryPhase, Phase, Step};
use crate::{ArchAdapter, LinuxError};

/// Page fault exception vector.
const PAGE_FAULT_VECTOR: u8 = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryForm {
    Trap,
    Fast,
}

/// State of the syscall boundary search.
#[derive(Default)]
pub(super) struct BoundarySearch {
    exits_seen: HashSet<Va>,
    transitions: u64,
    pending: Option<EntryForm>,
    satisfied_at: Option<u64>,
}

/// State of the syscall table dispatch search.
pub(super) struct ComputeSearch {
    stepping: bool,
    steps: u64,
}

/// State of the stack frame search.
pub(super) struct FrameSearch {
    user_return: Option<Va>,
    attempts: u64,
}

/// State of the page fault search.
pub(super) struct PageFaultSearch {
    stepping: bool,
    polls: u64,
}

/// Finds the stack slot holding `value`, as an offset from the bottom of
/// `stack`.
pub(super) fn find_stack_slot(stack: &[u8], value: Va, word: u64) -> Option<u64> {
    stack
        .chunks_exact(word as usize)
        .position(|slot| {
            let mut raw = [0u8; 8];
            raw[..slot.len()].copy_from_slice(slot);
            u64::from_le_bytes(raw) == value.0
        })
        .map(|index| index as u64 * word)
}

impl<Driver> Discoverer<Driver>
where
    Driver: SimDriver,
    Driver::Architecture: ArchAdapter<Driver>,
{
    fn boundaries_missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.layout.sys_entry().is_none() && self.layout.sysenter().is_none() {
            missing.push("sys_entry");
        }
        if self.layout.iretd().is_none() {
            missing.push("iretd");
        }
        if self.layout.sysexit().is_none() {
            missing.push("sysexit");
        }
        missing
    }

    pub(super) fn boundary_search(
        &mut self,
        vmi: &SimCore<Driver>,
        event: &SimEvent<Driver::Architecture>,
        mut state: BoundarySearch,
    ) -> Step<Driver> {
        let registers = event.registers();
        let ip = Va(registers.instruction_pointer());

        match *event.reason() {
            EventReason::ModeChange {
                from: ProcessorMode::Kernel,
                to: ProcessorMode::User,
            } => {
                if state.exits_seen.insert(ip) {
                    self.classify_exit(vmi, event, ip)?;
                }
            }

            EventReason::ModeChange {
                from: ProcessorMode::User,
                to: ProcessorMode::Kernel,
            } => {
                state.transitions += 1;
                if state.transitions > self.limits.mode_change_ceiling {
                    return Err(Self::ceiling(
                        DiscoveryPhase::LocatingSyscallBoundaries,
                        format!(
                            "missing {} after {} transitions",
                            self.boundaries_missing().join(", "),
                            state.transitions - 1
                        ),
                    ));
                }

                let form = match vmi.classify(event.cpu(), ip) {
                    Ok((_, InstructionClass::SoftInterrupt))
                        if self.layout.sys_entry().is_none() =>
                    {
                        Some(EntryForm::Trap)
                    }
                    Ok((_, InstructionClass::FastEntry)) if self.layout.sysenter().is_none() => {
                        Some(EntryForm::Fast)
                    }
                    Ok(_) => None,
                    Err(err) => {
                        tracing::trace!(%ip, %err, "transition not disassembled");
                        None
                    }
                };

                if let Some(form) = form {
                    tracing::debug!(%ip, ?form, "stepping into the kernel");
                    state.pending = Some(form);
                    return Ok((Phase::BoundarySearch(state), SimEventResponse::singlestep()));
                }
            }

            EventReason::Stop => {
                if let Some(form) = state.pending.take() {
                    match form {
                        EntryForm::Trap => {
                            tracing::info!(sys_entry = %ip, "software interrupt entry located");
                            self.layout.set_sys_entry(ip)?;
                        }
                        EntryForm::Fast => {
                            tracing::info!(sysenter = %ip, "fast entry located");
                            self.layout.set_sysenter(ip)?;
                        }
                    }
                }
            }

            _ => {}
        }

        if !self.boundaries_missing().is_empty() {
            return Ok((Phase::BoundarySearch(state), SimEventResponse::default()));
        }

        // Both entry forms are worth having, but a kernel may never use one.
        let both_entries = self.layout.sys_entry().is_some() && self.layout.sysenter().is_some();
        let satisfied_at = *state.satisfied_at.get_or_insert(state.transitions);

        if both_entries || state.transitions - satisfied_at >= self.limits.entry_grace {
            return self.start_compute_search(vmi);
        }

        Ok((Phase::BoundarySearch(state), SimEventResponse::default()))
    }

    fn classify_exit(
        &mut self,
        vmi: &SimCore<Driver>,
        event: &SimEvent<Driver::Architecture>,
        ip: Va,
    ) -> Result<(), SimError> {
        match vmi.classify(event.cpu(), ip) {
            Ok((_, InstructionClass::InterruptReturn)) if self.layout.iretd().is_none() => {
                tracing::info!(iretd = %ip, "interrupt return located");
                self.layout.set_iretd(ip)?;
            }
            Ok((_, InstructionClass::FastExit)) if self.layout.sysexit().is_none() => {
                tracing::info!(sysexit = %ip, "fast exit located");
                self.layout.set_sysexit(ip)?;
            }
            Ok(_) => {}
            Err(err) => tracing::trace!(%ip, %err, "transition not disassembled"),
        }

        Ok(())
    }

    fn start_compute_search(&mut self, vmi: &SimCore<Driver>) -> Step<Driver> {
        self.disable_monitor(vmi, EventMonitor::ModeChange)?;

        let entry = self
            .layout
            .sys_entry()
            .or(self.layout.sysenter())
            .ok_or(LinuxError::LayoutIncomplete("sys_entry"))?;

        self.watches.insert(
            vmi,
            BreakpointRequest::execute(entry),
            DiscoveryPhase::LocatingSyscallCompute,
        )?;

        tracing::debug!(%entry, "waiting for a syscall");
        Ok((
            Phase::ComputeSearch(ComputeSearch {
                stepping: false,
                steps: 0,
            }),
            SimEventResponse::default(),
        ))
    }

    pub(super) fn compute_search(
        &mut self,
        vmi: &SimCore<Driver>,
        event: &SimEvent<Driver::Architecture>,
        mut state: ComputeSearch,
    ) -> Step<Driver> {
        match *event.reason() {
            EventReason::Breakpoint(breakpoint)
                if !state.stepping && self.watches.contains(breakpoint.handle) =>
            {
                self.watches.clear(vmi)?;
                state.stepping = true;
            }
            EventReason::Stop if state.stepping => {
                state.steps += 1;
                if state.steps > self.limits.compute_step_ceiling {
                    return Err(Self::ceiling(
                        DiscoveryPhase::LocatingSyscallCompute,
                        format!("no table dispatch within {} instructions", state.steps - 1),
                    ));
                }
            }
            _ => return Ok((Phase::ComputeSearch(state), SimEventResponse::default())),
        }

        let registers = event.registers();
        let ip = Va(registers.instruction_pointer());

        let (displacement, base_register) = match vmi.classify(event.cpu(), ip) {
            Ok((
                _,
                InstructionClass::SyscallTableDispatch {
                    displacement,
                    base_register,
                },
            )) => (displacement, base_register),
            Ok(_) => return Ok((Phase::ComputeSearch(state), SimEventResponse::singlestep())),
            Err(err) => {
                tracing::debug!(%ip, %err, "instruction not disassembled");
                return Ok((Phase::ComputeSearch(state), SimEventResponse::singlestep()));
            }
        };

        let base = match base_register {
            Some(index) => registers
                .general_purpose(index)
                .ok_or(SimError::Other("table base register"))?,
            None => 0,
        };

        let jump = displacement.wrapping_add(base as i64);
        tracing::info!(
            syscall_compute = %ip,
            syscall_jump = jump,
            steps = state.steps,
            "syscall table dispatch located"
        );

        self.layout.set_syscall_compute(ip)?;
        self.layout.set_syscall_jump(jump)?;

        self.start_frame_search(vmi)
    }

    fn start_frame_search(&mut self, vmi: &SimCore<Driver>) -> Step<Driver> {
        if self.layout.sys_entry().is_none() {
            tracing::debug!("no software interrupt entry, skipping the stack frame");
            return self.start_page_fault_search(vmi);
        }

        self.enable_monitor(vmi, EventMonitor::ModeChange)?;
        Ok((
            Phase::FrameSearch(FrameSearch {
                user_return: None,
                attempts: 0,
            }),
            SimEventResponse::default(),
        ))
    }

    pub(super) fn frame_search(
        &mut self,
        vmi: &SimCore<Driver>,
        event: &SimEvent<Driver::Architecture>,
        mut state: FrameSearch,
    ) -> Step<Driver> {
        let registers = event.registers();
        let ip = Va(registers.instruction_pointer());

        match (*event.reason(), state.user_return) {
            (
                EventReason::ModeChange {
                    from: ProcessorMode::User,
                    to: ProcessorMode::Kernel,
                },
                None,
            ) => {
                let user_return = match vmi.classify(event.cpu(), ip) {
                    Ok((instruction, InstructionClass::SoftInterrupt)) => instruction.next_address(),
                    _ => return Ok((Phase::FrameSearch(state), SimEventResponse::default())),
                };

                let compute = self
                    .layout
                    .syscall_compute()
                    .ok_or(LinuxError::LayoutIncomplete("syscall_compute"))?;

                self.disable_monitor(vmi, EventMonitor::ModeChange)?;
                self.watches.insert(
                    vmi,
                    BreakpointRequest::execute(compute),
                    DiscoveryPhase::LocatingStackFrame,
                )?;

                state.user_return = Some(user_return);
            }

            (EventReason::Breakpoint(breakpoint), Some(user_return))
                if self.watches.contains(breakpoint.handle) =>
            {
                self.watches.clear(vmi)?;
                state.user_return = None;
                state.attempts += 1;

                let word = self.word();
                let stack = Va(registers.stack_pointer());
                let len = self.limits.stack_frame_window * word;

                let slot = match self.read_window(vmi, registers, stack, len) {
                    Ok(bytes) => find_stack_slot(&bytes, user_return, word),
                    Err(err) => {
                        tracing::debug!(%stack, %err, "kernel stack not readable");
                        None
                    }
                };

                if let Some(slot) = slot {
                    tracing::info!(stack_frame_eip = slot, "user return address located");
                    self.layout.set_stack_frame_eip(slot)?;
                    return self.start_page_fault_search(vmi);
                }

                if state.attempts >= self.limits.stack_frame_attempts {
                    tracing::warn!(
                        attempts = state.attempts,
                        %user_return,
                        "user return address not found on the kernel stack"
                    );
                    return self.start_page_fault_search(vmi);
                }

                self.enable_monitor(vmi, EventMonitor::ModeChange)?;
            }

            _ => {}
        }

        Ok((Phase::FrameSearch(state), SimEventResponse::default()))
    }

    pub(super) fn start_page_fault_search(&mut self, vmi: &SimCore<Driver>) -> Step<Driver> {
        self.enable_monitor(vmi, EventMonitor::Exception(PAGE_FAULT_VECTOR))?;
        Ok((
            Phase::PageFaultSearch(PageFaultSearch {
                stepping: false,
                polls: 0,
            }),
            SimEventResponse::run_for(self.limits.page_fault_poll_budget),
        ))
    }

    pub(super) fn page_fault_search(
        &mut self,
        vmi: &SimCore<Driver>,
        event: &SimEvent<Driver::Architecture>,
        mut state: PageFaultSearch,
    ) -> Step<Driver> {
        let ip = Va(event.registers().instruction_pointer());
        let budget = self.limits.page_fault_poll_budget;

        match *event.reason() {
            EventReason::Exception {
                vector: PAGE_FAULT_VECTOR,
            } => {
                state.stepping = true;
                Ok((Phase::PageFaultSearch(state), SimEventResponse::singlestep()))
            }
            EventReason::Stop if state.stepping => {
                state.stepping = false;

                if ip < self.kernel_base() {
                    tracing::debug!(%ip, "page fault not delivered to the kernel yet");
                    return Ok((Phase::PageFaultSearch(state), SimEventResponse::run_for(budget)));
                }

                tracing::info!(page_fault = %ip, "page fault handler located");
                self.layout.set_page_fault(ip)?;
                self.disable_monitor(vmi, EventMonitor::Exception(PAGE_FAULT_VECTOR))?;

                Ok((Phase::Done, SimEventResponse::stop()))
            }
            EventReason::Stop => {
                state.polls += 1;
                if state.polls > self.limits.page_fault_ceiling {
                    return Err(Self::ceiling(
                        DiscoveryPhase::LocatingPageFault,
                        format!("no page fault after {} polls", state.polls - 1),
                    ));
                }

                Ok((Phase::PageFaultSearch(state), SimEventResponse::run_for(budget)))
            }
            _ => Ok((Phase::PageFaultSearch(state), SimEventResponse::default())),
        }
    }
}
