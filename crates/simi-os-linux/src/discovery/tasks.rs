use std::collections::HashSet;

use simi_core::{
    Architecture, BreakpointRequest, EventMonitor, EventReason, MemoryAccess, Registers as _,
    SimCore, SimDriver, SimError, SimEvent, SimEventResponse, Va,
};

use super::{Discoverer, DiscoveryPhase, Phase, Step, boundary::BoundarySearch};
use crate::{ArchAdapter, LinuxError, TASK_COMM_LEN};

/// State of the swapper search.
pub(super) struct SwapperSearch {
    tested: HashSet<Va>,
    switches: u64,
}

/// State of the init search.
pub(super) struct InitSearch {
    polls: u64,
}

enum InitProgress {
    Complete,
    Waiting { what: &'static str, budget: u64 },
}

/// Family link offsets, all derived from `real_parent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct FamilyOffsets {
    pub real_parent: u64,
    pub parent: u64,
    pub children: u64,
    pub sibling: u64,
    pub thread_group: u64,
}

impl FamilyOffsets {
    /// `real_parent` and `parent` are followed by the `children` and
    /// `sibling` list heads, then `group_leader`, `ptraced`, `ptrace_entry`
    /// and the pid links, then `thread_group`.
    pub fn from_real_parent(real_parent: u64, word: u64) -> Self {
        Self {
            real_parent,
            parent: real_parent + word,
            children: real_parent + 2 * word,
            sibling: real_parent + 4 * word,
            thread_group: real_parent + 8 * word,
        }
    }
}

fn word_at(bytes: &[u8], offset: u64, word: u64) -> Option<u64> {
    let start = usize::try_from(offset).ok()?;
    let chunk = bytes.get(start..start.checked_add(word as usize)?)?;

    match word {
        4 => Some(u32::from_le_bytes(chunk.try_into().ok()?) as u64),
        8 => Some(u64::from_le_bytes(chunk.try_into().ok()?)),
        _ => None,
    }
}

/// Finds the first pair of adjacent fields that both point to `task`.
pub(super) fn find_self_referential_pair(
    bytes: &[u8],
    task: Va,
    word: u64,
    window: u64,
) -> Option<u64> {
    (0..window)
        .map(|index| index * word)
        .find(|&offset| {
            word_at(bytes, offset, word) == Some(task.0)
                && word_at(bytes, offset + word, word) == Some(task.0)
        })
}

/// Finds the offset of `tasks.next` in the swapper: the field whose value,
/// less its own offset, is the address of init.
pub(super) fn find_next_offset(
    bytes: &[u8],
    init: Va,
    start: u64,
    word: u64,
    window: u64,
) -> Option<u64> {
    (0..window)
        .map(|index| start + index * word)
        .find(|&offset| {
            word_at(bytes, offset, word).map(|value| value.wrapping_sub(offset)) == Some(init.0)
        })
}

/// Finds the offset of `pid`: init holds 1 in `pid` and `tgid`, and the
/// task after it holds 2 (kthreadd) or 0 in both.
pub(super) fn find_pid_offset(init: &[u8], next: &[u8], window: u64) -> Option<u64> {
    (0..window).map(|index| index * 4).find(|&offset| {
        let pair = |bytes: &[u8]| (word_at(bytes, offset, 4), word_at(bytes, offset + 4, 4));

        pair(init) == (Some(1), Some(1))
            && matches!(pair(next), (Some(2), Some(2)) | (Some(0), Some(0)))
    })
}

/// Finds the offset of `comm` relative to the start of `bytes`: a string
/// that begins with one of `names`.
pub(super) fn find_comm_offset(bytes: &[u8], names: &[String], window: u64) -> Option<u64> {
    (0..window).map(|index| index * 4).find(|&offset| {
        let Ok(start) = usize::try_from(offset)
        else {
            return false;
        };

        let Some(chunk) = bytes.get(start..start + TASK_COMM_LEN as usize)
        else {
            return false;
        };

        let end = memchr::memchr(0, chunk).unwrap_or(chunk.len());
        let comm = &chunk[..end];

        !comm.is_empty()
            && names
                .iter()
                .any(|name| comm.starts_with(name.as_bytes()))
    })
}

impl<Driver> Discoverer<Driver>
where
    Driver: SimDriver,
    Driver::Architecture: ArchAdapter<Driver>,
{
    fn offset(&self, value: Option<u64>, field: &'static str) -> Result<u64, SimError> {
        value.ok_or_else(|| LinuxError::LayoutIncomplete(field).into())
    }

    pub(super) fn start_swapper_search(
        &mut self,
        vmi: &SimCore<Driver>,
        registers: &<Driver::Architecture as Architecture>::Registers,
        candidates: HashSet<Va>,
    ) -> Step<Driver> {
        let mut state = SwapperSearch {
            tested: HashSet::new(),
            switches: 0,
        };

        for task in candidates {
            if self.test_swapper(vmi, registers, &mut state, task)? {
                return self.start_init_search(vmi, registers);
            }
        }

        let current_task = self
            .layout
            .current_task()
            .ok_or(LinuxError::LayoutIncomplete("current_task"))?;
        let addressing = self
            .layout
            .current_task_addressing()
            .ok_or(LinuxError::LayoutIncomplete("current_task_addressing"))?;

        let cell = self.current_task_cell(registers, addressing, current_task);
        let pa = vmi.translate_access_context(registers.access_context(cell))?;

        self.watches.insert(
            vmi,
            BreakpointRequest::physical(pa, MemoryAccess::W, self.word()),
            DiscoveryPhase::IdentifyingSwapper,
        )?;

        tracing::debug!(%cell, %pa, "waiting for the swapper to run");
        Ok((Phase::SwapperSearch(state), SimEventResponse::default()))
    }

    pub(super) fn swapper_search(
        &mut self,
        vmi: &SimCore<Driver>,
        event: &SimEvent<Driver::Architecture>,
        mut state: SwapperSearch,
    ) -> Step<Driver> {
        let EventReason::Breakpoint(breakpoint) = *event.reason()
        else {
            return Ok((Phase::SwapperSearch(state), SimEventResponse::default()));
        };

        if !self.watches.contains(breakpoint.handle) {
            return Ok((Phase::SwapperSearch(state), SimEventResponse::default()));
        }

        state.switches += 1;
        if state.switches > self.limits.task_switch_ceiling {
            return Err(Self::ceiling(
                DiscoveryPhase::IdentifyingSwapper,
                format!(
                    "no task with a self-referential parent pair among {} tasks",
                    state.tested.len()
                ),
            ));
        }

        let registers = event.registers();
        let task = match breakpoint.value {
            Some(value) => Va(value),
            None => {
                let current_task = self
                    .layout
                    .current_task()
                    .ok_or(LinuxError::LayoutIncomplete("current_task"))?;
                let addressing = self
                    .layout
                    .current_task_addressing()
                    .ok_or(LinuxError::LayoutIncomplete("current_task_addressing"))?;

                let cell = self.current_task_cell(registers, addressing, current_task);
                self.read_pointer(vmi, registers, cell)?
            }
        };

        if !self.test_swapper(vmi, registers, &mut state, task)? {
            return Ok((Phase::SwapperSearch(state), SimEventResponse::default()));
        }

        self.watches.clear(vmi)?;
        self.start_init_search(vmi, registers)
    }

    /// Checks whether `task` is the swapper and records the family offsets
    /// if it is.
    fn test_swapper(
        &mut self,
        vmi: &SimCore<Driver>,
        registers: &<Driver::Architecture as Architecture>::Registers,
        state: &mut SwapperSearch,
        task: Va,
    ) -> Result<bool, SimError> {
        if task.is_null() || !state.tested.insert(task) {
            return Ok(false);
        }

        let word = self.word();
        let window = self.limits.swapper_window;

        let bytes = match self.read_window(vmi, registers, task, (window + 1) * word) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::debug!(%task, %err, "candidate task is not readable");
                return Ok(false);
            }
        };

        let Some(real_parent) = find_self_referential_pair(&bytes, task, word, window)
        else {
            tracing::trace!(%task, "not the swapper");
            return Ok(false);
        };

        let offsets = FamilyOffsets::from_real_parent(real_parent, word);
        tracing::info!(swapper = %task, ?offsets, "swapper identified");

        self.layout.set_init_task(task)?;
        self.layout.set_ts_real_parent(offsets.real_parent)?;
        self.layout.set_ts_parent(offsets.parent)?;
        self.layout.set_ts_children(offsets.children)?;
        self.layout.set_ts_sibling(offsets.sibling)?;
        self.layout.set_ts_thread_group(offsets.thread_group)?;

        Ok(true)
    }

    fn start_init_search(
        &mut self,
        vmi: &SimCore<Driver>,
        registers: &<Driver::Architecture as Architecture>::Registers,
    ) -> Step<Driver> {
        self.init_search_step(vmi, registers, InitSearch { polls: 0 })
    }

    pub(super) fn init_search(
        &mut self,
        vmi: &SimCore<Driver>,
        event: &SimEvent<Driver::Architecture>,
        state: InitSearch,
    ) -> Step<Driver> {
        if !matches!(event.reason(), EventReason::Stop) {
            return Ok((Phase::InitSearch(state), SimEventResponse::default()));
        }

        self.init_search_step(vmi, event.registers(), state)
    }

    fn init_search_step(
        &mut self,
        vmi: &SimCore<Driver>,
        registers: &<Driver::Architecture as Architecture>::Registers,
        mut state: InitSearch,
    ) -> Step<Driver> {
        match self.identify_init(vmi, registers)? {
            InitProgress::Complete => {
                self.enable_monitor(vmi, EventMonitor::ModeChange)?;
                Ok((
                    Phase::BoundarySearch(BoundarySearch::default()),
                    SimEventResponse::default(),
                ))
            }
            InitProgress::Waiting { what, budget } => {
                state.polls += 1;
                if state.polls > self.limits.init_poll_ceiling {
                    return Err(Self::ceiling(
                        DiscoveryPhase::IdentifyingInitAndLinks,
                        format!("still waiting for {what} after {} polls", state.polls - 1),
                    ));
                }

                tracing::debug!(what, polls = state.polls, "waiting for init");
                Ok((Phase::InitSearch(state), SimEventResponse::run_for(budget)))
            }
        }
    }

    fn identify_init(
        &mut self,
        vmi: &SimCore<Driver>,
        registers: &<Driver::Architecture as Architecture>::Registers,
    ) -> Result<InitProgress, SimError> {
        let word = self.word();
        let swapper = self
            .layout
            .init_task()
            .ok_or(LinuxError::LayoutIncomplete("init_task"))?;
        let children = self.offset(self.layout.ts_children(), "ts_children")?;
        let sibling = self.offset(self.layout.ts_sibling(), "ts_sibling")?;

        let process_budget = self.limits.process_poll_budget;
        let waiting = |what| InitProgress::Waiting {
            what,
            budget: process_budget,
        };

        let first_child = match self.read_pointer(vmi, registers, swapper + children) {
            Ok(first_child) => first_child,
            Err(err) => {
                tracing::debug!(%err, "swapper children not readable");
                return Ok(waiting("the swapper's children"));
            }
        };

        if first_child.is_null() || first_child == swapper + children {
            return Ok(waiting("init"));
        }

        let init = first_child - sibling;

        if self.layout.ts_next().is_none() {
            let start = self.limits.next_offset_start;
            let window = self.limits.next_window;

            let bytes = match self.read_window(vmi, registers, swapper, start + (window + 1) * word)
            {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::debug!(%err, "swapper not readable");
                    return Ok(waiting("a readable swapper"));
                }
            };

            let Some(next) = find_next_offset(&bytes, init, start, word, window)
            else {
                return Err(Self::ceiling(
                    DiscoveryPhase::IdentifyingInitAndLinks,
                    format!("no field of the swapper leads to init at {init}"),
                ));
            };

            tracing::info!(%init, ts_next = next, "tasks list located");
            self.layout.set_ts_next(next)?;
            self.layout.set_ts_prev(next + word)?;
        }

        let next = self.offset(self.layout.ts_next(), "ts_next")?;

        let second = match self.read_pointer(vmi, registers, init + next) {
            Ok(second) => second - next,
            Err(err) => {
                tracing::debug!(%err, "init tasks link not readable");
                return Ok(waiting("a readable init"));
            }
        };

        if second.is_null() || second == swapper || second == init {
            return Ok(waiting("a second process"));
        }

        if self.layout.ts_pid().is_none() {
            let len = (self.limits.pid_window + 2) * 4;

            let (init_bytes, second_bytes) = match (
                self.read_window(vmi, registers, init, len),
                self.read_window(vmi, registers, second, len),
            ) {
                (Ok(init_bytes), Ok(second_bytes)) => (init_bytes, second_bytes),
                _ => return Ok(waiting("readable processes")),
            };

            let Some(pid) = find_pid_offset(&init_bytes, &second_bytes, self.limits.pid_window)
            else {
                return Err(Self::ceiling(
                    DiscoveryPhase::IdentifyingInitAndLinks,
                    format!("no pid 1 in init at {init} next to pid 2 or 0 in {second}"),
                ));
            };

            tracing::info!(ts_pid = pid, ts_tgid = pid + 4, "pid located");
            self.layout.set_ts_pid(pid)?;
            self.layout.set_ts_tgid(pid + 4)?;
        }

        if self.layout.ts_comm().is_none() {
            let pid = self.offset(self.layout.ts_pid(), "ts_pid")?;
            let start = pid + 8;
            let window = self.limits.comm_window;

            let bytes =
                match self.read_window(vmi, registers, init + start, window * 4 + TASK_COMM_LEN) {
                    Ok(bytes) => bytes,
                    Err(_) => return Ok(waiting("a readable init")),
                };

            let Some(comm) = find_comm_offset(&bytes, &self.limits.init_names, window)
            else {
                return Ok(InitProgress::Waiting {
                    what: "init to be named",
                    budget: self.limits.comm_poll_budget,
                });
            };

            tracing::info!(ts_comm = start + comm, "comm located");
            self.layout.set_ts_comm(start + comm)?;
        }

        Ok(InitProgress::Complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(bytes: &mut [u8], offset: usize, value: u32) {
        bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    #[test]
    fn swapper_family_offsets() {
        let swapper = Va(0x8100_0000);
        let mut bytes = vec![0u8; 0x100];
        put(&mut bytes, 0x10, 0x8100_0000);
        put(&mut bytes, 0x18, 0x8100_0000);
        put(&mut bytes, 0x1c, 0x8100_0000);

        let real_parent = find_self_referential_pair(&bytes, swapper, 4, 0x3f);
        assert_eq!(real_parent, Some(0x18));

        let offsets = FamilyOffsets::from_real_parent(0x18, 4);
        assert_eq!(offsets.parent, 0x1c);
        assert_eq!(offsets.children, 0x20);
        assert_eq!(offsets.sibling, 0x28);
        assert_eq!(offsets.thread_group, 0x38);
    }

    #[test]
    fn no_self_referential_pair() {
        let mut bytes = vec![0u8; 0x100];
        put(&mut bytes, 0x18, 0x8100_0000);
        put(&mut bytes, 0x20, 0x8100_0000);

        assert_eq!(find_self_referential_pair(&bytes, Va(0x8100_0000), 4, 0x3f), None);
    }

    #[test]
    fn tasks_next_points_at_init() {
        let init = Va(0x8200_0000);
        let mut bytes = vec![0u8; 0x200];
        // A field at 0x60 holding init + 0x60 is `tasks.next`.
        put(&mut bytes, 0x60, 0x8200_0060);

        assert_eq!(find_next_offset(&bytes, init, 20, 4, 100), Some(0x60));
        assert_eq!(find_next_offset(&bytes, init, 0x64, 4, 100), None);
    }

    #[test]
    fn pid_pattern() {
        let mut init = vec![0u8; 0x200];
        let mut kthreadd = vec![0u8; 0x200];

        // A decoy: a single 1 in init, no match in kthreadd.
        put(&mut init, 0x40, 1);

        put(&mut init, 0xa0, 1);
        put(&mut init, 0xa4, 1);
        put(&mut kthreadd, 0xa0, 2);
        put(&mut kthreadd, 0xa4, 2);

        assert_eq!(find_pid_offset(&init, &kthreadd, 100), Some(0xa0));

        let idle = vec![0u8; 0x200];
        assert_eq!(find_pid_offset(&init, &idle, 100), Some(0xa0));
    }

    #[test]
    fn comm_prefix() {
        let names = vec![String::from("init"), String::from("systemd")];
        let mut bytes = vec![0u8; 0x100];
        bytes[0x30..0x37].copy_from_slice(b"systemd");

        assert_eq!(find_comm_offset(&bytes, &names, 0x30), Some(0x30));
        assert_eq!(find_comm_offset(&bytes[..0x30], &names, 0x30), None);
    }
}
