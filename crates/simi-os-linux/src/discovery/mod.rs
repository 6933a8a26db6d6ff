//! Kernel layout discovery.
//!
//! The [`Discoverer`] is a [`SimHandler`] that watches an unmodified guest
//! boot and run until it has inferred a complete [`KernelLayout`]:
//!
//! 1. Locate the current-task cell by scanning memory for the running task
//!    pointer and narrowing the candidates on later samples.
//! 2. Identify the swapper as the task whose `real_parent` and `parent` both
//!    point to itself, which fixes the family link offsets.
//! 3. Identify init as the swapper's first child, and from it the `tasks`,
//!    `pid`, `tgid` and `comm` offsets.
//! 4. Classify the instructions at user/kernel transitions to find the
//!    syscall entry and exit points.
//! 5. Single-step from the entry point to the syscall table dispatch.
//! 6. Locate the user return address on the kernel stack.
//! 7. Record the first instruction of the page fault handler.
//!
//! Every loop is bounded by [`DiscoveryLimits`]. Exceeding a limit ends
//! discovery with [`DiscoveryOutcome::Failed`] and keeps the guest stopped.

mod boundary;
mod pointer;
mod tasks;

#[cfg(all(test, feature = "arch-x86"))]
mod tests;

use std::marker::PhantomData;

use serde::{Deserialize, Serialize};
use simi_core::{
    Architecture, EventMonitor, Registers as _, SimCore, SimDriver, SimError, SimEvent,
    SimEventResponse, SimHandler, Va, watch::WatchRegistry,
};

use self::{
    boundary::{BoundarySearch, ComputeSearch, FrameSearch, PageFaultSearch},
    pointer::PointerSearch,
    tasks::{InitSearch, SwapperSearch},
};
use crate::{ArchAdapter, CurrentTaskAddressing, KernelLayout, LinuxError};

/// A step of the discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiscoveryPhase {
    /// Searching for the current-task cell.
    LocatingCurrentTaskPointer,

    /// Waiting for the swapper to run.
    IdentifyingSwapper,

    /// Inferring init and the `task_struct` offsets.
    IdentifyingInitAndLinks,

    /// Classifying user/kernel transitions.
    LocatingSyscallBoundaries,

    /// Single-stepping to the syscall table dispatch.
    LocatingSyscallCompute,

    /// Searching the kernel stack for the user return address.
    LocatingStackFrame,

    /// Waiting for a page fault.
    LocatingPageFault,

    /// Finished.
    Done,
}

/// What to do when the current-task candidates do not narrow to one or
/// two before the sample limit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AmbiguityPolicy {
    /// Accept the second-to-last candidate.
    ///
    /// With many candidates left the guest is likely spinning in one task,
    /// and on observed kernels the real cell has been the second-to-last.
    #[default]
    SecondToLast,

    /// Give up.
    Fail,
}

/// Bounds and tuning of the discovery heuristics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryLimits {
    /// Lowest kernel virtual address.
    pub kernel_base: u64,

    /// First address of the current-task scan.
    pub scan_start: u64,

    /// Number of pointer-sized cells to scan.
    pub scan_cells: u64,

    /// Maximum number of candidates kept by one scan.
    pub max_hits: usize,

    /// Instructions to run between two samples.
    pub sample_budget: u64,

    /// Maximum number of samples before the candidates must have narrowed.
    pub sample_iterations: u64,

    /// Size of the kernel stack, which holds `thread_info` at its bottom.
    pub thread_size: u64,

    /// Policy when the candidates stay ambiguous.
    pub ambiguity_policy: AmbiguityPolicy,

    /// Maximum number of task switches to wait for the swapper.
    pub task_switch_ceiling: u64,

    /// Number of fields searched for the self-referential parent pair.
    pub swapper_window: u64,

    /// First offset tried for `tasks.next`.
    pub next_offset_start: u64,

    /// Number of fields searched for `tasks.next`.
    pub next_window: u64,

    /// Number of fields searched for `pid`.
    pub pid_window: u64,

    /// Number of fields searched for `comm`.
    pub comm_window: u64,

    /// Command names init may run under.
    pub init_names: Vec<String>,

    /// Instructions to run while waiting for a second process.
    pub process_poll_budget: u64,

    /// Instructions to run while waiting for init to be named.
    pub comm_poll_budget: u64,

    /// Maximum number of polls while identifying init.
    pub init_poll_ceiling: u64,

    /// Maximum number of user-to-kernel transitions to classify.
    pub mode_change_ceiling: u64,

    /// Transitions to keep looking for the second entry form once the
    /// first one and both exits are known.
    pub entry_grace: u64,

    /// Maximum number of instructions stepped from the syscall entry to
    /// the table dispatch.
    pub compute_step_ceiling: u64,

    /// Number of stack words searched for the user return address.
    pub stack_frame_window: u64,

    /// Number of syscalls observed while searching for the user return
    /// address.
    pub stack_frame_attempts: u64,

    /// Instructions to run while waiting for a page fault.
    pub page_fault_poll_budget: u64,

    /// Maximum number of polls without a page fault.
    pub page_fault_ceiling: u64,
}

impl Default for DiscoveryLimits {
    fn default() -> Self {
        Self {
            kernel_base: 0xc000_0000,
            scan_start: 0xc100_0000,
            scan_cells: 14_000_000,
            max_hits: 9999,
            sample_budget: 5_000_000,
            sample_iterations: 900_000,
            thread_size: 0x2000,
            ambiguity_policy: AmbiguityPolicy::default(),
            task_switch_ceiling: 1_000_000,
            swapper_window: 800,
            next_offset_start: 20,
            next_window: 800,
            pid_window: 800,
            comm_window: 800,
            init_names: vec![String::from("init"), String::from("systemd")],
            process_poll_budget: 500_000,
            comm_poll_budget: 50_000_000,
            init_poll_ceiling: 10_000,
            mode_change_ceiling: 1_000_000,
            entry_grace: 10_000,
            compute_step_ceiling: 1000,
            stack_frame_window: 800,
            stack_frame_attempts: 16,
            page_fault_poll_budget: 5_000_000,
            page_fault_ceiling: 10_000,
        }
    }
}

impl DiscoveryLimits {
    /// Sets the lowest kernel virtual address.
    pub fn with_kernel_base(self, kernel_base: u64) -> Self {
        Self {
            kernel_base,
            ..self
        }
    }

    /// Sets the range of the current-task scan.
    pub fn with_scan_range(self, scan_start: u64, scan_cells: u64) -> Self {
        Self {
            scan_start,
            scan_cells,
            ..self
        }
    }

    /// Sets the sampling budget and iteration limit.
    pub fn with_sampling(self, sample_budget: u64, sample_iterations: u64) -> Self {
        Self {
            sample_budget,
            sample_iterations,
            ..self
        }
    }

    /// Sets the kernel stack size.
    pub fn with_thread_size(self, thread_size: u64) -> Self {
        Self {
            thread_size,
            ..self
        }
    }

    /// Sets the ambiguity policy.
    pub fn with_ambiguity_policy(self, ambiguity_policy: AmbiguityPolicy) -> Self {
        Self {
            ambiguity_policy,
            ..self
        }
    }

    /// Sets the polling of the page fault search.
    pub fn with_page_fault_polling(
        self,
        page_fault_poll_budget: u64,
        page_fault_ceiling: u64,
    ) -> Self {
        Self {
            page_fault_poll_budget,
            page_fault_ceiling,
            ..self
        }
    }

    /// Sets the command names init may run under.
    pub fn with_init_names(self, init_names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            init_names: init_names.into_iter().map(Into::into).collect(),
            ..self
        }
    }
}

/// The result of a discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// Every required field was found.
    Complete(KernelLayout),

    /// Discovery gave up.
    Failed {
        /// The phase that failed.
        phase: DiscoveryPhase,

        /// What was searched for and what was found.
        detail: String,
    },
}

impl DiscoveryOutcome {
    /// Returns the layout of a completed discovery.
    pub fn layout(&self) -> Option<&KernelLayout> {
        match self {
            Self::Complete(layout) => Some(layout),
            Self::Failed { .. } => None,
        }
    }
}

enum Phase {
    PointerSearch(PointerSearch),
    SwapperSearch(SwapperSearch),
    InitSearch(InitSearch),
    BoundarySearch(BoundarySearch),
    ComputeSearch(ComputeSearch),
    FrameSearch(FrameSearch),
    PageFaultSearch(PageFaultSearch),
    Done,
}

impl Phase {
    fn public(&self) -> DiscoveryPhase {
        match self {
            Self::PointerSearch(_) => DiscoveryPhase::LocatingCurrentTaskPointer,
            Self::SwapperSearch(_) => DiscoveryPhase::IdentifyingSwapper,
            Self::InitSearch(_) => DiscoveryPhase::IdentifyingInitAndLinks,
            Self::BoundarySearch(_) => DiscoveryPhase::LocatingSyscallBoundaries,
            Self::ComputeSearch(_) => DiscoveryPhase::LocatingSyscallCompute,
            Self::FrameSearch(_) => DiscoveryPhase::LocatingStackFrame,
            Self::PageFaultSearch(_) => DiscoveryPhase::LocatingPageFault,
            Self::Done => DiscoveryPhase::Done,
        }
    }
}

/// The phase to continue in and the response to the current event.
type Step<Driver> = Result<(Phase, SimEventResponse<<Driver as SimDriver>::Architecture>), SimError>;

/// Infers a [`KernelLayout`] by observing the guest.
///
/// Drive it with [`SimCore::run`] after calling [`begin`](Self::begin).
pub struct Discoverer<Driver>
where
    Driver: SimDriver,
    Driver::Architecture: ArchAdapter<Driver>,
{
    limits: DiscoveryLimits,
    layout: KernelLayout,
    phase: Phase,
    watches: WatchRegistry<DiscoveryPhase>,
    monitors: Vec<EventMonitor>,
    outcome: Option<DiscoveryOutcome>,

    _marker: PhantomData<Driver>,
}

impl<Driver> Discoverer<Driver>
where
    Driver: SimDriver,
    Driver::Architecture: ArchAdapter<Driver>,
{
    /// Creates a new discoverer.
    pub fn new(limits: DiscoveryLimits) -> Self {
        Self {
            limits,
            layout: KernelLayout::new(),
            phase: Phase::PointerSearch(PointerSearch::default()),
            watches: WatchRegistry::new(),
            monitors: Vec::new(),
            outcome: None,
            _marker: PhantomData,
        }
    }

    /// Requests the first stop, at which sampling starts.
    pub fn begin(&self, vmi: &SimCore<Driver>) -> Result<(), SimError> {
        tracing::info!(limits = ?self.limits, "kernel discovery started");
        vmi.request_stop("kernel discovery")
    }

    /// Returns the limits.
    pub fn limits(&self) -> &DiscoveryLimits {
        &self.limits
    }

    /// Returns the layout found so far.
    pub fn layout(&self) -> &KernelLayout {
        &self.layout
    }

    /// Returns the current phase.
    pub fn phase(&self) -> DiscoveryPhase {
        self.phase.public()
    }

    /// Returns the outcome, once discovery has ended.
    pub fn outcome(&self) -> Option<&DiscoveryOutcome> {
        self.outcome.as_ref()
    }

    fn word(&self) -> u64 {
        self.layout.word_size().unwrap_or(4)
    }

    fn kernel_base(&self) -> Va {
        Va(self.limits.kernel_base)
    }

    fn ceiling(phase: DiscoveryPhase, detail: String) -> SimError {
        LinuxError::HeuristicCeilingExceeded { phase, detail }.into()
    }

    fn read_pointer(
        &self,
        vmi: &SimCore<Driver>,
        registers: &<Driver::Architecture as Architecture>::Registers,
        va: Va,
    ) -> Result<Va, SimError> {
        vmi.read_va(registers.access_context(va), self.word() as usize)
    }

    fn read_window(
        &self,
        vmi: &SimCore<Driver>,
        registers: &<Driver::Architecture as Architecture>::Registers,
        va: Va,
        len: u64,
    ) -> Result<Vec<u8>, SimError> {
        let mut buffer = vec![0u8; len as usize];
        vmi.read(registers.access_context(va), &mut buffer)?;
        Ok(buffer)
    }

    fn current_task_cell(
        &self,
        registers: &<Driver::Architecture as Architecture>::Registers,
        addressing: CurrentTaskAddressing,
        cell: Va,
    ) -> Va {
        match addressing {
            CurrentTaskAddressing::SegmentRelative => cell + registers.segment_base(),
            CurrentTaskAddressing::Absolute => cell,
        }
    }

    fn enable_monitor(&mut self, vmi: &SimCore<Driver>, option: EventMonitor) -> Result<(), SimError> {
        vmi.monitor_enable(option)?;
        if !self.monitors.contains(&option) {
            self.monitors.push(option);
        }
        Ok(())
    }

    fn disable_monitor(&mut self, vmi: &SimCore<Driver>, option: EventMonitor) -> Result<(), SimError> {
        self.monitors.retain(|enabled| *enabled != option);
        vmi.monitor_disable(option)
    }

    fn teardown(&mut self, vmi: &SimCore<Driver>) {
        if let Err(err) = self.watches.clear(vmi) {
            tracing::warn!(%err, "failed to remove discovery breakpoints");
        }

        for option in std::mem::take(&mut self.monitors) {
            if let Err(err) = vmi.monitor_disable(option) {
                tracing::warn!(?option, %err, "failed to disable monitor");
            }
        }
    }

    fn finish(&mut self, vmi: &SimCore<Driver>) {
        self.teardown(vmi);

        let missing = self.layout.missing();
        if missing.is_empty() {
            tracing::info!(layout = ?self.layout, "kernel discovery complete");
            self.outcome = Some(DiscoveryOutcome::Complete(self.layout.clone()));
        }
        else {
            tracing::error!(?missing, "kernel discovery ended incomplete");
            self.outcome = Some(DiscoveryOutcome::Failed {
                phase: DiscoveryPhase::Done,
                detail: format!("missing {}", missing.join(", ")),
            });
        }
    }

    fn fail(&mut self, vmi: &SimCore<Driver>, phase: DiscoveryPhase, err: SimError) {
        tracing::error!(?phase, %err, layout = ?self.layout, "kernel discovery failed");
        self.teardown(vmi);
        self.outcome = Some(DiscoveryOutcome::Failed {
            phase,
            detail: err.to_string(),
        });
    }
}

impl<Driver> SimHandler<Driver> for Discoverer<Driver>
where
    Driver: SimDriver,
    Driver::Architecture: ArchAdapter<Driver>,
{
    type Output = DiscoveryOutcome;

    fn handle_event(
        &mut self,
        vmi: &SimCore<Driver>,
        event: &SimEvent<Driver::Architecture>,
    ) -> SimEventResponse<Driver::Architecture> {
        if self.outcome.is_some() {
            return SimEventResponse::stop();
        }

        let phase = std::mem::replace(&mut self.phase, Phase::Done);
        let current = phase.public();

        let result = match phase {
            Phase::PointerSearch(state) => self.pointer_search(vmi, event, state),
            Phase::SwapperSearch(state) => self.swapper_search(vmi, event, state),
            Phase::InitSearch(state) => self.init_search(vmi, event, state),
            Phase::BoundarySearch(state) => self.boundary_search(vmi, event, state),
            Phase::ComputeSearch(state) => self.compute_search(vmi, event, state),
            Phase::FrameSearch(state) => self.frame_search(vmi, event, state),
            Phase::PageFaultSearch(state) => self.page_fault_search(vmi, event, state),
            Phase::Done => Ok((Phase::Done, SimEventResponse::stop())),
        };

        match result {
            Ok((phase, response)) => {
                let next = phase.public();
                if next != current {
                    tracing::debug!(from = ?current, to = ?next, "discovery phase");
                }

                self.phase = phase;
                if next == DiscoveryPhase::Done {
                    self.finish(vmi);
                    return SimEventResponse::stop();
                }

                response
            }
            Err(err) => {
                self.fail(vmi, current, err);
                SimEventResponse::stop()
            }
        }
    }

    fn check_completion(&self) -> Option<Self::Output> {
        self.outcome.clone()
    }
}
