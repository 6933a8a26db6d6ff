//! Linux kernel introspection without symbols.
//!
//! A Linux guest is understood through a [`KernelLayout`]: the handful of
//! `task_struct` offsets and kernel addresses that the [`Discoverer`] infers
//! once per kernel image by watching the guest run. With a layout at hand,
//! [`LinuxKernel`] reads and enumerates tasks, and the [`SyscallTable`] maps
//! syscall numbers to names.

mod arch;
mod discovery;
mod enumerator;
mod error;
mod layout;
pub mod syscall;
mod task;

#[cfg(all(test, feature = "arch-x86"))]
mod mock;

use std::marker::PhantomData;

use simi_core::{Architecture, Registers as _, SimCore, SimDriver, SimError, StructReader, Va};

pub use self::{
    arch::ArchAdapter,
    discovery::{
        AmbiguityPolicy, DiscoveryLimits, DiscoveryOutcome, DiscoveryPhase, Discoverer,
    },
    enumerator::{EnumeratorOptions, TraversalRole},
    error::LinuxError,
    layout::{CurrentTaskAddressing, KernelLayout, LAYOUT_VERSION, TASK_COMM_LEN, TaskOffsets},
    syscall::{SyscallEntry, SyscallFrame, SyscallTable},
    task::{LIST_POISON1, LIST_POISON2, ListLink, ListLinks, TaskRecord},
};

/// Upper bound on the `real_parent` chain from any task to the swapper.
const MAX_ANCESTORS: usize = 1024;

/// Operations on a Linux guest with a known [`KernelLayout`].
pub struct LinuxKernel<Driver>
where
    Driver: SimDriver,
{
    layout: KernelLayout,
    offsets: TaskOffsets,
    options: EnumeratorOptions,

    _marker: PhantomData<Driver>,
}

impl<Driver> LinuxKernel<Driver>
where
    Driver: SimDriver,
{
    /// Creates a new `LinuxKernel` instance.
    ///
    /// Fails if the layout lacks any of the task offsets.
    pub fn new(layout: KernelLayout) -> Result<Self, SimError> {
        let offsets = layout.task_offsets()?;

        Ok(Self {
            layout,
            offsets,
            options: EnumeratorOptions::default(),
            _marker: PhantomData,
        })
    }

    /// Sets the enumerator options.
    pub fn with_options(self, options: EnumeratorOptions) -> Self {
        Self { options, ..self }
    }

    /// Returns the kernel layout.
    pub fn layout(&self) -> &KernelLayout {
        &self.layout
    }

    /// Returns the `task_struct` offsets.
    pub fn offsets(&self) -> &TaskOffsets {
        &self.offsets
    }

    /// Returns the enumerator options.
    pub fn options(&self) -> &EnumeratorOptions {
        &self.options
    }

    /// Reads a kernel pointer.
    pub fn read_pointer(
        &self,
        vmi: &SimCore<Driver>,
        registers: &<Driver::Architecture as Architecture>::Registers,
        va: Va,
    ) -> Result<Va, SimError> {
        vmi.read_va(
            registers.access_context(va),
            self.offsets.word_size as usize,
        )
    }

    /// Returns the address of the current-task cell for the processor
    /// state in `registers`.
    pub fn current_task_cell(
        &self,
        registers: &<Driver::Architecture as Architecture>::Registers,
    ) -> Va {
        match self.offsets.current_task_addressing {
            CurrentTaskAddressing::SegmentRelative => {
                self.offsets.current_task + registers.segment_base()
            }
            CurrentTaskAddressing::Absolute => self.offsets.current_task,
        }
    }

    /// Returns the `task_struct` of the running task.
    pub fn current_task(
        &self,
        vmi: &SimCore<Driver>,
        registers: &<Driver::Architecture as Architecture>::Registers,
    ) -> Result<Va, SimError> {
        self.read_pointer(vmi, registers, self.current_task_cell(registers))
    }

    /// Reads a task.
    pub fn read_task(
        &self,
        vmi: &SimCore<Driver>,
        registers: &<Driver::Architecture as Architecture>::Registers,
        task: Va,
    ) -> Result<TaskRecord, SimError> {
        let reader = StructReader::new_in(
            vmi,
            registers.access_context(task),
            self.offsets.span() as usize,
        )?;

        TaskRecord::from_reader(task, &reader, &self.offsets)
    }

    /// Reads the running task.
    pub fn current_process(
        &self,
        vmi: &SimCore<Driver>,
        registers: &<Driver::Architecture as Architecture>::Registers,
    ) -> Result<TaskRecord, SimError> {
        let task = self.current_task(vmi, registers)?;
        if task.is_null() {
            return Err(LinuxError::CorruptedStruct("current_task").into());
        }

        self.read_task(vmi, registers, task)
    }

    /// Finds the swapper by following `real_parent` from the running task
    /// until a task is its own parent.
    pub fn find_swapper(
        &self,
        vmi: &SimCore<Driver>,
        registers: &<Driver::Architecture as Architecture>::Registers,
    ) -> Result<Va, SimError> {
        let mut task = self.current_task(vmi, registers)?;

        for _ in 0..MAX_ANCESTORS {
            if task.is_null() {
                break;
            }

            let parent = self.read_pointer(vmi, registers, task + self.offsets.real_parent)?;
            if parent == task {
                return Ok(task);
            }

            task = parent;
        }

        Err(LinuxError::CorruptedStruct("task_struct.real_parent").into())
    }

    /// Returns the handler the syscall table dispatches `callnum` to.
    pub fn syscall_entry(
        &self,
        vmi: &SimCore<Driver>,
        registers: &<Driver::Architecture as Architecture>::Registers,
        callnum: u64,
    ) -> Result<Va, SimError> {
        let base = self
            .layout
            .syscall_jump()
            .ok_or(LinuxError::LayoutIncomplete("syscall_jump"))?;

        let word = self.offsets.word_size;
        let mut slot = Va(0).offset(base) + callnum.wrapping_mul(word);
        if word == 4 {
            slot = slot & 0xffff_ffff;
        }

        self.read_pointer(vmi, registers, slot)
    }
}
