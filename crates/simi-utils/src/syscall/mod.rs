//! Syscall entry/exit tracking.
//!
//! The tracker pairs syscall entries with their exits, per thread. Entries
//! are caught at up to three places: the fast system call entry, the
//! software interrupt gate, and the handlers the syscall table dispatches to.
//! Exits are caught at the fast system call return and at the interrupt
//! return.
//!
//! A thread has at most one open boundary. Another entry on the same thread
//! is accepted only in the recognized nested cases:
//!
//! - the same syscall seen again at a second entry point,
//! - `close` while `execve` is pending (the kernel closes descriptors on
//!   exec),
//! - `pipe2` while `pipe` is pending,
//! - `sigreturn`, which abandons the boundary the signal interrupted.
//!
//! Anything else is an invariant violation: it is logged, counted, and the
//! new entry is dropped. The open boundary stays untouched.
//!
//! Matches are reported to the consumer's callback, which decides whether
//! the simulation halts.

mod details;
mod params;

use std::collections::{BTreeSet, HashMap, HashSet};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use simi_core::{
    Architecture, BreakpointHandle, BreakpointRequest, EventBreakpoint, EventReason,
    MemoryAccess, Registers as _, SimCore, SimDriver, SimError, SimEvent, SimEventResponse,
    SimHandler, Va,
    watch::{Liveness, WatchRegistry},
};
use simi_os_linux::{
    ArchAdapter, LinuxError, LinuxKernel, SyscallEntry, SyscallFrame, SyscallTable, TaskRecord,
};

pub use self::{
    details::SyscallDetails,
    params::{CallParams, MatchParam, ParamFlags},
};

/// Bytes of a `write` buffer captured at the entry.
const DEFAULT_WRITE_CAPTURE: usize = 4096;

/// Parent records kept for children that have not returned yet.
const MAX_PENDING_CHILDREN: usize = 64;

/// `clone` flag: the child joins the caller's thread group.
const CLONE_THREAD: u64 = 0x0001_0000;

bitflags::bitflags! {
    /// Entry points to install breakpoints at.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct EntryForms: u8 {
        /// The fast system call entry (`sysenter`).
        const FAST_ENTRY = 1 << 0;

        /// The software interrupt gate (`int 0x80`).
        const TRAP = 1 << 1;

        /// The handler of each tracked syscall, looked up in the syscall
        /// table.
        const COMPUTED = 1 << 2;
    }
}

impl Default for EntryForms {
    fn default() -> Self {
        Self::FAST_ENTRY | Self::TRAP
    }
}

/// The syscalls to track.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyscallSelection {
    /// Every syscall.
    #[default]
    All,

    /// The listed syscall numbers.
    Numbers(BTreeSet<u64>),
}

impl SyscallSelection {
    /// Checks whether `callnum` is tracked.
    pub fn contains(&self, callnum: u64) -> bool {
        match self {
            Self::All => true,
            Self::Numbers(numbers) => numbers.contains(&callnum),
        }
    }
}

/// Options for [`SyscallTracker`].
#[derive(Debug, Clone)]
pub struct TrackerOptions {
    /// Entry points to install breakpoints at.
    pub entries: EntryForms,

    /// The syscalls to track.
    pub selection: SyscallSelection,

    /// Match criteria, reported through the callback.
    pub criteria: Vec<CallParams>,

    /// Bytes of a `write` buffer captured at the entry.
    pub write_capture: usize,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            entries: EntryForms::default(),
            selection: SyscallSelection::All,
            criteria: Vec::new(),
            write_capture: DEFAULT_WRITE_CAPTURE,
        }
    }
}

impl TrackerOptions {
    /// Sets [`entries`](Self::entries).
    pub fn with_entries(self, entries: EntryForms) -> Self {
        Self { entries, ..self }
    }

    /// Tracks only the listed syscall numbers.
    pub fn with_numbers(self, numbers: impl IntoIterator<Item = u64>) -> Self {
        Self {
            selection: SyscallSelection::Numbers(numbers.into_iter().collect()),
            ..self
        }
    }

    /// Adds match criteria.
    pub fn with_criteria(mut self, params: CallParams) -> Self {
        self.criteria.push(params);
        self
    }

    /// Sets [`write_capture`](Self::write_capture).
    pub fn with_write_capture(self, write_capture: usize) -> Self {
        Self {
            write_capture,
            ..self
        }
    }
}

/// The thread that made a syscall.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadIdentity {
    /// The `task_struct`.
    pub task: Va,

    /// The thread id.
    pub pid: u32,

    /// The process id.
    pub tgid: u32,

    /// The command name.
    pub comm: String,
}

impl From<&TaskRecord> for ThreadIdentity {
    fn from(value: &TaskRecord) -> Self {
        Self {
            task: value.address,
            pid: value.pid,
            tgid: value.tgid,
            comm: value.comm.clone(),
        }
    }
}

/// Progress of an open boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryState {
    /// The entry was seen, but an argument is still being read.
    EntrySeen,

    /// The entry is decoded and the exit is awaited.
    ExitPending,
}

/// A syscall from its entry to its exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyscallRecord {
    /// The calling thread.
    pub thread: ThreadIdentity,

    /// The syscall number.
    pub callnum: u64,

    /// The syscall name.
    pub name: String,

    /// The entry point the syscall was caught at.
    pub entry: SyscallEntry,

    /// The entry frame.
    pub frame: SyscallFrame,

    /// The decoded arguments and results.
    pub details: SyscallDetails,

    /// The return value, or `None` for syscalls that do not return.
    pub result: Option<i64>,
}

#[derive(Debug)]
struct Boundary {
    state: BoundaryState,
    record: SyscallRecord,

    /// The child of a pending `fork` or `clone` already returned.
    child_returned: bool,
}

/// A syscall that satisfied match criteria.
#[derive(Debug)]
pub struct SyscallMatch<'a> {
    /// The closed syscall.
    pub record: &'a SyscallRecord,

    /// Index of the criteria in [`TrackerOptions::criteria`].
    pub criteria: usize,

    /// The criteria.
    pub params: &'a CallParams,

    /// How many syscalls satisfied the criteria so far.
    pub occurrence: u64,
}

/// The consumer's decision on a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchVerdict {
    /// Keep running.
    Continue,

    /// Stop the simulation.
    Halt,
}

/// A handle to stop a running [`SyscallTracker`].
#[derive(Debug, Clone)]
pub struct TrackerHandle {
    liveness: Liveness,
}

impl TrackerHandle {
    /// Stops tracking.
    ///
    /// Events that still arrive are ignored; the breakpoints are removed
    /// when the tracker handles the next event or is torn down.
    pub fn stop(&self) {
        self.liveness.revoke();
    }

    /// Checks whether the tracker is still running.
    pub fn is_running(&self) -> bool {
        self.liveness.is_alive()
    }
}

/// Totals reported when the tracker completes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrackerSummary {
    /// Closed boundaries.
    pub closed: usize,

    /// Invariant violations.
    pub violations: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum WatchTag {
    /// A syscall entry. For computed entries, the syscalls dispatched to
    /// the handler.
    Entry {
        form: SyscallEntry,
        callnums: Vec<u64>,
    },

    /// A kernel exit.
    Exit { interrupt_return: bool },

    /// The path of a pending `open`.
    Path { task: Va },
}

/// Syscall entry/exit tracker.
pub struct SyscallTracker<Driver, F>
where
    Driver: SimDriver,
    Driver::Architecture: ArchAdapter<Driver>,
    F: FnMut(&SyscallMatch) -> MatchVerdict,
{
    kernel: LinuxKernel<Driver>,
    table: SyscallTable,
    options: TrackerOptions,
    on_match: F,

    watches: WatchRegistry<WatchTag>,

    /// * Key: `task_struct` of the calling thread
    /// * Value: the open boundary
    boundaries: IndexMap<Va, Boundary>,

    /// * Key: pid of a child whose parent returned first
    /// * Value: the parent's closed record
    pending_children: IndexMap<u32, SyscallRecord>,

    /// Threads seen at an entry or an exit.
    known: HashSet<Va>,

    /// Matches so far, per criteria.
    occurrences: Vec<u64>,

    /// * Key: (tgid, fd) of a socket bound under watch
    /// * Value: index of the criteria that put it under watch
    sockets: HashMap<(u32, u64), usize>,

    records: Vec<SyscallRecord>,
    closed: usize,
    violations: usize,
    liveness: Liveness,
}

impl<Driver, F> SyscallTracker<Driver, F>
where
    Driver: SimDriver,
    Driver::Architecture: ArchAdapter<Driver>,
    F: FnMut(&SyscallMatch) -> MatchVerdict,
{
    /// Creates a new tracker.
    pub fn new(
        kernel: LinuxKernel<Driver>,
        table: SyscallTable,
        options: TrackerOptions,
        on_match: F,
    ) -> Self {
        let occurrences = vec![0; options.criteria.len()];

        Self {
            kernel,
            table,
            options,
            on_match,
            watches: WatchRegistry::new(),
            boundaries: IndexMap::new(),
            pending_children: IndexMap::new(),
            known: HashSet::new(),
            occurrences,
            sockets: HashMap::new(),
            records: Vec::new(),
            closed: 0,
            violations: 0,
            liveness: Liveness::new(),
        }
    }

    /// Installs the entry and exit breakpoints.
    ///
    /// `registers` must be those of a kernel context, as computed entries
    /// are read from the syscall table.
    pub fn arm(
        &mut self,
        vmi: &SimCore<Driver>,
        registers: &<Driver::Architecture as Architecture>::Registers,
    ) -> Result<TrackerHandle, SimError> {
        let layout = self.kernel.layout().clone();
        let mut entries = 0;

        if self.options.entries.contains(EntryForms::FAST_ENTRY) {
            match layout.sysenter() {
                Some(va) => {
                    self.watch_entry(vmi, va, SyscallEntry::FastEntry, Vec::new())?;
                    entries += 1;
                }
                None => tracing::warn!("no fast system call entry in the layout"),
            }
        }

        if self.options.entries.contains(EntryForms::TRAP) {
            match layout.sys_entry() {
                Some(va) => {
                    self.watch_entry(vmi, va, SyscallEntry::Trap, Vec::new())?;
                    entries += 1;
                }
                None => tracing::warn!("no software interrupt entry in the layout"),
            }
        }

        if self.options.entries.contains(EntryForms::COMPUTED) {
            let callnums: Vec<u64> = match &self.options.selection {
                SyscallSelection::All => self.table.iter().map(|(number, _)| number).collect(),
                SyscallSelection::Numbers(numbers) => numbers.iter().copied().collect(),
            };

            // Unimplemented syscalls share one handler.
            let mut handlers = IndexMap::<Va, Vec<u64>>::new();
            for callnum in callnums {
                match self.kernel.syscall_entry(vmi, registers, callnum) {
                    Ok(handler) if !handler.is_null() => {
                        handlers.entry(handler).or_default().push(callnum);
                    }
                    Ok(_) => tracing::debug!(callnum, "no syscall handler"),
                    Err(err) => tracing::warn!(callnum, %err, "syscall handler not readable"),
                }
            }

            for (handler, callnums) in handlers {
                self.watch_entry(vmi, handler, SyscallEntry::Computed, callnums)?;
                entries += 1;
            }
        }

        if entries == 0 {
            return Err(LinuxError::LayoutIncomplete("syscall entry").into());
        }

        let exits = [(layout.sysexit(), false), (layout.iretd(), true)];

        let mut armed_exits = 0;
        for (va, interrupt_return) in exits {
            if let Some(va) = va {
                self.watches.insert(
                    vmi,
                    BreakpointRequest::execute(va),
                    WatchTag::Exit { interrupt_return },
                )?;
                armed_exits += 1;
            }
        }

        if armed_exits == 0 {
            return Err(LinuxError::LayoutIncomplete("sysexit").into());
        }

        tracing::info!(entries, exits = armed_exits, "syscall tracking armed");
        Ok(self.handle())
    }

    /// Returns a handle to stop the tracker.
    pub fn handle(&self) -> TrackerHandle {
        TrackerHandle {
            liveness: self.liveness.clone(),
        }
    }

    /// Removes every breakpoint and drops the open boundaries.
    pub fn teardown(&mut self, vmi: &SimCore<Driver>) -> Result<(), SimError> {
        self.liveness.revoke();
        self.boundaries.clear();
        self.pending_children.clear();
        self.known.clear();
        self.watches.clear(vmi)
    }

    /// Returns the number of open boundaries.
    pub fn open_boundaries(&self) -> usize {
        self.boundaries.len()
    }

    /// Returns the open boundary of a thread.
    pub fn open_boundary(&self, task: Va) -> Option<(BoundaryState, &SyscallRecord)> {
        self.boundaries
            .get(&task)
            .map(|boundary| (boundary.state, &boundary.record))
    }

    /// Returns the number of invariant violations so far.
    pub fn violations(&self) -> usize {
        self.violations
    }

    /// Takes the syscalls closed since the last call.
    pub fn take_records(&mut self) -> Vec<SyscallRecord> {
        std::mem::take(&mut self.records)
    }

    fn watch_entry(
        &mut self,
        vmi: &SimCore<Driver>,
        va: Va,
        form: SyscallEntry,
        callnums: Vec<u64>,
    ) -> Result<(), SimError> {
        tracing::debug!(%va, ?form, ?callnums, "syscall entry watch");
        self.watches.insert(
            vmi,
            BreakpointRequest::execute(va),
            WatchTag::Entry { form, callnums },
        )?;
        Ok(())
    }

    fn current_thread(
        &self,
        vmi: &SimCore<Driver>,
        registers: &<Driver::Architecture as Architecture>::Registers,
    ) -> Option<TaskRecord> {
        match self.kernel.current_process(vmi, registers) {
            Ok(task) => Some(task),
            Err(err) => {
                tracing::warn!(%err, "current thread not readable, event dropped");
                None
            }
        }
    }

    fn handle_entry(
        &mut self,
        vmi: &SimCore<Driver>,
        event: &SimEvent<Driver::Architecture>,
        form: SyscallEntry,
        callnums: &[u64],
    ) -> SimEventResponse<Driver::Architecture> {
        let registers = event.registers();

        let frame = match <Driver::Architecture as ArchAdapter<Driver>>::syscall_frame(vmi, registers, form) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(?form, %err, "syscall frame not readable, entry dropped");
                return SimEventResponse::default();
            }
        };

        let callnum = frame.callnum;

        if !self.options.selection.contains(callnum) {
            return SimEventResponse::default();
        }

        // A shared handler, or a kernel-internal call of a handler.
        if !callnums.is_empty() && !callnums.contains(&callnum) {
            tracing::trace!(callnum, ?callnums, "syscall number does not match the handler");
            return SimEventResponse::default();
        }

        let Some(task) = self.current_thread(vmi, registers)
        else {
            return SimEventResponse::default();
        };

        self.known.insert(task.address);

        let thread = ThreadIdentity::from(&task);
        let name = self.table.name(callnum).to_owned();

        if let Some(open) = self.boundaries.get(&thread.task) {
            let pending = open.record.name.as_str();

            match (pending, name.as_str()) {
                _ if open.record.callnum == callnum
                    && (open.record.entry != form || open.record.frame.pc == frame.pc) =>
                {
                    tracing::trace!(callnum, ?form, "syscall seen at a second entry point");
                    return SimEventResponse::default();
                }
                ("execve", "close") => {
                    tracing::debug!(pid = thread.pid, "close during execve ignored");
                    return SimEventResponse::default();
                }
                ("pipe", "pipe2") => {
                    tracing::debug!(pid = thread.pid, "pipe continued as pipe2");
                    self.boundaries.shift_remove(&thread.task);
                }
                (_, "sigreturn" | "rt_sigreturn") => {
                    tracing::debug!(
                        pid = thread.pid,
                        interrupted = pending,
                        "signal return abandons the interrupted syscall"
                    );
                    self.boundaries.shift_remove(&thread.task);
                }
                _ => {
                    tracing::error!(
                        pid = thread.pid,
                        comm = %thread.comm,
                        open = %open.record.name,
                        open_callnum = open.record.callnum,
                        callnum,
                        name = %name,
                        "syscall entry while another syscall is open"
                    );
                    self.violations += 1;
                    return SimEventResponse::default();
                }
            }
        }

        let (details, deferred) = match SyscallDetails::from_entry(
            vmi,
            registers,
            &name,
            &frame,
            self.options.write_capture,
        ) {
            Ok(decoded) => decoded,
            Err(err) => {
                tracing::warn!(callnum, name = %name, %err, "syscall arguments not readable, entry dropped");
                return SimEventResponse::default();
            }
        };

        tracing::debug!(pid = thread.pid, callnum, name = %name, ?form, "syscall entry");

        let record = SyscallRecord {
            thread,
            callnum,
            name,
            entry: form,
            frame,
            details,
            result: None,
        };

        // No return to user space.
        if matches!(
            record.details,
            SyscallDetails::Exit { .. } | SyscallDetails::SigReturn
        ) {
            return self.close(record);
        }

        let mut state = BoundaryState::ExitPending;

        if let Some(path) = deferred {
            let request = BreakpointRequest::linear(path, MemoryAccess::R, 1);
            let tag = WatchTag::Path {
                task: record.thread.task,
            };

            match self.watches.insert(vmi, request, tag) {
                Ok(_) => state = BoundaryState::EntrySeen,
                Err(err) => tracing::warn!(%path, %err, "path watch not installed"),
            }
        }

        self.boundaries.insert(
            record.thread.task,
            Boundary {
                state,
                record,
                child_returned: false,
            },
        );

        SimEventResponse::default()
    }

    fn handle_path(
        &mut self,
        vmi: &SimCore<Driver>,
        event: &SimEvent<Driver::Architecture>,
        handle: BreakpointHandle,
        task: Va,
    ) -> SimEventResponse<Driver::Architecture> {
        let registers = event.registers();

        let Some(boundary) = self.boundaries.get_mut(&task)
        else {
            self.remove_watch(vmi, handle);
            return SimEventResponse::default();
        };

        let SyscallDetails::Open {
            path_address, path, ..
        } = &mut boundary.record.details
        else {
            self.remove_watch(vmi, handle);
            return SimEventResponse::default();
        };

        match vmi.read_string(registers.access_context(*path_address)) {
            Ok(value) => {
                tracing::debug!(pid = boundary.record.thread.pid, path = %value, "deferred path read");
                *path = Some(value);
                boundary.state = BoundaryState::ExitPending;
                self.remove_watch(vmi, handle);
            }
            Err(err) => {
                tracing::trace!(address = %path_address, %err, "path still not resident");
            }
        }

        SimEventResponse::default()
    }

    fn handle_exit(
        &mut self,
        vmi: &SimCore<Driver>,
        event: &SimEvent<Driver::Architecture>,
        interrupt_return: bool,
    ) -> SimEventResponse<Driver::Architecture> {
        let registers = event.registers();

        if interrupt_return && let Some(kernel_base) = self.kernel.layout().kernel_base() {
            match <Driver::Architecture as ArchAdapter<Driver>>::returns_to_kernel(
                vmi,
                registers,
                kernel_base,
            ) {
                Ok(true) => return SimEventResponse::default(),
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(%err, "interrupt frame not readable, exit dropped");
                    return SimEventResponse::default();
                }
            }
        }

        let Some(task) = self.current_thread(vmi, registers)
        else {
            return SimEventResponse::default();
        };

        let result = signed_result(registers);
        let first_seen = self.known.insert(task.address);

        if let Some(boundary) = self.boundaries.shift_remove(&task.address) {
            let mut record = boundary.record;

            if boundary.state == BoundaryState::EntrySeen {
                tracing::warn!(pid = record.thread.pid, name = %record.name, "path never became readable");
                let stale = self.watches.handles_where(|watch| {
                    watch.tag == WatchTag::Path { task: task.address }
                });
                for handle in stale {
                    self.remove_watch(vmi, handle);
                }
            }

            record.details.complete(vmi, registers, result);
            record.result = Some(result);

            tracing::debug!(pid = record.thread.pid, name = %record.name, result, "syscall exit");

            if !boundary.child_returned {
                self.await_child(&record, result);
            }

            return self.close(record);
        }

        if result == 0 {
            return self.handle_child_return(&task, first_seen);
        }

        SimEventResponse::default()
    }

    /// Keeps the record of a `fork` or `clone` whose parent returned before
    /// the child did.
    fn await_child(&mut self, record: &SyscallRecord, result: i64) {
        if !matches!(
            record.details,
            SyscallDetails::Fork { .. } | SyscallDetails::Clone { .. }
        ) {
            return;
        }

        let Ok(child) = u32::try_from(result)
        else {
            return;
        };

        if child == 0 {
            return;
        }

        if self.pending_children.len() >= MAX_PENDING_CHILDREN {
            self.pending_children.shift_remove_index(0);
        }

        tracing::trace!(parent = record.thread.pid, child, "awaiting child return");
        self.pending_children.insert(child, record.clone());
    }

    /// The first return of a new task, from the parent's `fork`, `vfork` or
    /// `clone`.
    ///
    /// The parent is either already closed, with its record kept under the
    /// child's pid, or still open. An open `fork` is matched through the
    /// child's `real_parent`. A thread created by `clone(CLONE_THREAD)` has
    /// the caller's parent instead, so it is matched on the thread group, and
    /// only if the thread was never seen before.
    fn handle_child_return(
        &mut self,
        task: &TaskRecord,
        first_seen: bool,
    ) -> SimEventResponse<Driver::Architecture> {
        let parent = match self.pending_children.shift_remove(&task.pid) {
            Some(parent) => parent,
            None => {
                let open = self.boundaries.values_mut().find(|boundary| {
                    let thread = &boundary.record.thread;

                    if boundary.child_returned || thread.task == task.address {
                        return false;
                    }

                    match boundary.record.details {
                        SyscallDetails::Fork { .. } => thread.task == task.real_parent,
                        SyscallDetails::Clone { flags, .. } if flags & CLONE_THREAD != 0 => {
                            first_seen && thread.tgid == task.tgid
                        }
                        SyscallDetails::Clone { .. } => thread.task == task.real_parent,
                        _ => false,
                    }
                });

                let Some(open) = open
                else {
                    return SimEventResponse::default();
                };

                open.child_returned = true;
                open.record.clone()
            }
        };

        tracing::debug!(
            parent = parent.thread.pid,
            child = task.pid,
            name = %parent.name,
            "child returned"
        );

        let record = SyscallRecord {
            thread: ThreadIdentity::from(task),
            result: Some(0),
            ..parent
        };

        self.close(record)
    }

    fn close(&mut self, record: SyscallRecord) -> SimEventResponse<Driver::Architecture> {
        let mut halt = false;
        let tgid = record.thread.tgid;

        let matched: Vec<usize> = self
            .options
            .criteria
            .iter()
            .enumerate()
            .filter(|(_, params)| params.matches(&record.name, &record.details))
            .map(|(index, _)| index)
            .collect();

        for index in matched {
            self.occurrences[index] += 1;
            let occurrence = self.occurrences[index];
            let params = &self.options.criteria[index];

            if params.nth.is_some_and(|nth| nth != occurrence) {
                continue;
            }

            if params.watches_socket(&record.details)
                && let Some(fd) = record.details.fd()
            {
                tracing::debug!(tgid, fd, "socket under watch");
                self.sockets.insert((tgid, fd), index);
            }

            halt |= self.signal(&record, index, occurrence);
        }

        if let Some(fd) = record.details.fd() {
            let inherited = match &record.details {
                SyscallDetails::Socket {
                    call: Some(call), ..
                } if call.uses_bound_socket() => self.sockets.get(&(tgid, fd)).copied(),
                SyscallDetails::Close { .. } => self.sockets.remove(&(tgid, fd)),
                _ => None,
            };

            if let Some(index) = inherited {
                let occurrence = self.occurrences[index];
                halt |= self.signal(&record, index, occurrence);
            }
        }

        self.closed += 1;
        self.records.push(record);

        if halt {
            SimEventResponse::stop()
        }
        else {
            SimEventResponse::default()
        }
    }

    fn signal(&mut self, record: &SyscallRecord, index: usize, occurrence: u64) -> bool {
        let params = &self.options.criteria[index];

        tracing::info!(
            pid = record.thread.pid,
            name = %record.name,
            criteria = index,
            occurrence,
            break_simulation = params.break_simulation,
            "syscall matched"
        );

        let verdict = (self.on_match)(&SyscallMatch {
            record,
            criteria: index,
            params,
            occurrence,
        });

        verdict == MatchVerdict::Halt
    }

    fn remove_watch(&mut self, vmi: &SimCore<Driver>, handle: BreakpointHandle) {
        if let Err(err) = self.watches.remove(vmi, handle) {
            tracing::warn!(%handle, %err, "failed to remove watch");
        }
    }

    fn dispatch(
        &mut self,
        vmi: &SimCore<Driver>,
        event: &SimEvent<Driver::Architecture>,
        breakpoint: &EventBreakpoint,
    ) -> SimEventResponse<Driver::Architecture> {
        let Some(watch) = self.watches.get(breakpoint.handle)
        else {
            return SimEventResponse::default();
        };

        match watch.tag.clone() {
            WatchTag::Entry { form, callnums } => self.handle_entry(vmi, event, form, &callnums),
            WatchTag::Exit { interrupt_return } => self.handle_exit(vmi, event, interrupt_return),
            WatchTag::Path { task } => self.handle_path(vmi, event, breakpoint.handle, task),
        }
    }
}

impl<Driver, F> SimHandler<Driver> for SyscallTracker<Driver, F>
where
    Driver: SimDriver,
    Driver::Architecture: ArchAdapter<Driver>,
    F: FnMut(&SyscallMatch) -> MatchVerdict,
{
    type Output = TrackerSummary;

    fn handle_event(
        &mut self,
        vmi: &SimCore<Driver>,
        event: &SimEvent<Driver::Architecture>,
    ) -> SimEventResponse<Driver::Architecture> {
        if !self.liveness.is_alive() {
            if !self.watches.is_empty() || !self.boundaries.is_empty() {
                tracing::debug!("syscall tracking stopped");
                if let Err(err) = self.teardown(vmi) {
                    tracing::warn!(%err, "syscall tracker teardown failed");
                }
            }

            return SimEventResponse::default();
        }

        match event.reason() {
            EventReason::Breakpoint(breakpoint) => self.dispatch(vmi, event, breakpoint),
            _ => SimEventResponse::default(),
        }
    }

    fn check_completion(&self) -> Option<Self::Output> {
        if self.liveness.is_alive() {
            return None;
        }

        Some(TrackerSummary {
            closed: self.closed,
            violations: self.violations,
        })
    }
}

/// Returns the syscall result register, sign-extended from the register
/// width.
fn signed_result<Regs>(registers: &Regs) -> i64
where
    Regs: simi_core::Registers,
{
    let raw = registers.result();

    match registers.address_width() {
        4 => raw as u32 as i32 as i64,
        _ => raw as i64,
    }
}
