use std::collections::HashSet;

use simi_core::{
    Architecture as _, EventReason, Pa, ProcessorMode, Registers as _, SimCore, SimDriver,
    SimEvent, SimEventResponse, Va,
};

use super::{AmbiguityPolicy, Discoverer, DiscoveryPhase, Phase, Step};
use crate::{ArchAdapter, CurrentTaskAddressing};

/// State of the current-task pointer search.
pub(super) struct PointerSearch {
    samples: u64,
    seen: HashSet<Va>,
    hits: Vec<Va>,
    addressing: CurrentTaskAddressing,

    /// Hits of the last full scan.
    last_scan: Option<usize>,

    /// A kernel sample had no current task before the first scan.
    from_boot: bool,
}

impl Default for PointerSearch {
    fn default() -> Self {
        Self {
            samples: 0,
            seen: HashSet::new(),
            hits: Vec::new(),
            addressing: CurrentTaskAddressing::SegmentRelative,
            last_scan: None,
            from_boot: false,
        }
    }
}

/// Checks whether two scans of the same kind disagree by more than a factor
/// of two.
fn materially_different(previous: usize, current: usize) -> bool {
    previous.max(current) > previous.min(current).saturating_mul(2)
}

/// A window of physical memory that backs a virtual range.
#[derive(Debug, Clone, Copy)]
pub(super) struct ScanWindow {
    /// Virtual address reported for the first cell.
    pub va_start: Va,

    /// Physical address of the first cell.
    pub pa_start: Pa,

    /// Number of cells.
    pub cells: u64,

    /// Cell size in bytes.
    pub word: u64,
}

/// Scans the window for aligned cells that hold `value`.
///
/// The scan is linear in physical memory and stops at the first page the
/// simulator cannot read, or once `max_hits` candidates were found.
pub(super) fn scan_for_pointer<Driver>(
    vmi: &SimCore<Driver>,
    window: ScanWindow,
    value: Va,
    max_hits: usize,
) -> Vec<Va>
where
    Driver: SimDriver,
{
    let word = window.word.clamp(1, 8);
    let bytes = value.0.to_le_bytes();
    let needle = &bytes[..word as usize];
    let end = window.pa_start + window.cells.saturating_mul(word);

    let mut hits = Vec::new();
    let mut pa = window.pa_start;

    while pa < end {
        let gfn = Driver::Architecture::gfn_from_pa(pa);
        let page = match vmi.read_page(gfn) {
            Ok(page) => page,
            Err(err) => {
                tracing::debug!(%pa, %err, "current task scan stopped");
                break;
            }
        };

        let offset = Driver::Architecture::pa_offset(pa) as usize;
        let limit = usize::min(page.len(), offset + (end.0 - pa.0) as usize);
        let data = &page[offset..limit];

        for position in memchr::memmem::find_iter(data, needle) {
            let relative = pa.0 - window.pa_start.0 + position as u64;
            if relative % word != 0 {
                continue;
            }

            hits.push(window.va_start + relative);
            if hits.len() >= max_hits {
                tracing::warn!(max_hits, "current task scan truncated");
                return hits;
            }
        }

        pa = Driver::Architecture::pa_from_gfn(gfn) + Driver::Architecture::PAGE_SIZE;
    }

    hits
}

/// Keeps the candidates that hold `value` now.
///
/// The result never has more entries than `hits`.
pub(super) fn check_hits<Driver>(
    vmi: &SimCore<Driver>,
    registers: &<Driver::Architecture as simi_core::Architecture>::Registers,
    addressing: CurrentTaskAddressing,
    hits: &[Va],
    value: Va,
    word: u64,
) -> Vec<Va>
where
    Driver: SimDriver,
{
    hits.iter()
        .copied()
        .filter(|hit| {
            let cell = match addressing {
                CurrentTaskAddressing::SegmentRelative => *hit + registers.segment_base(),
                CurrentTaskAddressing::Absolute => *hit,
            };

            matches!(
                vmi.read_va(registers.access_context(cell), word as usize),
                Ok(current) if current == value
            )
        })
        .collect()
}

impl<Driver> Discoverer<Driver>
where
    Driver: SimDriver,
    Driver::Architecture: ArchAdapter<Driver>,
{
    pub(super) fn pointer_search(
        &mut self,
        vmi: &SimCore<Driver>,
        event: &SimEvent<Driver::Architecture>,
        mut state: PointerSearch,
    ) -> Step<Driver> {
        let budget = self.limits.sample_budget;

        if !matches!(event.reason(), EventReason::Stop) {
            return Ok((Phase::PointerSearch(state), SimEventResponse::default()));
        }

        let registers = event.registers();

        state.samples += 1;
        if state.samples > self.limits.sample_iterations {
            return self.resolve_ambiguity(vmi, registers, state);
        }

        if registers.privilege() != ProcessorMode::Kernel {
            return Ok((Phase::PointerSearch(state), SimEventResponse::run_for(budget)));
        }

        let task = match Driver::Architecture::current_task_hint(
            vmi,
            registers,
            self.limits.thread_size,
        ) {
            Ok(task) if !task.is_null() => task,
            Ok(_) => {
                if state.last_scan.is_none() {
                    state.from_boot = true;
                }
                return Ok((Phase::PointerSearch(state), SimEventResponse::run_for(budget)));
            }
            Err(err) => {
                tracing::trace!(%err, "no task at the bottom of the kernel stack");
                return Ok((Phase::PointerSearch(state), SimEventResponse::run_for(budget)));
            }
        };

        if !state.seen.insert(task) {
            return Ok((Phase::PointerSearch(state), SimEventResponse::run_for(budget)));
        }

        let word = registers.address_width() as u64;

        if state.hits.is_empty() {
            self.full_scan(vmi, registers, &mut state, task, word);

            tracing::debug!(
                %task,
                hits = state.hits.len(),
                addressing = ?state.addressing,
                "current task scan"
            );
        }
        else {
            let before = state.hits.len();
            state.hits = check_hits(vmi, registers, state.addressing, &state.hits, task, word);
            tracing::debug!(%task, before, after = state.hits.len(), "current task candidates");

            if state.hits.is_empty() {
                tracing::warn!(%task, "every current task candidate eliminated, rescanning");
            }
        }

        match state.hits.len() {
            1 | 2 => {
                let cell = state.hits[0];
                self.accept_current_task(vmi, registers, cell, word, state)
            }
            _ => Ok((Phase::PointerSearch(state), SimEventResponse::run_for(budget))),
        }
    }

    /// Scans for `task` and switches the addressing when the result looks
    /// wrong.
    ///
    /// The first scan is suspect when it finds nothing, or when a
    /// segment-relative scan finds only one or two cells on a guest that was
    /// not sampled from boot. A rescan, after every candidate went stale, is
    /// suspect when its size differs materially from the previous scan. A
    /// suspect scan is repeated with the other addressing, which is kept if
    /// it finds a different, non-empty set of cells.
    fn full_scan(
        &self,
        vmi: &SimCore<Driver>,
        registers: &<Driver::Architecture as simi_core::Architecture>::Registers,
        state: &mut PointerSearch,
        task: Va,
        word: u64,
    ) {
        let hits = self.scan(vmi, registers, state.addressing, task, word);

        let suspect = match (state.last_scan, state.addressing) {
            (Some(previous), _) => materially_different(previous, hits.len()),
            (None, CurrentTaskAddressing::SegmentRelative) => {
                hits.is_empty() || (!state.from_boot && hits.len() <= 2)
            }
            (None, CurrentTaskAddressing::Absolute) => hits.is_empty(),
        };

        state.last_scan = Some(hits.len());

        if !suspect {
            state.hits = hits;
            return;
        }

        let other = match state.addressing {
            CurrentTaskAddressing::SegmentRelative => CurrentTaskAddressing::Absolute,
            CurrentTaskAddressing::Absolute => CurrentTaskAddressing::SegmentRelative,
        };

        let alternative = self.scan(vmi, registers, other, task, word);

        if alternative.is_empty() || alternative == hits {
            state.hits = hits;
            return;
        }

        tracing::debug!(
            %task,
            from = ?state.addressing,
            to = ?other,
            hits = hits.len(),
            alternative = alternative.len(),
            "current task addressing switched"
        );

        state.addressing = other;
        state.last_scan = Some(alternative.len());
        state.hits = alternative;
    }

    fn scan(
        &self,
        vmi: &SimCore<Driver>,
        registers: &<Driver::Architecture as simi_core::Architecture>::Registers,
        addressing: CurrentTaskAddressing,
        task: Va,
        word: u64,
    ) -> Vec<Va> {
        let va_start = Va(self.limits.scan_start);
        let first = self.current_task_cell(registers, addressing, va_start);

        let pa_start = match vmi.translate_access_context(registers.access_context(first)) {
            Ok(pa) => pa,
            Err(err) => {
                tracing::warn!(va = %first, %err, "current task scan start is not mapped");
                return Vec::new();
            }
        };

        let window = ScanWindow {
            va_start,
            pa_start,
            cells: self.limits.scan_cells,
            word,
        };

        scan_for_pointer(vmi, window, task, self.limits.max_hits)
    }

    fn resolve_ambiguity(
        &mut self,
        vmi: &SimCore<Driver>,
        registers: &<Driver::Architecture as simi_core::Architecture>::Registers,
        state: PointerSearch,
    ) -> Step<Driver> {
        let candidates = state.hits.len();

        match self.limits.ambiguity_policy {
            AmbiguityPolicy::SecondToLast if candidates > 2 => {
                let cell = state.hits[candidates - 2];
                tracing::warn!(
                    candidates,
                    %cell,
                    "current task candidates did not narrow, taking the second-to-last"
                );

                let word = registers.address_width() as u64;
                self.accept_current_task(vmi, registers, cell, word, state)
            }
            _ => Err(Self::ceiling(
                DiscoveryPhase::LocatingCurrentTaskPointer,
                format!(
                    "{candidates} candidates left after {} samples",
                    self.limits.sample_iterations
                ),
            )),
        }
    }

    fn accept_current_task(
        &mut self,
        vmi: &SimCore<Driver>,
        registers: &<Driver::Architecture as simi_core::Architecture>::Registers,
        cell: Va,
        word: u64,
        state: PointerSearch,
    ) -> Step<Driver> {
        tracing::info!(
            current_task = %cell,
            addressing = ?state.addressing,
            candidates = state.hits.len(),
            samples = state.samples,
            "current task pointer located"
        );

        self.layout.set_current_task(cell)?;
        self.layout.set_current_task_addressing(state.addressing)?;
        self.layout.set_word_size(word)?;
        self.layout.set_kernel_base(self.kernel_base())?;

        self.start_swapper_search(vmi, registers, state.seen)
    }
}
