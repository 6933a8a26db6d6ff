use simi_arch_x86::Registers;
use simi_core::{
    AddressSpace, BreakpointHandle, CpuId, EventBreakpoint, EventReason, MemoryAccess, Pa,
    SimEventResponseFlags,
};

use super::{
    pointer::{ScanWindow, check_hits, scan_for_pointer},
    *,
};
use crate::mock::{MockDriver, kernel_registers, make_vmi, user_registers};

const TASK_HINT: u32 = 0xaabb_0000;
const SWAPPER: u64 = 0x10000;
const INIT: u64 = 0x20000;
const KTHREADD: u64 = 0x30000;

const SYS_ENTRY: u64 = 0xc100_0100;
const SYSENTER: u64 = 0xc100_0200;
const DISPATCH: u64 = 0xc100_0101;
const IRETD: u64 = 0xc100_1000;
const SYSEXIT: u64 = 0xc100_2000;
const PAGE_FAULT: u64 = 0xc100_3000;
const INT80: u64 = 0x0804_8000;
const FAST_CALL: u64 = 0x0804_9000;

fn stop(registers: Registers) -> SimEvent<simi_arch_x86::X86> {
    SimEvent::new(CpuId(0), registers, EventReason::Stop)
}

fn mode_change(
    registers: Registers,
    from: simi_core::ProcessorMode,
    to: simi_core::ProcessorMode,
) -> SimEvent<simi_arch_x86::X86> {
    SimEvent::new(CpuId(0), registers, EventReason::ModeChange { from, to })
}

fn breakpoint(
    registers: Registers,
    handle: BreakpointHandle,
    value: Option<u64>,
) -> SimEvent<simi_arch_x86::X86> {
    SimEvent::new(
        CpuId(0),
        registers,
        EventReason::Breakpoint(EventBreakpoint {
            handle,
            address: 0,
            access: MemoryAccess::W,
            value,
        }),
    )
}

fn limits() -> DiscoveryLimits {
    DiscoveryLimits::default().with_scan_range(0x1000, 0x800)
}

/// A guest where the current-task cell is at 0x1000 and the kernel stack
/// at 0x8000..0xa000 names a task that is not readable.
fn guest() -> MockDriver {
    let driver = MockDriver::new();

    driver.map_zeroed(0x1000, 0x1000);
    driver.write_u32(0x1000, TASK_HINT);

    driver.map_zeroed(0x8000, 0x2000);
    driver.write_u32(0x8000, TASK_HINT);

    // swapper: real_parent and parent at 0x18, tasks at 0x60
    driver.map_zeroed(SWAPPER, 0x2000);
    driver.write_u32(SWAPPER + 0x18, SWAPPER as u32);
    driver.write_u32(SWAPPER + 0x1c, SWAPPER as u32);
    driver.write_u32(SWAPPER + 0x20, (INIT + 0x28) as u32);
    driver.write_u32(SWAPPER + 0x24, (INIT + 0x28) as u32);
    driver.write_u32(SWAPPER + 0x60, (INIT + 0x60) as u32);

    driver.map_zeroed(INIT, 0x2000);
    driver.write_u32(INIT + 0x18, SWAPPER as u32);
    driver.write_u32(INIT + 0x60, (KTHREADD + 0x60) as u32);
    driver.write_u32(INIT + 0xa0, 1);
    driver.write_u32(INIT + 0xa4, 1);
    driver.write(INIT + 0x200, b"init\0");

    driver.map_zeroed(KTHREADD, 0x2000);
    driver.write_u32(KTHREADD + 0x60, (SWAPPER + 0x60) as u32);
    driver.write_u32(KTHREADD + 0xa0, 2);
    driver.write_u32(KTHREADD + 0xa4, 2);

    driver.add_instruction(INT80, 2, "int 0x80");
    driver.add_instruction(FAST_CALL, 2, "sysenter");
    driver.add_instruction(SYS_ENTRY, 1, "push eax");
    driver.add_instruction(DISPATCH, 7, "call dword ptr [eax*4-0x3fe8e000]");
    driver.add_instruction(IRETD, 1, "iretd");
    driver.add_instruction(SYSEXIT, 2, "sysexit");

    driver
}

fn sample() -> Registers {
    kernel_registers(0xc100_4000, 0x9f00)
}

#[test]
fn scan_finds_aligned_cells() {
    let driver = MockDriver::new();
    driver.map_zeroed(0x1000, 0x1000);
    driver.write_u32(0x1000, TASK_HINT);
    driver.write_u32(0x1802, TASK_HINT);
    let vmi = make_vmi(driver);

    // The window runs past the last mapped page; the scan stops there.
    let window = ScanWindow {
        va_start: Va(0x1000),
        pa_start: Pa(0x1000),
        cells: 0x800,
        word: 4,
    };

    let hits = scan_for_pointer(&vmi, window, Va(TASK_HINT as u64), 9999);
    assert_eq!(hits, vec![Va(0x1000)]);
}

#[test]
fn candidates_only_shrink() {
    let driver = MockDriver::new();
    driver.map_zeroed(0x1000, 0x1000);
    for cell in [0x1000, 0x1010, 0x1020] {
        driver.write_u32(cell, TASK_HINT);
    }
    driver.write_u32(0x1030, 0x1234_5678);
    let vmi = make_vmi(driver);

    let registers = sample();
    let hits = vec![Va(0x1000), Va(0x1010), Va(0x1020)];

    let kept = check_hits(
        &vmi,
        &registers,
        CurrentTaskAddressing::SegmentRelative,
        &hits,
        Va(TASK_HINT as u64),
        4,
    );
    assert_eq!(kept, hits);

    vmi.driver().write_u32(0x1010, 0x1234_5678);
    let kept = check_hits(
        &vmi,
        &registers,
        CurrentTaskAddressing::SegmentRelative,
        &kept,
        Va(TASK_HINT as u64),
        4,
    );
    assert_eq!(kept, vec![Va(0x1000), Va(0x1020)]);

    // A cell outside the candidates never comes back.
    let kept = check_hits(
        &vmi,
        &registers,
        CurrentTaskAddressing::SegmentRelative,
        &kept,
        Va(0x1234_5678),
        4,
    );
    assert!(kept.is_empty());
}

#[test]
fn current_task_pointer_located() {
    let vmi = make_vmi(guest());
    let mut discoverer = Discoverer::new(limits());

    // User mode samples are skipped.
    let response = discoverer.handle_event(&vmi, &stop(user_registers(INT80, 0xbfff_0000)));
    assert_eq!(response.budget, Some(discoverer.limits().sample_budget));
    assert_eq!(discoverer.phase(), DiscoveryPhase::LocatingCurrentTaskPointer);

    let response = discoverer.handle_event(&vmi, &stop(sample()));
    assert!(!response.is_stop());
    assert_eq!(discoverer.phase(), DiscoveryPhase::IdentifyingSwapper);

    let layout = discoverer.layout();
    assert_eq!(layout.current_task(), Some(Va(0x1000)));
    assert_eq!(
        layout.current_task_addressing(),
        Some(CurrentTaskAddressing::SegmentRelative)
    );
    assert_eq!(layout.word_size(), Some(4));

    let breakpoints = vmi.driver().breakpoints();
    assert_eq!(breakpoints.len(), 1);
    assert_eq!(breakpoints[0].1.space, AddressSpace::Physical);
    assert_eq!(breakpoints[0].1.address, 0x1000);
    assert_eq!(breakpoints[0].1.access, MemoryAccess::W);
}

#[test]
fn ambiguous_candidates() {
    let guest = || {
        let driver = MockDriver::new();
        driver.map_zeroed(0x1000, 0x1000);
        driver.map_zeroed(0x8000, 0x2000);
        for cell in [0x1000, 0x1004, 0x1008, 0x8000] {
            driver.write_u32(cell, TASK_HINT);
        }
        driver
    };

    let vmi = make_vmi(guest());
    let mut discoverer = Discoverer::new(
        limits()
            .with_sampling(1000, 1)
            .with_ambiguity_policy(AmbiguityPolicy::Fail),
    );

    discoverer.handle_event(&vmi, &stop(sample()));
    let response = discoverer.handle_event(&vmi, &stop(sample()));
    assert!(response.is_stop());
    assert!(matches!(
        discoverer.check_completion(),
        Some(DiscoveryOutcome::Failed {
            phase: DiscoveryPhase::LocatingCurrentTaskPointer,
            ..
        })
    ));

    let vmi = make_vmi(guest());
    let mut discoverer = Discoverer::new(limits().with_sampling(1000, 1));

    discoverer.handle_event(&vmi, &stop(sample()));
    discoverer.handle_event(&vmi, &stop(sample()));
    assert_eq!(discoverer.layout().current_task(), Some(Va(0x1004)));
    assert_eq!(discoverer.phase(), DiscoveryPhase::IdentifyingSwapper);
}

#[test]
fn segment_alias_switches_to_absolute() {
    let aliased = || {
        let driver = guest();
        // A leftover copy of the task pointer under the per-CPU segment.
        driver.map_zeroed(0x5000, 0x2000);
        driver.write_u32(0x5100, TASK_HINT);
        driver
    };

    let segment = Registers {
        fs_base: 0x4000,
        ..sample()
    };

    let vmi = make_vmi(aliased());
    let mut discoverer = Discoverer::new(limits());

    discoverer.handle_event(&vmi, &stop(segment));
    assert_eq!(discoverer.phase(), DiscoveryPhase::IdentifyingSwapper);
    assert_eq!(discoverer.layout().current_task(), Some(Va(0x1000)));
    assert_eq!(
        discoverer.layout().current_task_addressing(),
        Some(CurrentTaskAddressing::Absolute)
    );

    // Sampled from boot, the segment-relative cell is trusted.
    let vmi = make_vmi(aliased());
    vmi.driver().map_zeroed(0xa000, 0x2000);
    let mut discoverer = Discoverer::new(limits());

    discoverer.handle_event(&vmi, &stop(kernel_registers(0xc100_4000, 0xbf00)));
    assert_eq!(discoverer.phase(), DiscoveryPhase::LocatingCurrentTaskPointer);

    discoverer.handle_event(&vmi, &stop(segment));
    assert_eq!(discoverer.layout().current_task(), Some(Va(0x1100)));
    assert_eq!(
        discoverer.layout().current_task_addressing(),
        Some(CurrentTaskAddressing::SegmentRelative)
    );
}

#[test]
fn rescan_of_stale_candidates_switches_addressing() {
    const NEXT_TASK: u32 = 0xaabb_1000;
    const LAST_TASK: u32 = 0xaabb_2000;

    let driver = guest();
    driver.map_zeroed(0x5000, 0x2000);
    for cell in [0x5000, 0x5004, 0x5008] {
        driver.write_u32(cell, TASK_HINT);
    }
    driver.write_u32(0x1000, LAST_TASK);

    driver.map_zeroed(0xc000, 0x4000);
    driver.write_u32(0xc000, NEXT_TASK);
    driver.write_u32(0xe000, LAST_TASK);

    let vmi = make_vmi(driver);
    let mut discoverer = Discoverer::new(limits());

    let on_stack = |rsp| Registers {
        fs_base: 0x4000,
        ..kernel_registers(0xc100_4000, rsp)
    };

    // Three segment-relative candidates, all stale on the next sample.
    discoverer.handle_event(&vmi, &stop(on_stack(0x9f00)));
    discoverer.handle_event(&vmi, &stop(on_stack(0xdf00)));
    assert_eq!(discoverer.phase(), DiscoveryPhase::LocatingCurrentTaskPointer);

    // The rescan finds nothing where three cells were found before.
    discoverer.handle_event(&vmi, &stop(on_stack(0xff00)));
    assert_eq!(discoverer.phase(), DiscoveryPhase::IdentifyingSwapper);
    assert_eq!(discoverer.layout().current_task(), Some(Va(0x1000)));
    assert_eq!(
        discoverer.layout().current_task_addressing(),
        Some(CurrentTaskAddressing::Absolute)
    );
}

#[test]
fn full_discovery() {
    use simi_core::ProcessorMode::{Kernel, User};

    let vmi = make_vmi(guest());
    let mut discoverer = Discoverer::new(limits());

    discoverer.handle_event(&vmi, &stop(sample()));
    let (handle, _) = vmi.driver().breakpoints()[0];

    // The swapper is scheduled.
    discoverer.handle_event(&vmi, &breakpoint(sample(), handle, Some(SWAPPER)));
    assert_eq!(discoverer.phase(), DiscoveryPhase::LocatingSyscallBoundaries);
    assert!(vmi.driver().breakpoints().is_empty());
    assert!(vmi.driver().monitoring(EventMonitor::ModeChange));

    let layout = discoverer.layout();
    assert_eq!(layout.init_task(), Some(Va(SWAPPER)));
    assert_eq!(layout.ts_real_parent(), Some(0x18));
    assert_eq!(layout.ts_parent(), Some(0x1c));
    assert_eq!(layout.ts_children(), Some(0x20));
    assert_eq!(layout.ts_sibling(), Some(0x28));
    assert_eq!(layout.ts_thread_group(), Some(0x38));
    assert_eq!(layout.ts_next(), Some(0x60));
    assert_eq!(layout.ts_prev(), Some(0x64));
    assert_eq!(layout.ts_pid(), Some(0xa0));
    assert_eq!(layout.ts_tgid(), Some(0xa4));
    assert_eq!(layout.ts_comm(), Some(0x200));

    // Syscall boundaries.
    let response =
        discoverer.handle_event(&vmi, &mode_change(user_registers(INT80, 0), User, Kernel));
    assert!(response.flags.contains(SimEventResponseFlags::SINGLESTEP));
    discoverer.handle_event(&vmi, &stop(kernel_registers(SYS_ENTRY, 0x9f00)));
    discoverer.handle_event(&vmi, &mode_change(kernel_registers(IRETD, 0x9f00), Kernel, User));
    discoverer.handle_event(&vmi, &mode_change(kernel_registers(SYSEXIT, 0x9f00), Kernel, User));
    assert_eq!(discoverer.phase(), DiscoveryPhase::LocatingSyscallBoundaries);

    discoverer.handle_event(&vmi, &mode_change(user_registers(FAST_CALL, 0), User, Kernel));
    discoverer.handle_event(&vmi, &stop(kernel_registers(SYSENTER, 0x9f00)));
    assert_eq!(discoverer.phase(), DiscoveryPhase::LocatingSyscallCompute);
    assert!(!vmi.driver().monitoring(EventMonitor::ModeChange));

    let layout = discoverer.layout();
    assert_eq!(layout.sys_entry(), Some(Va(SYS_ENTRY)));
    assert_eq!(layout.sysenter(), Some(Va(SYSENTER)));
    assert_eq!(layout.iretd(), Some(Va(IRETD)));
    assert_eq!(layout.sysexit(), Some(Va(SYSEXIT)));

    // Stepping from the entry to the table dispatch.
    let (handle, request) = vmi.driver().breakpoints()[0];
    assert_eq!(request.address, SYS_ENTRY);

    let response =
        discoverer.handle_event(&vmi, &breakpoint(kernel_registers(SYS_ENTRY, 0x9000), handle, None));
    assert!(response.flags.contains(SimEventResponseFlags::SINGLESTEP));
    discoverer.handle_event(&vmi, &stop(kernel_registers(DISPATCH, 0x9000)));
    assert_eq!(discoverer.phase(), DiscoveryPhase::LocatingStackFrame);
    assert_eq!(discoverer.layout().syscall_compute(), Some(Va(DISPATCH)));
    assert_eq!(discoverer.layout().syscall_jump(), Some(-0x3fe8_e000));

    // The user return address sits 0x2c above the stack pointer.
    vmi.driver().write_u32(0x902c, (INT80 + 2) as u32);
    discoverer.handle_event(&vmi, &mode_change(user_registers(INT80, 0), User, Kernel));
    let (handle, request) = vmi.driver().breakpoints()[0];
    assert_eq!(request.address, DISPATCH);

    discoverer.handle_event(&vmi, &breakpoint(kernel_registers(DISPATCH, 0x9000), handle, None));
    assert_eq!(discoverer.layout().stack_frame_eip(), Some(0x2c));
    assert_eq!(discoverer.phase(), DiscoveryPhase::LocatingPageFault);
    assert!(vmi.driver().monitoring(EventMonitor::Exception(14)));

    // Page fault.
    let fault = SimEvent::new(
        CpuId(0),
        user_registers(0x0804_a000, 0),
        EventReason::Exception { vector: 14 },
    );
    discoverer.handle_event(&vmi, &fault);
    let response = discoverer.handle_event(&vmi, &stop(kernel_registers(PAGE_FAULT, 0x9000)));
    assert!(response.is_stop());

    let Some(DiscoveryOutcome::Complete(layout)) = discoverer.check_completion()
    else {
        panic!("discovery did not complete: {:?}", discoverer.outcome());
    };

    assert!(layout.is_complete());
    assert_eq!(layout.page_fault(), Some(Va(PAGE_FAULT)));
    assert!(vmi.driver().breakpoints().is_empty());
    assert!(!vmi.driver().monitoring(EventMonitor::Exception(14)));
}

/// A discoverer at the syscall boundary search, watching mode changes.
fn at_boundaries(vmi: &SimCore<MockDriver>, limits: DiscoveryLimits) -> Discoverer<MockDriver> {
    let mut discoverer = Discoverer::new(limits);
    discoverer.phase = Phase::BoundarySearch(BoundarySearch::default());
    discoverer
        .enable_monitor(vmi, EventMonitor::ModeChange)
        .expect("mode changes not monitored");
    discoverer
}

#[test]
fn boundaries_with_a_single_entry_form() {
    use simi_core::ProcessorMode::{Kernel, User};

    let vmi = make_vmi(guest());
    let mut discoverer = at_boundaries(
        &vmi,
        DiscoveryLimits {
            entry_grace: 2,
            ..limits()
        },
    );

    let response =
        discoverer.handle_event(&vmi, &mode_change(user_registers(INT80, 0), User, Kernel));
    assert!(response.flags.contains(SimEventResponseFlags::SINGLESTEP));
    discoverer.handle_event(&vmi, &stop(kernel_registers(SYS_ENTRY, 0x9f00)));
    discoverer.handle_event(&vmi, &mode_change(kernel_registers(SYSEXIT, 0x9f00), Kernel, User));
    discoverer.handle_event(&vmi, &mode_change(kernel_registers(IRETD, 0x9f00), Kernel, User));

    // Exits seen again are not classified twice.
    discoverer.handle_event(&vmi, &mode_change(kernel_registers(IRETD, 0x9f00), Kernel, User));

    let layout = discoverer.layout();
    assert_eq!(layout.sys_entry(), Some(Va(SYS_ENTRY)));
    assert_eq!(layout.iretd(), Some(Va(IRETD)));
    assert_eq!(layout.sysexit(), Some(Va(SYSEXIT)));
    assert_eq!(discoverer.phase(), DiscoveryPhase::LocatingSyscallBoundaries);

    // The kernel never uses the fast entry.
    let interrupted = user_registers(0x0804_a000, 0);
    discoverer.handle_event(&vmi, &mode_change(interrupted, User, Kernel));
    assert_eq!(discoverer.phase(), DiscoveryPhase::LocatingSyscallBoundaries);
    discoverer.handle_event(&vmi, &mode_change(interrupted, User, Kernel));
    assert_eq!(discoverer.phase(), DiscoveryPhase::LocatingSyscallCompute);
    assert_eq!(discoverer.layout().sysenter(), None);
    assert!(!vmi.driver().monitoring(EventMonitor::ModeChange));

    let breakpoints = vmi.driver().breakpoints();
    assert_eq!(breakpoints.len(), 1);
    let (handle, request) = breakpoints[0];
    assert_eq!(request.address, SYS_ENTRY);

    let response =
        discoverer.handle_event(&vmi, &breakpoint(kernel_registers(SYS_ENTRY, 0x9000), handle, None));
    assert!(response.flags.contains(SimEventResponseFlags::SINGLESTEP));
    assert!(vmi.driver().breakpoints().is_empty());

    discoverer.handle_event(&vmi, &stop(kernel_registers(DISPATCH, 0x9000)));
    assert_eq!(discoverer.layout().syscall_compute(), Some(Va(DISPATCH)));
    assert_eq!(discoverer.layout().syscall_jump(), Some(-0x3fe8_e000));
    assert_eq!(discoverer.phase(), DiscoveryPhase::LocatingStackFrame);
}

#[test]
fn boundary_search_gives_up() {
    use simi_core::ProcessorMode::{Kernel, User};

    let vmi = make_vmi(guest());
    let mut discoverer = at_boundaries(
        &vmi,
        DiscoveryLimits {
            mode_change_ceiling: 3,
            ..limits()
        },
    );

    // Transitions that are not syscalls.
    let interrupted = user_registers(0x0804_a000, 0);
    for _ in 0..3 {
        let response = discoverer.handle_event(&vmi, &mode_change(interrupted, User, Kernel));
        assert!(!response.is_stop());
    }

    let response = discoverer.handle_event(&vmi, &mode_change(interrupted, User, Kernel));
    assert!(response.is_stop());
    assert!(!vmi.driver().monitoring(EventMonitor::ModeChange));

    let Some(DiscoveryOutcome::Failed { phase, detail }) = discoverer.check_completion()
    else {
        panic!("discovery did not fail: {:?}", discoverer.outcome());
    };

    assert_eq!(phase, DiscoveryPhase::LocatingSyscallBoundaries);
    assert!(detail.contains("sys_entry, iretd, sysexit"), "{detail}");
}

#[test]
fn page_fault_search_gives_up() {
    let vmi = make_vmi(guest());
    let mut discoverer = Discoverer::new(limits().with_page_fault_polling(1000, 2));

    let (phase, response) = discoverer
        .start_page_fault_search(&vmi)
        .expect("page fault search not started");
    discoverer.phase = phase;
    assert_eq!(response.budget, Some(1000));
    assert!(vmi.driver().monitoring(EventMonitor::Exception(14)));

    let idle = user_registers(0x0804_a000, 0);
    for _ in 0..2 {
        let response = discoverer.handle_event(&vmi, &stop(idle));
        assert_eq!(response.budget, Some(1000));
        assert_eq!(discoverer.phase(), DiscoveryPhase::LocatingPageFault);
    }

    let response = discoverer.handle_event(&vmi, &stop(idle));
    assert!(response.is_stop());
    assert!(!vmi.driver().monitoring(EventMonitor::Exception(14)));
    assert!(matches!(
        discoverer.check_completion(),
        Some(DiscoveryOutcome::Failed {
            phase: DiscoveryPhase::LocatingPageFault,
            ..
        })
    ));
}
