use crate::common::{
    kill_and_reap, proc_state, process_alive, wait_until, EventLog, TestHooks, PC_REG, SCRATCH_REG,
};
use serial_test::serial;
use std::time::Duration;
use trapgate::debugger::code::TRAP_LEN;
use trapgate::{
    AccessType, BreakpointKind, DebugState, Debugger, DebuggerBuilder, Error, ExceptionType,
};

fn spawn_sleeper(log: &EventLog) -> Debugger {
    DebuggerBuilder::new()
        .with_hooks(TestHooks::new(log.clone()))
        .spawn("/bin/sleep", &["10".to_string()])
        .unwrap()
}

#[test]
#[serial]
fn test_register_read_write_round_trip() {
    let log = EventLog::default();
    let debugger = spawn_sleeper(&log);
    let pid = debugger.pid();

    let pc = debugger.read_register(pid, PC_REG).unwrap();
    assert_ne!(pc, 0);

    debugger
        .write_register(pid, SCRATCH_REG, 0x1122_3344_5566_7788)
        .unwrap();
    assert_eq!(
        debugger.read_register(pid, SCRATCH_REG).unwrap(),
        0x1122_3344_5566_7788
    );

    assert!(matches!(
        debugger.read_register(pid, "not_a_register"),
        Err(Error::RegisterNameNotFound(_))
    ));

    drop(debugger);
    kill_and_reap(pid);
}

#[test]
#[serial]
fn test_read_memory_at_entry() {
    let log = EventLog::default();
    let debugger = spawn_sleeper(&log);
    let pid = debugger.pid();

    let pc = debugger.read_register(pid, PC_REG).unwrap();
    let memory = debugger.read_memory(pc, 16).unwrap();
    assert_eq!(memory.len(), 16);
    assert!(memory.iter().any(|&b| b != 0));

    // nothing is mapped at the zero page
    assert!(debugger.read_memory(0x10, 8).is_err());

    drop(debugger);
    kill_and_reap(pid);
}

#[test]
#[serial]
fn test_single_step_advances_pc() {
    let log = EventLog::default();
    let debugger = spawn_sleeper(&log);
    let pid = debugger.pid();

    let pc_before = debugger.read_register(pid, PC_REG).unwrap();
    log.clear();
    debugger.single_step(pid).unwrap();

    let step = log.wait_for(Duration::from_secs(2), |e| {
        e.exception == ExceptionType::SingleStep
    });
    assert!(step.is_some(), "single step completion was not notified");
    assert!(!step.unwrap().is_trace);

    let pc_after = debugger.read_register(pid, PC_REG).unwrap();
    assert_ne!(pc_before, pc_after);

    drop(debugger);
    kill_and_reap(pid);
}

#[test]
#[serial]
fn test_software_breakpoint_patches_and_restores() {
    let log = EventLog::default();
    let debugger = spawn_sleeper(&log);
    let pid = debugger.pid();

    let pc = debugger.read_register(pid, PC_REG).unwrap();
    let before = debugger.read_memory(pc, 8).unwrap();

    debugger
        .set_breakpoint(pc, 0, BreakpointKind::Software)
        .unwrap();

    // target memory now carries the trap, the table remembers the original
    let patched = debugger.read_memory(pc, 8).unwrap();
    assert_ne!(patched[..TRAP_LEN], before[..TRAP_LEN]);
    #[cfg(target_arch = "x86_64")]
    assert_eq!(patched[0], 0xCC);
    #[cfg(target_arch = "aarch64")]
    assert_eq!(patched[..4], [0x00, 0x00, 0x20, 0xD4]);

    let saved = debugger.software_original_bytes(pc).unwrap();
    assert_eq!(saved[..], before[..TRAP_LEN]);

    // duplicate installs are rejected
    assert!(matches!(
        debugger.set_breakpoint(pc, 0, BreakpointKind::Software),
        Err(Error::BreakpointExists(_))
    ));

    debugger.remove_breakpoint(pc).unwrap();
    let restored = debugger.read_memory(pc, 8).unwrap();
    assert_eq!(restored, before);
    assert!(debugger.software_original_bytes(pc).is_none());

    // removing an already removed breakpoint fails without side effects
    assert!(matches!(
        debugger.remove_breakpoint(pc),
        Err(Error::BreakpointNotFound(_))
    ));

    drop(debugger);
    kill_and_reap(pid);
}

#[test]
#[serial]
fn test_hardware_breakpoint_wait_mode() {
    let log = EventLog::default();
    let debugger = DebuggerBuilder::new()
        .with_hooks(TestHooks::new(log.clone()))
        .spawn("/bin/echo", &["hw".to_string()])
        .unwrap();
    let pid = debugger.pid();

    let entry = debugger.read_register(pid, PC_REG).unwrap();
    debugger
        .set_breakpoint(entry, 0, BreakpointKind::Hardware)
        .unwrap();

    log.clear();
    debugger.continue_thread(pid).unwrap();

    let hit = log.wait_for(Duration::from_secs(2), |e| {
        e.exception == ExceptionType::Breakpoint
    });
    let hit = hit.expect("hardware breakpoint did not fire");
    assert_eq!(hit.registers.pc(), entry);
    assert_eq!(hit.thread, pid);
    assert_eq!(debugger.debug_state(), DebugState::BreakpointHit);
    assert!(debugger.is_in_break_state());

    debugger.remove_breakpoint(entry).unwrap();
    debugger.continue_thread(pid).unwrap();
    assert!(wait_until(Duration::from_secs(5), || !process_alive(pid)));
}

#[test]
#[serial]
fn test_silent_continue_over_software_breakpoint() {
    let log = EventLog::default();
    let debugger = DebuggerBuilder::new()
        .with_hooks(TestHooks::new(log.clone()))
        .spawn("/bin/echo", &["silent".to_string()])
        .unwrap();
    let pid = debugger.pid();

    let entry = debugger.read_register(pid, PC_REG).unwrap();
    debugger
        .set_breakpoint(entry, 0, BreakpointKind::Software)
        .unwrap();

    // the client vetoes the break: the engine steps over the trap and resumes
    log.clear();
    log.silence();
    debugger.continue_thread(pid).unwrap();

    let hit = log.wait_for(Duration::from_secs(2), |e| {
        e.exception == ExceptionType::Breakpoint
    });
    assert!(hit.is_some(), "vetoed breakpoint was never classified");
    assert_eq!(hit.unwrap().registers.pc(), entry);

    // no break state survives, the target runs to completion
    assert!(wait_until(Duration::from_secs(5), || !process_alive(pid)));
    assert!(!debugger.is_in_break_state());
}

#[test]
#[serial]
fn test_suspend_and_resume_target() {
    let log = EventLog::default();
    let debugger = spawn_sleeper(&log);
    let pid = debugger.pid();

    debugger.continue_thread(pid).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        matches!(proc_state(pid), Some('S' | 'R'))
    }));

    debugger.suspend_target().unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        matches!(proc_state(pid), Some('T' | 't'))
    }));
    // give the event loop a few ticks to classify the stop
    std::thread::sleep(Duration::from_millis(200));

    debugger.resume_target().unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        matches!(proc_state(pid), Some('S' | 'R'))
    }));

    drop(debugger);
    kill_and_reap(pid);
}

#[test]
#[serial]
fn test_watchpoint_slots_exhaust_and_recover() {
    let log = EventLog::default();
    let debugger = spawn_sleeper(&log);
    let pid = debugger.pid();

    let base = debugger.read_register(pid, PC_REG).unwrap() & !0x7;
    for i in 0..4u64 {
        debugger
            .set_watchpoint(base + i * 8, 4, AccessType::Write)
            .unwrap();
    }
    assert!(matches!(
        debugger.set_watchpoint(base + 64, 4, AccessType::Write),
        Err(Error::WatchpointSlotsExhausted)
    ));

    assert!(matches!(
        debugger.remove_watchpoint(0xDEAD_0000),
        Err(Error::WatchpointNotFound(_))
    ));

    for i in 0..4u64 {
        debugger.remove_watchpoint(base + i * 8).unwrap();
    }

    // all slots free again
    debugger
        .set_watchpoint(base, 8, AccessType::ReadWrite)
        .unwrap();
    debugger.remove_watchpoint(base).unwrap();

    drop(debugger);
    kill_and_reap(pid);
}
