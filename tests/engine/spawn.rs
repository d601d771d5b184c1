use crate::assert_no_proc;
use crate::common::{kill_and_reap, process_alive, wait_until, EventLog, TestHooks};
use serial_test::serial;
use std::io::{ErrorKind, Read};
use std::time::{Duration, Instant};
use trapgate::{DebugState, DebuggerBuilder, Error, ExceptionType};

#[test]
#[serial]
fn test_spawn_reports_entry_stop() {
    let log = EventLog::default();
    let debugger = DebuggerBuilder::new()
        .with_hooks(TestHooks::new(log.clone()))
        .spawn("/bin/echo", &["hello".to_string()])
        .unwrap();
    let pid = debugger.pid();
    assert!(pid.as_raw() > 0);

    // paused at the entry point with the initial notification already fired
    assert_eq!(debugger.debug_state(), DebugState::Paused);
    let events = log.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].exception, ExceptionType::Breakpoint);
    assert_eq!(events[0].thread, pid);
    assert!(!events[0].is_trace);
    assert_ne!(events[0].registers.pc(), 0);

    debugger.continue_thread(pid).unwrap();
    assert!(wait_until(Duration::from_secs(5), || !process_alive(pid)));
    assert_no_proc!(pid);
}

#[test]
#[serial]
fn test_spawn_with_pty_captures_output() {
    let log = EventLog::default();
    let (debugger, master) = DebuggerBuilder::new()
        .with_hooks(TestHooks::new(log.clone()))
        .spawn_with_pty("/bin/echo", &["hello pty".to_string()])
        .unwrap();
    let pid = debugger.pid();

    debugger.continue_thread(pid).unwrap();

    // the master is non-blocking: poll until the slave side is gone
    let mut out = Vec::new();
    let mut file = std::fs::File::from(master);
    let mut buf = [0u8; 4096];
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(20))
            }
            Err(_) => break,
        }
    }

    let out = String::from_utf8_lossy(&out).to_string();
    assert!(out.contains("hello pty"), "unexpected pty output: {out:?}");

    assert!(wait_until(Duration::from_secs(5), || !process_alive(pid)));
}

#[test]
#[serial]
fn test_spawn_exec_failure() {
    let result = DebuggerBuilder::new()
        .with_hooks(TestHooks::new(EventLog::default()))
        .spawn("/nonexistent/program", &[]);

    match result {
        Err(Error::ProcessExit(code)) => assert_eq!(code, 127),
        other => panic!("expected exec failure, got {:?}", other.map(|d| d.pid())),
    }
}

#[test]
#[serial]
fn test_detach_leaves_target_running() {
    let log = EventLog::default();
    let debugger = DebuggerBuilder::new()
        .with_hooks(TestHooks::new(log.clone()))
        .spawn("/bin/sleep", &["10".to_string()])
        .unwrap();
    let pid = debugger.pid();

    drop(debugger);

    // the target survives the debugger and keeps running
    assert!(process_alive(pid));
    kill_and_reap(pid);
}
