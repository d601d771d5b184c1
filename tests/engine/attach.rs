use crate::common::{EventLog, TestHooks};
use nix::unistd::Pid;
use serial_test::serial;
use std::process::Command;
use trapgate::{DebuggerBuilder, Error};

fn first_mapped_address(pid: Pid) -> u64 {
    let maps = std::fs::read_to_string(format!("/proc/{pid}/maps")).unwrap();
    let line = maps.lines().next().unwrap();
    let start = line.split('-').next().unwrap();
    u64::from_str_radix(start, 16).unwrap()
}

#[test]
#[serial]
fn test_attach_to_running_process() {
    let mut child = Command::new("/bin/sleep").arg("10").spawn().unwrap();
    let pid = Pid::from_raw(child.id() as i32);

    let log = EventLog::default();
    let debugger = DebuggerBuilder::new()
        .with_hooks(TestHooks::new(log.clone()))
        .attach(pid)
        .unwrap();
    assert_eq!(debugger.pid(), pid);

    // attach stops nothing; the read briefly stops the fleet and resumes it
    let address = first_mapped_address(pid);
    let memory = debugger.read_memory(address, 16).unwrap();
    assert_eq!(memory.len(), 16);

    drop(debugger);
    let _ = child.kill();
    let _ = child.wait();
}

#[test]
#[serial]
fn test_attach_to_missing_process_fails() {
    let result = DebuggerBuilder::new()
        .with_hooks(TestHooks::new(EventLog::default()))
        .attach(Pid::from_raw(0x7FFF_FFFF));
    assert!(matches!(
        result.map(|d| d.pid()),
        Err(Error::AttachedProcessNotFound(_))
    ));
}
