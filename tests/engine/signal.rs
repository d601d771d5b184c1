use crate::common::{kill_and_reap, EventLog, TestHooks};
use nix::sys::signal::{kill, Signal};
use serial_test::serial;
use std::time::Duration;
use trapgate::{DebugState, DebuggerBuilder, ExceptionType, SignalPolicy};

#[test]
#[serial]
fn test_signal_policy_survives_debugger_recreation() {
    let log = EventLog::default();
    let debugger = DebuggerBuilder::new()
        .with_hooks(TestHooks::new(log.clone()))
        .spawn("/bin/sleep", &["10".to_string()])
        .unwrap();
    let pid = debugger.pid();

    let policy = SignalPolicy {
        catch: true,
        pass: true,
    };
    debugger.set_signal_policy(Signal::SIGUSR2 as i32, policy);
    assert_eq!(debugger.signal_policy(Signal::SIGUSR2 as i32), policy);
    assert_eq!(
        debugger.signal_policies().get(&(Signal::SIGUSR2 as i32)),
        Some(&policy)
    );

    drop(debugger);
    kill_and_reap(pid);

    // the global table outlives the instance and seeds the next one
    let log = EventLog::default();
    let debugger = DebuggerBuilder::new()
        .with_hooks(TestHooks::new(log.clone()))
        .spawn("/bin/sleep", &["10".to_string()])
        .unwrap();
    let pid = debugger.pid();

    assert_eq!(debugger.signal_policy(Signal::SIGUSR2 as i32), policy);

    debugger.remove_signal_policy(Signal::SIGUSR2 as i32);
    assert_eq!(
        debugger.signal_policy(Signal::SIGUSR2 as i32),
        SignalPolicy::default()
    );

    drop(debugger);
    kill_and_reap(pid);
}

#[test]
#[serial]
fn test_caught_signal_notifies_and_pauses() {
    let log = EventLog::default();
    let debugger = DebuggerBuilder::new()
        .with_hooks(TestHooks::new(log.clone()))
        .spawn("/bin/sleep", &["10".to_string()])
        .unwrap();
    let pid = debugger.pid();

    debugger.set_signal_policy(
        Signal::SIGUSR1 as i32,
        SignalPolicy {
            catch: true,
            pass: false,
        },
    );

    debugger.continue_thread(pid).unwrap();
    log.clear();
    kill(pid, Signal::SIGUSR1).unwrap();

    let caught = log.wait_for(Duration::from_secs(2), |e| {
        e.exception == ExceptionType::Signal
    });
    let caught = caught.expect("caught signal was not notified");
    assert_eq!(caught.thread, pid);
    assert_eq!(debugger.debug_state(), DebugState::Paused);

    // the signal is suppressed on resume, the target keeps sleeping
    debugger.continue_thread(pid).unwrap();

    debugger.remove_signal_policy(Signal::SIGUSR1 as i32);
    drop(debugger);
    kill_and_reap(pid);
}

#[test]
#[serial]
fn test_uncaught_signal_resumes_silently() {
    let log = EventLog::default();
    let debugger = DebuggerBuilder::new()
        .with_hooks(TestHooks::new(log.clone()))
        .spawn("/bin/sleep", &["10".to_string()])
        .unwrap();
    let pid = debugger.pid();

    debugger.continue_thread(pid).unwrap();
    log.clear();
    // default disposition: do not stop, suppress delivery
    kill(pid, Signal::SIGUSR1).unwrap();

    assert!(log
        .wait_for(Duration::from_millis(500), |e| {
            e.exception == ExceptionType::Signal
        })
        .is_none());

    drop(debugger);
    kill_and_reap(pid);
}
