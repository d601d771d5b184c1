use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use trapgate::{EventHook, ExceptionInfo};

#[cfg(target_arch = "x86_64")]
pub const PC_REG: &str = "rip";
#[cfg(target_arch = "aarch64")]
pub const PC_REG: &str = "pc";

#[cfg(target_arch = "x86_64")]
pub const SCRATCH_REG: &str = "rbx";
#[cfg(target_arch = "aarch64")]
pub const SCRATCH_REG: &str = "x1";

/// Shared view of every exception notification a test debugger produced.
#[derive(Clone)]
pub struct EventLog {
    events: Arc<Mutex<Vec<ExceptionInfo>>>,
    break_on_exception: Arc<AtomicBool>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self {
            events: Arc::default(),
            break_on_exception: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl EventLog {
    pub fn events(&self) -> Vec<ExceptionInfo> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    /// Answer every following `on_exception` with silent-continue.
    pub fn silence(&self) {
        self.break_on_exception.store(false, Ordering::SeqCst);
    }

    pub fn wait_for(
        &self,
        timeout: Duration,
        pred: impl Fn(&ExceptionInfo) -> bool,
    ) -> Option<ExceptionInfo> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(found) = self.events.lock().unwrap().iter().find(|e| pred(e)) {
                return Some(found.clone());
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

pub struct TestHooks {
    log: EventLog,
}

impl TestHooks {
    pub fn new(log: EventLog) -> Self {
        Self { log }
    }
}

impl EventHook for TestHooks {
    fn on_exception(&self, info: &ExceptionInfo, _pid: Pid) -> bool {
        self.log.events.lock().unwrap().push(info.clone());
        self.log.break_on_exception.load(Ordering::SeqCst)
    }
}

pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// True while the kernel still knows the pid (zombies included).
pub fn process_alive(pid: Pid) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

/// Kernel scheduling state of the process main thread, e.g. 'S', 'T' or 't'.
pub fn proc_state(pid: Pid) -> Option<char> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    let line = status.lines().find(|l| l.starts_with("State:"))?;
    line[6..].trim_start().chars().next()
}

/// Terminate and reap a detached test target.
pub fn kill_and_reap(pid: Pid) {
    let _ = nix::sys::signal::kill(pid, Signal::SIGKILL);
    let _ = nix::sys::wait::waitpid(pid, None);
}

#[macro_export]
macro_rules! assert_no_proc {
    ($pid:expr) => {
        let sys = sysinfo::System::new_all();
        assert!(sys
            .process(sysinfo::Pid::from_u32($pid.as_raw() as u32))
            .is_none())
    };
}
