//! Multi-threaded process debugger core.
//!
//! A [`Debugger`] attaches to every thread of a target process (or spawns
//! the target itself), installs hardware watchpoints, hardware execution
//! breakpoints and software trap breakpoints, classifies debug stop events
//! and exposes a break/continue/single-step interface. All kernel debug
//! interactions run on a dedicated debugger thread; public operations
//! enqueue a typed request and block until it completes.

pub mod breakpoint;
pub mod code;
pub mod error;
pub mod hook;
mod queue;
pub mod register;
pub mod signal;
mod spawn;
pub mod sys;
pub mod tracee;
mod tracer;
pub mod watchpoint;

pub use breakpoint::{BreakpointKind, BREAKPOINT_SLOTS};
pub use error::Error;
pub use watchpoint::WATCHPOINT_SLOTS;

use crate::debugger::breakpoint::BreakpointTable;
use crate::debugger::code::TRAP_LEN;
use crate::debugger::hook::{EventHook, NullHook};
use crate::debugger::queue::{Command, CommandQueue, Reply};
use crate::debugger::register::debug::AccessType;
use crate::debugger::signal::SignalPolicy;
use crate::debugger::tracer::Tracer;
use log::{info, LevelFilter};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use strum_macros::FromRepr;

/// Debugger-wide execution state.
#[derive(Clone, Copy, PartialEq, Eq, Debug, FromRepr)]
#[repr(u8)]
pub enum DebugState {
    Running,
    BreakpointHit,
    WatchpointHit,
    SingleStepping,
    Paused,
}

/// State shared between the client-facing handle and the debugger thread.
pub(crate) struct SharedState {
    running: AtomicBool,
    debug_state: AtomicU8,
    user_suspend_pending: AtomicBool,
    signal_policies: Mutex<HashMap<i32, SignalPolicy>>,
}

impl SharedState {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            debug_state: AtomicU8::new(DebugState::Running as u8),
            user_suspend_pending: AtomicBool::new(false),
            // the global table is authoritative across debugger recreations
            signal_policies: Mutex::new(signal::global_policies()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn debug_state(&self) -> DebugState {
        DebugState::from_repr(self.debug_state.load(Ordering::SeqCst))
            .unwrap_or(DebugState::Running)
    }

    pub fn set_debug_state(&self, state: DebugState) {
        self.debug_state.store(state as u8, Ordering::SeqCst);
    }

    pub fn user_suspend_pending(&self) -> bool {
        self.user_suspend_pending.load(Ordering::SeqCst)
    }

    fn set_user_suspend_pending(&self, pending: bool) {
        self.user_suspend_pending.store(pending, Ordering::SeqCst);
    }

    pub fn policy(&self, signal: i32) -> SignalPolicy {
        self.signal_policies
            .lock()
            .unwrap()
            .get(&signal)
            .copied()
            .unwrap_or_default()
    }

    fn set_policy(&self, signal: i32, policy: SignalPolicy) {
        self.signal_policies.lock().unwrap().insert(signal, policy);
    }

    fn remove_policy(&self, signal: i32) {
        self.signal_policies.lock().unwrap().remove(&signal);
    }

    fn policies(&self) -> HashMap<i32, SignalPolicy> {
        self.signal_policies.lock().unwrap().clone()
    }
}

/// Debugger instance constructor.
pub struct DebuggerBuilder {
    hooks: Arc<dyn EventHook>,
}

impl Default for DebuggerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DebuggerBuilder {
    pub fn new() -> Self {
        Self {
            hooks: Arc::new(NullHook),
        }
    }

    /// Install the client upcalls (log and exception notification).
    pub fn with_hooks(self, hooks: impl EventHook + 'static) -> Self {
        Self {
            hooks: Arc::new(hooks),
        }
    }

    /// Attach to every thread of an already running process. No thread is
    /// stopped by the attach itself.
    pub fn attach(self, pid: Pid) -> Result<Debugger, Error> {
        let system = sysinfo::System::new_all();
        let process = system
            .process(sysinfo::Pid::from_u32(pid.as_raw() as u32))
            .ok_or(Error::AttachedProcessNotFound(pid))?;
        info!(
            target: "debugger",
            "attaching to {} (pid {pid})",
            process.name().to_string_lossy()
        );

        Ok(Self::launch(self.hooks, pid))
    }

    /// Fork and exec a target under trace. The returned debugger is paused
    /// at the target's entry point; the initial exception notification has
    /// already fired, so breakpoints set now are armed before the first user
    /// instruction runs.
    pub fn spawn(
        self,
        program: impl Into<String>,
        args: &[String],
    ) -> Result<Debugger, Error> {
        let mut debugger = Self::launch(self.hooks, Pid::from_raw(0));
        match debugger.queue.submit(Command::Spawn {
            program: program.into(),
            args: args.to_vec(),
            pty: false,
        })? {
            Reply::Spawned { pid, .. } => {
                debugger.pid = pid;
                Ok(debugger)
            }
            _ => unreachable!("spawn always returns a spawned reply"),
        }
    }

    /// [`DebuggerBuilder::spawn`] with a pseudo-terminal: the child runs with
    /// the PTY slave as its controlling terminal and the caller receives the
    /// non-blocking master descriptor.
    pub fn spawn_with_pty(
        self,
        program: impl Into<String>,
        args: &[String],
    ) -> Result<(Debugger, OwnedFd), Error> {
        let mut debugger = Self::launch(self.hooks, Pid::from_raw(0));
        match debugger.queue.submit(Command::Spawn {
            program: program.into(),
            args: args.to_vec(),
            pty: true,
        })? {
            Reply::Spawned {
                pid,
                pty_master: Some(master),
            } => {
                debugger.pid = pid;
                Ok((debugger, master))
            }
            _ => unreachable!("pty spawn always returns a master descriptor"),
        }
    }

    fn launch(hooks: Arc<dyn EventHook>, pid: Pid) -> Debugger {
        crate::log::route_to(hooks.clone(), LevelFilter::Debug);

        let shared = Arc::new(SharedState::new());
        let queue = Arc::new(CommandQueue::default());
        let breakpoints = Arc::new(BreakpointTable::default());

        let loop_thread = {
            let shared = shared.clone();
            let queue = queue.clone();
            let breakpoints = breakpoints.clone();
            thread::Builder::new()
                .name("trapgate-debugger".into())
                .spawn(move || Tracer::new(pid, shared, queue, breakpoints, hooks).run())
                .expect("spawn debugger thread")
        };

        Debugger {
            pid,
            queue,
            shared,
            breakpoints,
            loop_thread: Some(loop_thread),
        }
    }
}

/// Client-facing debugger handle, one per target process.
///
/// Every operation is synchronous: it enqueues a typed request for the
/// debugger thread and blocks until the result is available. Dropping the
/// handle shuts the debugger thread down and detaches from every thread of
/// the target.
pub struct Debugger {
    pid: Pid,
    queue: Arc<CommandQueue>,
    shared: Arc<SharedState>,
    breakpoints: Arc<BreakpointTable>,
    loop_thread: Option<JoinHandle<()>>,
}

impl Debugger {
    /// Target process id.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Arm a hardware watchpoint over `[address, address + size)` on every
    /// attached thread. Sizes outside {1, 2, 4, 8} clamp to 4.
    pub fn set_watchpoint(&self, address: u64, size: u8, access: AccessType) -> Result<(), Error> {
        self.queue
            .submit(Command::SetWatchpoint {
                address,
                size,
                access,
            })
            .map(drop)
    }

    /// Remove the watchpoint at `address`, draining in-flight hit handlers
    /// first.
    pub fn remove_watchpoint(&self, address: u64) -> Result<(), Error> {
        self.queue
            .submit(Command::RemoveWatchpoint { address })
            .map(drop)
    }

    /// Install an execution breakpoint. `hit_count` 0 stops on every hit
    /// (wait mode); a positive count silently single-steps that many
    /// instructions past the address and then removes the breakpoint (trace
    /// mode, hardware only).
    pub fn set_breakpoint(
        &self,
        address: u64,
        hit_count: u32,
        kind: BreakpointKind,
    ) -> Result<(), Error> {
        self.queue
            .submit(Command::SetBreakpoint {
                address,
                hit_count,
                kind,
            })
            .map(drop)
    }

    pub fn remove_breakpoint(&self, address: u64) -> Result<(), Error> {
        self.queue
            .submit(Command::RemoveBreakpoint { address })
            .map(drop)
    }

    /// Bytes that occupied `address` before the software breakpoint trap was
    /// patched in. `None` when no software breakpoint is set there.
    pub fn software_original_bytes(&self, address: u64) -> Option<[u8; TRAP_LEN]> {
        self.breakpoints.software_original_bytes(address)
    }

    /// Resume one stopped thread, delivering any pending signal. Transparent
    /// step-over happens first when the thread sits on a software
    /// breakpoint.
    pub fn continue_thread(&self, tid: Pid) -> Result<(), Error> {
        self.queue.submit(Command::Continue { tid }).map(drop)
    }

    /// Execute exactly one instruction on a stopped thread.
    pub fn single_step(&self, tid: Pid) -> Result<(), Error> {
        self.queue.submit(Command::SingleStep { tid }).map(drop)
    }

    /// Read a register of a stopped thread by its canonical name.
    pub fn read_register(&self, tid: Pid, name: &str) -> Result<u64, Error> {
        match self.queue.submit(Command::ReadRegister {
            tid,
            name: name.to_string(),
        })? {
            Reply::Value(value) => Ok(value),
            _ => unreachable!("register read always returns a value"),
        }
    }

    pub fn write_register(&self, tid: Pid, name: &str, value: u64) -> Result<(), Error> {
        self.queue
            .submit(Command::WriteRegister {
                tid,
                name: name.to_string(),
                value,
            })
            .map(drop)
    }

    /// Read target memory. Unreadable words read as zero; the error is
    /// returned only when nothing at all was readable.
    pub fn read_memory(&self, address: u64, size: usize) -> Result<Vec<u8>, Error> {
        match self.queue.submit(Command::ReadMemory { address, size })? {
            Reply::Memory(bytes) => Ok(bytes),
            _ => unreachable!("memory read always returns bytes"),
        }
    }

    /// Resume every thread previously stopped by [`Debugger::suspend_target`],
    /// returns how many were resumed.
    pub fn resume_user_stopped_threads(&self) -> Result<u64, Error> {
        match self.queue.submit(Command::ResumeUserStopped)? {
            Reply::Value(count) => Ok(count),
            _ => unreachable!("resume always returns a count"),
        }
    }

    /// Stop the whole target with SIGSTOP; threads stopped this way are
    /// marked as user-stopped and survive watchpoint/breakpoint operations.
    pub fn suspend_target(&self) -> Result<(), Error> {
        self.shared.set_user_suspend_pending(true);
        kill(self.pid, Signal::SIGSTOP).map_err(|e| Error::Syscall("kill", e))
    }

    /// Undo [`Debugger::suspend_target`].
    pub fn resume_target(&self) -> Result<(), Error> {
        self.shared.set_user_suspend_pending(false);
        kill(self.pid, Signal::SIGCONT).map_err(|e| Error::Syscall("kill", e))?;
        self.resume_user_stopped_threads().map(drop)
    }

    pub fn debug_state(&self) -> DebugState {
        self.shared.debug_state()
    }

    /// True while the engine is stopped at a breakpoint or watchpoint
    /// awaiting a client decision.
    pub fn is_in_break_state(&self) -> bool {
        matches!(
            self.shared.debug_state(),
            DebugState::BreakpointHit | DebugState::WatchpointHit
        )
    }

    /// Configure the behavior for one signal. The setting is stored both on
    /// this instance and in the process-global table that outlives it.
    pub fn set_signal_policy(&self, signal: i32, policy: SignalPolicy) {
        signal::set_global_policy(signal, policy);
        self.shared.set_policy(signal, policy);
    }

    pub fn signal_policy(&self, signal: i32) -> SignalPolicy {
        self.shared.policy(signal)
    }

    pub fn signal_policies(&self) -> HashMap<i32, SignalPolicy> {
        self.shared.policies()
    }

    pub fn remove_signal_policy(&self, signal: i32) {
        signal::remove_global_policy(signal);
        self.shared.remove_policy(signal);
    }
}

impl Drop for Debugger {
    fn drop(&mut self) {
        self.shared.shutdown();
        if let Some(handle) = self.loop_thread.take() {
            let _ = handle.join();
        }
    }
}
