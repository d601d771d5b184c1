//! The debugger thread: command execution, the debug event loop and the
//! stop-the-world coordinator.
//!
//! Exactly one `Tracer` per target runs here; it owns every ptrace
//! interaction and all mutations of the breakpoint, watchpoint and
//! thread-state tables.

use crate::debugger::breakpoint::{BreakpointKind, BreakpointMatch, BreakpointTable, SwBreakpoint};
use crate::debugger::code;
use crate::debugger::error::Error;
use crate::debugger::hook::{EventHook, ExceptionInfo, ExceptionType};
use crate::debugger::queue::{Command, CommandQueue, Reply};
use crate::debugger::register;
use crate::debugger::register::debug::{AccessType, BreakSize};
use crate::debugger::spawn;
use crate::debugger::sys::{self, GpRegs};
use crate::debugger::tracee::{DisabledSlot, SingleStepMode, ThreadRegistry};
use crate::debugger::watchpoint::WatchpointTable;
use crate::debugger::{DebugState, SharedState};
use crate::soft_error;
use itertools::Itertools;
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Idle sleep between queue drains when no debug event is pending.
const IDLE_TICK: Duration = Duration::from_millis(10);
/// Overall deadline for a stop-the-world round.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_POLL: Duration = Duration::from_millis(10);

pub(super) struct Tracer {
    /// Target process id, 0 until a spawn request creates the target.
    proc_pid: Pid,
    registry: ThreadRegistry,
    watchpoints: WatchpointTable,
    breakpoints: Arc<BreakpointTable>,
    shared: Arc<SharedState>,
    queue: Arc<CommandQueue>,
    hooks: Arc<dyn EventHook>,
    current_thread: Option<Pid>,
}

impl Tracer {
    pub fn new(
        proc_pid: Pid,
        shared: Arc<SharedState>,
        queue: Arc<CommandQueue>,
        breakpoints: Arc<BreakpointTable>,
        hooks: Arc<dyn EventHook>,
    ) -> Self {
        Self {
            proc_pid,
            registry: ThreadRegistry::default(),
            watchpoints: WatchpointTable::default(),
            breakpoints,
            shared,
            queue,
            hooks,
            current_thread: None,
        }
    }

    /// Debugger thread body: attach, then alternate between draining the
    /// command queue and demultiplexing debug events until shutdown.
    pub fn run(mut self) {
        if self.proc_pid.as_raw() != 0 {
            if let Err(e) = self.attach_all() {
                error!(target: "debugger", "attach to process {}: {e:#}", self.proc_pid);
                self.queue.close();
                return;
            }
        }

        while self.shared.is_running() {
            self.drain_queue();

            if let Some((tid, status)) = self.wait_event() {
                soft_error!(self.dispatch(tid, status));
            }

            thread::sleep(IDLE_TICK);
        }

        self.queue.close();
        self.detach_all();
    }

    fn drain_queue(&mut self) {
        while let Some(request) = self.queue.pop() {
            let result = self.execute(&request.command);
            request.complete(result);
        }
    }

    fn execute(&mut self, command: &Command) -> Result<Reply, Error> {
        match command {
            Command::SetWatchpoint {
                address,
                size,
                access,
            } => self.set_watchpoint(*address, *size, *access),
            Command::RemoveWatchpoint { address } => self.remove_watchpoint(*address),
            Command::SetBreakpoint {
                address,
                hit_count,
                kind,
            } => self.set_breakpoint(*address, *hit_count, *kind),
            Command::RemoveBreakpoint { address } => self.remove_breakpoint(*address),
            Command::Continue { tid } => self.continue_thread(*tid),
            Command::SingleStep { tid } => self.single_step_thread(*tid),
            Command::ReapplyWatchpoints { finished } => self.reapply_watchpoints(*finished),
            Command::ReadRegister { tid, name } => self.read_register(*tid, name),
            Command::WriteRegister { tid, name, value } => {
                self.write_register(*tid, name, *value)
            }
            Command::ReadMemory { address, size } => self.read_memory(*address, *size),
            Command::Spawn { program, args, pty } => self.spawn_target(program, args, *pty),
            Command::ResumeUserStopped => self.resume_user_stopped(),
        }
    }

    // -----------------------------------------------------------------------
    // Attach / detach
    // -----------------------------------------------------------------------

    fn attach_all(&mut self) -> Result<(), Error> {
        let mut attached = 0;
        for tid in sys::thread_ids(self.proc_pid) {
            match sys::seize(tid) {
                Ok(()) => {
                    self.registry.ensure_attached(tid);
                    attached += 1;
                }
                Err(e) => warn!(target: "debugger", "failed to seize thread {tid}: {e}"),
            }
        }
        if attached == 0 {
            return Err(Error::Attach(Errno::ESRCH));
        }
        debug!(target: "debugger", "attached to {attached} threads of process {}", self.proc_pid);
        Ok(())
    }

    fn detach_all(&mut self) {
        for tid in self.registry.ids() {
            muted_detach(tid);
        }
    }

    // -----------------------------------------------------------------------
    // Event demultiplexer
    // -----------------------------------------------------------------------

    /// One non-blocking wait for the next debug event of any tracee.
    fn wait_event(&self) -> Option<(Pid, WaitStatus)> {
        let status = waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)).ok()?;
        let pid = status.pid()?;
        Some((pid, status))
    }

    fn dispatch(&mut self, tid: Pid, status: WaitStatus) -> Result<(), Error> {
        match status {
            WaitStatus::Exited(pid, code) => {
                self.registry.remove(pid);
                if pid == self.proc_pid {
                    info!(target: "debugger", "debugee process exited with code {code}");
                }
                Ok(())
            }
            WaitStatus::Signaled(pid, _, _) => {
                self.registry.remove(pid);
                Ok(())
            }
            WaitStatus::PtraceEvent(pid, _, event) => self.handle_ptrace_event(pid, event),
            WaitStatus::Stopped(pid, sig) => {
                if !self.registry.contains(pid) {
                    return Ok(());
                }
                match sig {
                    Signal::SIGTRAP => self.handle_trap(pid),
                    Signal::SIGSTOP | Signal::SIGTSTP => self.handle_stop_signal(pid),
                    Signal::SIGCONT => self.handle_sigcont(pid),
                    other => self.handle_signal(pid, other),
                }
            }
            _ => Ok(()),
        }
    }

    fn handle_ptrace_event(&mut self, pid: Pid, event: i32) -> Result<(), Error> {
        match event {
            libc::PTRACE_EVENT_CLONE => {
                // the new thread is auto-attached through PTRACE_O_TRACECLONE,
                // its first stop arrives as PTRACE_EVENT_STOP
                match sys_getevent(pid) {
                    Ok(new_tid) if new_tid.as_raw() > 0 => {
                        self.registry.ensure_attached(new_tid);
                        debug!(target: "tracer", "thread {pid} cloned new thread {new_tid}");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(target: "tracer", "failed to read cloned thread id from {pid}: {e}")
                    }
                }
                sys::resume(pid, None).map_err(Error::Ptrace)
            }
            libc::PTRACE_EVENT_STOP => {
                // a late interrupt stop, or a freshly cloned thread's first stop
                if !self.registry.contains(pid) {
                    self.registry.ensure_attached(pid);
                }
                soft_error!(sys::resume(pid, None));
                Ok(())
            }
            other => {
                warn!(target: "tracer", "unsupported (ignored) ptrace event, code: {other}");
                Ok(())
            }
        }
    }

    fn handle_trap(&mut self, pid: Pid) -> Result<(), Error> {
        let regs = match sys::registers(pid) {
            Ok(regs) => regs,
            // likely an interrupt-induced trap with register access not yet
            // available, leave the thread stopped
            Err(_) => return Ok(()),
        };

        let mode = self.registry.step_mode(pid);
        if mode != SingleStepMode::None {
            let is_trace = self
                .registry
                .with(pid, |t| t.current_breakpoint)
                .flatten()
                .map(|idx| self.breakpoints.hw_target(idx) > 0)
                .unwrap_or(false);
            let info = ExceptionInfo::new(&regs, ExceptionType::SingleStep, pid, 0, mode, is_trace);
            self.hooks.on_exception(&info, self.proc_pid);
            return self.handle_step_complete(pid, &regs);
        }

        if let Some(index) = self.match_watchpoint(pid) {
            return self.handle_watchpoint_stop(pid, regs, index);
        }

        if let Some(found) = self.breakpoints.match_pc(sys::pc(&regs)) {
            return self.handle_breakpoint_stop(pid, regs, found);
        }

        // an interrupt-induced trap, keep the thread stopped for register access
        self.registry.with(pid, |t| t.is_stopped = true);
        Ok(())
    }

    /// Map the stop onto a watchpoint slot. x86_64 reports the slot through
    /// DR6 (cleared here for the next exception), ARM64 reports the fault
    /// address which is matched against the table.
    #[cfg(target_arch = "x86_64")]
    fn match_watchpoint(&self, tid: Pid) -> Option<usize> {
        let dr6 = sys::debug_status(tid).ok()?;
        let hit = (0..crate::debugger::watchpoint::WATCHPOINT_SLOTS)
            .find(|&i| dr6 & (1 << i) != 0 && self.watchpoints.view(i).is_some())?;
        soft_error!(sys::clear_debug_status(tid));
        Some(hit)
    }

    #[cfg(target_arch = "aarch64")]
    fn match_watchpoint(&self, tid: Pid) -> Option<usize> {
        let fault = sys::fault_address(tid);
        if fault == 0 {
            return None;
        }
        self.watchpoints.match_fault(fault)
    }

    // -----------------------------------------------------------------------
    // Watchpoint hits
    // -----------------------------------------------------------------------

    fn handle_watchpoint_stop(
        &mut self,
        pid: Pid,
        regs: GpRegs,
        index: usize,
    ) -> Result<(), Error> {
        // a slot mid-removal produces spurious hits, resume without notifying
        if self.watchpoints.sync(index).removing() {
            return sys::resume(pid, None).map_err(Error::Ptrace);
        }

        self.shared.set_debug_state(DebugState::WatchpointHit);
        self.current_thread = Some(pid);
        self.registry.with(pid, |t| {
            t.regs = Some(regs);
            t.current_breakpoint = None;
            t.is_stopped = true;
        });

        let address = self.watchpoints.view(index).map(|v| v.address).unwrap_or(0);
        let info = ExceptionInfo::new(
            &regs,
            ExceptionType::Watchpoint,
            pid,
            address,
            SingleStepMode::None,
            false,
        );
        self.hooks.on_exception(&info, self.proc_pid);

        self.watchpoints.sync(index).enter_handler();

        // disable the slot on the hitting thread only, step the faulting
        // instruction, re-arm fleet-wide from the completion handler
        let saved = match sys::disable_watchpoint(pid, index) {
            Ok(saved) => saved,
            Err(e) => {
                error!(target: "tracer", "failed to disable watchpoint {index} for thread {pid}: {e}");
                self.watchpoints.sync(index).leave_handler();
                return Err(Error::Ptrace(e));
            }
        };

        self.registry.with(pid, |t| {
            t.saved_ctrl = saved;
            t.disabled = DisabledSlot::Watchpoint(index);
            t.single_step_mode = SingleStepMode::WatchpointRestore;
            t.single_step_count = 0;
            t.is_stopped = false;
        });

        if let Err(e) = sys::single_step(pid, None) {
            error!(target: "tracer", "failed to single step thread {pid}: {e}");
            self.watchpoints.sync(index).leave_handler();
            return Err(Error::Ptrace(e));
        }
        Ok(())
    }

    fn complete_watchpoint_step(&mut self, pid: Pid) -> Result<(), Error> {
        if let Some(DisabledSlot::Watchpoint(index)) =
            self.registry.with(pid, |t| t.disabled)
        {
            self.watchpoints.sync(index).leave_handler();
        }

        self.registry.with(pid, |t| {
            t.single_step_mode = SingleStepMode::None;
            t.saved_ctrl = 0;
            t.disabled = DisabledSlot::None;
            t.is_stopped = false;
        });

        // re-arm on all threads, covering both the hitting thread and any
        // thread created during the disabled window
        self.queue.post(Command::ReapplyWatchpoints {
            finished: Some(pid),
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Breakpoint hits
    // -----------------------------------------------------------------------

    fn handle_breakpoint_stop(
        &mut self,
        pid: Pid,
        mut regs: GpRegs,
        found: BreakpointMatch,
    ) -> Result<(), Error> {
        let is_trace = match found {
            BreakpointMatch::Hardware(index) => {
                self.breakpoints.bump_hw_hits(index);
                self.breakpoints.hw_target(index) > 0
            }
            BreakpointMatch::Software(address) => {
                self.breakpoints.bump_software_hits(address);

                // INT3 advances the instruction pointer past the trap, wind
                // it back so the reported pc equals the breakpoint address
                #[cfg(target_arch = "x86_64")]
                if sys::pc(&regs) != address {
                    sys::set_pc(&mut regs, address);
                    soft_error!(sys::set_registers(pid, &regs));
                }

                self.breakpoints
                    .software(address)
                    .is_some_and(|bp| bp.target_hits > 0)
            }
        };

        debug!(
            target: "tracer",
            "breakpoint hit at pc {:#x}, thread {pid} ({found:?})",
            sys::pc(&regs)
        );

        self.shared.set_debug_state(DebugState::BreakpointHit);
        self.current_thread = Some(pid);
        self.registry.with(pid, |t| {
            t.regs = Some(regs);
            t.is_stopped = true;
            t.current_breakpoint = match found {
                BreakpointMatch::Hardware(index) => Some(index),
                BreakpointMatch::Software(_) => None,
            };
            if let BreakpointMatch::Software(address) = found {
                t.disabled = DisabledSlot::SoftwareBreakpoint(address);
            }
        });

        let info = ExceptionInfo::new(
            &regs,
            ExceptionType::Breakpoint,
            pid,
            0,
            SingleStepMode::None,
            is_trace,
        );
        let should_break = self.hooks.on_exception(&info, self.proc_pid);

        if !should_break {
            // conditional breakpoint: step over the trap and resume without
            // ever presenting the stop to the user
            info!(target: "tracer", "breakpoint callback requested continue, resuming thread {pid}");
            self.registry.with(pid, |t| t.is_stopped = false);
            return match found {
                BreakpointMatch::Software(address) => self.step_over_software(
                    pid,
                    address,
                    SingleStepMode::SoftwareBreakpointContinue,
                ),
                BreakpointMatch::Hardware(index) => self.step_over_hardware(pid, index),
            };
        }

        match found {
            BreakpointMatch::Hardware(index) => self.begin_trace_or_wait(pid, index),
            // software breakpoints stop in wait mode
            BreakpointMatch::Software(_) => Ok(()),
        }
    }

    /// Wait mode keeps the thread stopped; trace mode disables the slot on
    /// the hitting thread and silently steps.
    fn begin_trace_or_wait(&mut self, pid: Pid, index: usize) -> Result<(), Error> {
        if self.breakpoints.hw_target(index) == 0 {
            return Ok(());
        }

        soft_error!(sys::disable_breakpoint(pid, index));
        self.shared.set_debug_state(DebugState::SingleStepping);
        self.registry.with(pid, |t| {
            t.single_step_mode = SingleStepMode::HardwareBreakpointStep;
            t.single_step_count = 0;
            t.current_breakpoint = Some(index);
            t.is_stopped = false;
        });
        sys::single_step(pid, None).map_err(Error::Ptrace)
    }

    /// Restore the original bytes for one step window. Sibling threads are
    /// not suspended: a thread crossing the address during the window misses
    /// the trap.
    fn step_over_software(
        &mut self,
        pid: Pid,
        address: u64,
        mode: SingleStepMode,
    ) -> Result<(), Error> {
        if let Some(bp) = self.breakpoints.software(address) {
            let word = sys::peek(pid, address).map_err(|_| Error::Memory(address))?;
            sys::poke(pid, address, code::restore_word(word, &bp.saved))
                .map_err(|_| Error::Memory(address))?;
        }

        self.shared.set_debug_state(DebugState::SingleStepping);
        self.registry.with(pid, |t| {
            t.single_step_mode = mode;
            t.disabled = DisabledSlot::SoftwareBreakpoint(address);
            t.single_step_count = 0;
            t.is_stopped = false;
        });

        let sig = self.registry.take_pending_signal(pid);
        sys::single_step(pid, sig).map_err(Error::Ptrace)
    }

    fn step_over_hardware(&mut self, pid: Pid, index: usize) -> Result<(), Error> {
        soft_error!(sys::disable_breakpoint(pid, index));
        self.shared.set_debug_state(DebugState::SingleStepping);
        self.registry.with(pid, |t| {
            t.single_step_mode = SingleStepMode::HardwareBreakpointContinue;
            t.single_step_count = 0;
            t.current_breakpoint = Some(index);
            t.is_stopped = false;
        });
        sys::single_step(pid, None).map_err(Error::Ptrace)
    }

    fn repatch_software(&self, tid: Pid, address: u64) {
        if self.breakpoints.software(address).is_none() {
            return;
        }
        match sys::peek(tid, address) {
            Ok(word) => {
                if let Err(e) = sys::poke(tid, address, code::patch_word(word)) {
                    error!(target: "tracer", "failed to re-insert breakpoint at {address:#x}: {e}");
                }
            }
            Err(e) => {
                error!(target: "tracer", "failed to read memory at {address:#x} for re-insert: {e}")
            }
        }
    }

    // -----------------------------------------------------------------------
    // Single-step completion
    // -----------------------------------------------------------------------

    fn handle_step_complete(&mut self, pid: Pid, regs: &GpRegs) -> Result<(), Error> {
        let mode = self.registry.step_mode(pid);
        match mode {
            SingleStepMode::None => Ok(()),
            SingleStepMode::WatchpointRestore => self.complete_watchpoint_step(pid),
            _ => self.complete_breakpoint_step(pid, regs, mode),
        }
    }

    fn complete_breakpoint_step(
        &mut self,
        pid: Pid,
        regs: &GpRegs,
        mode: SingleStepMode,
    ) -> Result<(), Error> {
        let (disabled, current_bp) = self
            .registry
            .with(pid, |t| (t.disabled, t.current_breakpoint))
            .ok_or(Error::ThreadNotFound(pid))?;

        let Some(index) = current_bp else {
            // a software breakpoint step-over or a plain user step
            if let DisabledSlot::SoftwareBreakpoint(address) = disabled {
                self.repatch_software(pid, address);
            }
            self.registry.with(pid, |t| {
                t.single_step_mode = SingleStepMode::None;
                t.current_breakpoint = None;
                t.disabled = DisabledSlot::None;
            });

            if mode == SingleStepMode::SoftwareBreakpointContinue {
                self.registry.with(pid, |t| t.is_stopped = false);
                self.shared.set_debug_state(DebugState::Running);
                return sys::resume(pid, None).map_err(Error::Ptrace);
            }

            // user-requested step: back in break state
            self.registry.with(pid, |t| t.is_stopped = true);
            self.shared.set_debug_state(DebugState::BreakpointHit);
            return Ok(());
        };

        if mode == SingleStepMode::HardwareBreakpointContinue {
            if let Some(address) = self.breakpoints.hw_address(index) {
                soft_error!(sys::enable_breakpoint(pid, index, address));
            }
            self.registry.with(pid, |t| {
                t.single_step_mode = SingleStepMode::None;
                t.current_breakpoint = None;
                t.is_stopped = false;
            });
            self.shared.set_debug_state(DebugState::Running);
            return sys::resume(pid, None).map_err(Error::Ptrace);
        }

        let target = self.breakpoints.hw_target(index);
        let hits = self.breakpoints.bump_hw_hits(index);
        let at_trace_end = self.breakpoints.hw_trace_end(index) == Some(sys::pc(regs));

        if target > 0 && (hits >= target || at_trace_end) {
            // trace complete: free the slot and let the thread run
            soft_error!(sys::clear_breakpoint(pid, index));
            self.breakpoints.clear_hw(index);
            self.registry.with(pid, |t| {
                t.single_step_mode = SingleStepMode::None;
                t.single_step_count = 0;
                t.current_breakpoint = None;
                t.is_stopped = false;
            });
            self.shared.set_debug_state(DebugState::Running);
            self.current_thread = None;
            return sys::resume(pid, None).map_err(Error::Ptrace);
        }

        if target > 0 {
            // trace mode continues, the slot stays disabled on this thread
            self.shared.set_debug_state(DebugState::SingleStepping);
            self.registry.with(pid, |t| t.single_step_count += 1);
            return sys::single_step(pid, None).map_err(Error::Ptrace);
        }

        // wait mode: the user stepped past the breakpoint, re-arm it
        if let Some(address) = self.breakpoints.hw_address(index) {
            soft_error!(sys::enable_breakpoint(pid, index, address));
        }
        if let DisabledSlot::SoftwareBreakpoint(address) = disabled {
            self.repatch_software(pid, address);
        }
        self.registry.with(pid, |t| {
            t.single_step_mode = SingleStepMode::None;
            t.single_step_count = 0;
            t.disabled = DisabledSlot::None;
            t.is_stopped = true;
        });
        self.shared.set_debug_state(DebugState::BreakpointHit);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Plain signals
    // -----------------------------------------------------------------------

    fn handle_stop_signal(&mut self, pid: Pid) -> Result<(), Error> {
        if self.shared.user_suspend_pending() {
            self.registry.with(pid, |t| {
                t.is_stopped = true;
                t.stopped_by_user = true;
            });
            // re-deliver so the stop takes effect beyond the trace stop
            soft_error!(kill(pid, Signal::SIGSTOP));
        } else {
            self.registry.with(pid, |t| t.is_stopped = true);
        }
        Ok(())
    }

    fn handle_sigcont(&mut self, pid: Pid) -> Result<(), Error> {
        self.registry.with(pid, |t| {
            if t.stopped_by_user {
                t.stopped_by_user = false;
                t.is_stopped = false;
            }
        });
        // pass the signal through in every case
        sys::resume(pid, Some(Signal::SIGCONT)).map_err(Error::Ptrace)
    }

    fn handle_signal(&mut self, pid: Pid, sig: Signal) -> Result<(), Error> {
        let policy = self.shared.policy(sig as i32);

        // SIGPWR and SIGXCPU are routine on some runtimes, keep them out of the logs
        if sig != Signal::SIGPWR && sig != Signal::SIGXCPU {
            info!(
                target: "tracer",
                "signal {sig} for thread {pid}, catch={}, pass={}",
                policy.catch, policy.pass
            );
        }

        if policy.catch {
            match sys::registers(pid) {
                Ok(regs) => {
                    let fault = sys::fault_address(pid);
                    self.shared.set_debug_state(DebugState::Paused);
                    self.current_thread = Some(pid);
                    self.registry.with(pid, |t| {
                        t.regs = Some(regs);
                        t.current_breakpoint = None;
                        t.is_stopped = true;
                        t.pending_signal = policy.pass.then_some(sig);
                    });

                    let info = ExceptionInfo::new(
                        &regs,
                        exception_for_signal(sig),
                        pid,
                        fault,
                        SingleStepMode::None,
                        false,
                    );
                    self.hooks.on_exception(&info, self.proc_pid);
                    // leave the thread stopped for inspection
                    return Ok(());
                }
                Err(e) => {
                    error!(target: "tracer", "failed to get registers for signal {sig} in thread {pid}: {e}")
                }
            }
        }

        // not catching: resume immediately, suppressing or delivering per
        // policy; the two system signals are always passed through
        let deliver = (policy.pass || sig == Signal::SIGPWR || sig == Signal::SIGXCPU)
            .then_some(sig);

        // preserve an in-flight single step, a plain resume would cancel it
        let stepping = self.registry.step_mode(pid) != SingleStepMode::None;
        self.registry.with(pid, |t| t.is_stopped = false);
        let resumed = if stepping {
            sys::single_step(pid, deliver)
        } else {
            sys::resume(pid, deliver)
        };
        if let Err(e) = resumed {
            self.registry.with(pid, |t| t.is_stopped = true);
            return Err(Error::Ptrace(e));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stop-the-world coordinator
    // -----------------------------------------------------------------------

    /// Stop every attached thread except `exclude`. Returns the stopped set
    /// and the subset that was already stopped before this call (those must
    /// stay stopped when the fleet resumes).
    fn stop_all_threads(&mut self, exclude: Option<Pid>) -> (Vec<Pid>, Vec<Pid>) {
        let live: HashSet<Pid> = sys::thread_ids(self.proc_pid).into_iter().collect();
        self.registry.prune_dead(&live);

        let mut stopped = vec![];
        let mut already_stopped = vec![];
        let mut pending = vec![];

        for tid in self.registry.ids() {
            if Some(tid) == exclude {
                continue;
            }
            if self.registry.is_stopped(tid) {
                stopped.push(tid);
                already_stopped.push(tid);
                continue;
            }
            match sys::interrupt(tid) {
                Ok(()) => pending.push(tid),
                Err(Errno::ESRCH) => self.registry.remove(tid),
                Err(e) => {
                    error!(target: "tracer", "failed to interrupt thread {tid}: {e}")
                }
            }
        }

        let deadline = Instant::now() + STOP_TIMEOUT;
        while !pending.is_empty() && Instant::now() < deadline {
            pending.retain(|&tid| match waitpid(tid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => true,
                Ok(status) if is_stop_status(&status) => {
                    self.registry.with(tid, |t| t.is_stopped = true);
                    stopped.push(tid);
                    false
                }
                Ok(_) => {
                    self.registry.remove(tid);
                    false
                }
                Err(e) => {
                    warn!(target: "tracer", "error waiting for thread {tid}: {e}");
                    false
                }
            });
            if !pending.is_empty() {
                thread::sleep(STOP_POLL);
            }
        }

        // threads that missed the deadline: try to unstop them so interrupt
        // state does not leak into the next operation
        for tid in pending {
            warn!(target: "tracer", "thread {tid} did not stop in time, dropping from this operation");
            self.cancel_interrupt(tid);
        }

        (stopped, already_stopped)
    }

    fn cancel_interrupt(&self, tid: Pid) {
        if let Ok(status) = waitpid(tid, Some(WaitPidFlag::WNOHANG)) {
            if is_stop_status(&status) {
                soft_error!(sys::resume(tid, None));
            }
        }
    }

    /// Resume the listed threads, consuming any pending signal. ESRCH prunes
    /// the dead thread; other failures leave the thread marked stopped.
    fn resume_threads(&mut self, threads: &[Pid]) {
        let mut errors = vec![];
        for &tid in threads {
            let sig = self.registry.take_pending_signal(tid);
            match sys::resume(tid, sig) {
                Ok(()) => {
                    self.registry.with(tid, |t| t.is_stopped = false);
                }
                Err(Errno::ESRCH) => self.registry.remove(tid),
                Err(e) => errors.push(format!("thread {tid}: {e}")),
            }
        }
        if !errors.is_empty() {
            warn!(target: "tracer", "resume failures: {}", errors.into_iter().join("; "));
        }
    }

    /// Resume the threads this operation stopped, preserving break states
    /// that existed before it.
    fn resume_not_already_stopped(&mut self, stopped: &[Pid], already_stopped: &[Pid]) {
        let already: HashSet<Pid> = already_stopped.iter().copied().collect();
        let to_resume: Vec<Pid> = stopped
            .iter()
            .copied()
            .filter(|tid| !already.contains(tid))
            .collect();
        self.resume_threads(&to_resume);
    }

    // -----------------------------------------------------------------------
    // Watchpoint commands
    // -----------------------------------------------------------------------

    fn set_watchpoint(&mut self, address: u64, size: u8, access: AccessType) -> Result<Reply, Error> {
        let index = self
            .watchpoints
            .find_free()
            .ok_or(Error::WatchpointSlotsExhausted)?;
        let size = BreakSize::from_bytes(size);

        let (stopped, already_stopped) = self.stop_all_threads(None);
        if stopped.is_empty() {
            return Err(Error::NoStoppedThreads);
        }

        let mut failure = None;
        for &tid in &stopped {
            match sys::install_watchpoint(tid, index, address, size, access) {
                Ok(()) => {}
                Err(Errno::ESRCH) => continue,
                Err(e) => {
                    error!(target: "tracer", "failed to set watchpoint for thread {tid}: {e}");
                    failure = Some(e);
                    break;
                }
            }
        }

        self.resume_not_already_stopped(&stopped, &already_stopped);

        match failure {
            None => {
                self.watchpoints.record(index, address, size, access);
                Ok(Reply::Unit)
            }
            Some(e) => Err(Error::Syscall("install watchpoint", e)),
        }
    }

    fn remove_watchpoint(&mut self, address: u64) -> Result<Reply, Error> {
        let index = self
            .watchpoints
            .find_by_address(address)
            .ok_or(Error::WatchpointNotFound(address))?;

        self.watchpoints.sync(index).begin_remove();
        if !self.watchpoints.sync(index).drain() {
            warn!(
                target: "tracer",
                "timeout waiting for watchpoint {index} handlers, proceeding with removal"
            );
        }

        let (stopped, already_stopped) = self.stop_all_threads(None);
        if stopped.is_empty() {
            self.watchpoints.sync(index).end_remove();
            return Err(Error::NoStoppedThreads);
        }

        let mut failure = None;
        for &tid in &stopped {
            match sys::clear_watchpoint(tid, index) {
                Ok(()) => {}
                Err(Errno::ESRCH) => continue,
                Err(e) => {
                    error!(target: "tracer", "failed to clear watchpoint for thread {tid}: {e}");
                    failure = Some(e);
                    break;
                }
            }
        }

        self.resume_not_already_stopped(&stopped, &already_stopped);
        self.watchpoints.sync(index).end_remove();

        match failure {
            None => {
                self.watchpoints.clear(index);
                Ok(Reply::Unit)
            }
            Some(e) => Err(Error::Syscall("clear watchpoint", e)),
        }
    }

    fn reapply_watchpoints(&mut self, finished: Option<Pid>) -> Result<Reply, Error> {
        let (mut stopped, already_stopped) = self.stop_all_threads(finished);

        // the hitting thread is stopped after its restore step but must be
        // re-armed and resumed with the rest of the fleet
        if let Some(tid) = finished {
            if !stopped.contains(&tid) {
                stopped.push(tid);
            }
        }
        if stopped.is_empty() {
            return Err(Error::NoStoppedThreads);
        }

        let mut failure = None;
        for view in self.watchpoints.active_views() {
            for &tid in &stopped {
                match sys::install_watchpoint(tid, view.index, view.address, view.size, view.access)
                {
                    Ok(()) => {}
                    Err(Errno::ESRCH) => continue,
                    Err(e) => {
                        error!(target: "tracer", "failed to reapply watchpoint {} for thread {tid}: {e}", view.index);
                        failure = Some(e);
                    }
                }
            }
        }

        self.resume_not_already_stopped(&stopped, &already_stopped);

        match failure {
            None => Ok(Reply::Unit),
            Some(e) => Err(Error::Syscall("reapply watchpoints", e)),
        }
    }

    // -----------------------------------------------------------------------
    // Breakpoint commands
    // -----------------------------------------------------------------------

    fn set_breakpoint(
        &mut self,
        address: u64,
        hit_count: u32,
        kind: BreakpointKind,
    ) -> Result<Reply, Error> {
        match kind {
            BreakpointKind::Hardware => self.set_hardware_breakpoint(address, hit_count),
            BreakpointKind::Software => self.set_software_breakpoint(address, hit_count),
        }
    }

    fn set_hardware_breakpoint(&mut self, address: u64, hit_count: u32) -> Result<Reply, Error> {
        let index = self
            .breakpoints
            .find_free_hw()
            .ok_or(Error::BreakpointSlotsExhausted)?;

        let (stopped, already_stopped) = self.stop_all_threads(None);
        if stopped.is_empty() {
            return Err(Error::NoStoppedThreads);
        }

        let mut failure = None;
        for &tid in &stopped {
            match sys::install_breakpoint(tid, index, address) {
                Ok(()) => {}
                Err(Errno::ESRCH) => continue,
                Err(e) => {
                    error!(target: "tracer", "failed to set breakpoint for thread {tid}: {e}");
                    failure = Some(e);
                    break;
                }
            }
        }

        self.resume_not_already_stopped(&stopped, &already_stopped);

        match failure {
            None => {
                self.breakpoints.record_hw(index, address, hit_count, None);
                Ok(Reply::Unit)
            }
            Some(e) => Err(Error::Syscall("install breakpoint", e)),
        }
    }

    fn set_software_breakpoint(&mut self, address: u64, hit_count: u32) -> Result<Reply, Error> {
        if self.breakpoints.software(address).is_some() {
            return Err(Error::BreakpointExists(address));
        }

        let (stopped, already_stopped) = self.stop_all_threads(None);
        if stopped.is_empty() {
            return Err(Error::NoStoppedThreads);
        }

        let patch = |tid: Pid| -> Result<[u8; code::TRAP_LEN], Error> {
            let word = sys::peek(tid, address).map_err(|_| Error::Memory(address))?;
            let saved = code::saved_bytes(word);
            sys::poke(tid, address, code::patch_word(word)).map_err(|_| Error::Memory(address))?;
            Ok(saved)
        };
        let result = patch(stopped[0]);

        self.resume_not_already_stopped(&stopped, &already_stopped);

        let saved = result?;
        self.breakpoints.insert_software(
            address,
            SwBreakpoint {
                saved,
                hits: 0,
                target_hits: hit_count,
            },
        );
        Ok(Reply::Unit)
    }

    fn remove_breakpoint(&mut self, address: u64) -> Result<Reply, Error> {
        if let Some(index) = self.breakpoints.find_hw_by_address(address) {
            return self.remove_hardware_breakpoint(address, index);
        }
        if self.breakpoints.software(address).is_some() {
            return self.remove_software_breakpoint(address);
        }
        Err(Error::BreakpointNotFound(address))
    }

    fn remove_hardware_breakpoint(&mut self, _address: u64, index: usize) -> Result<Reply, Error> {
        self.breakpoints.hw_sync(index).begin_remove();

        let (stopped, already_stopped) = self.stop_all_threads(None);
        if stopped.is_empty() {
            self.breakpoints.hw_sync(index).end_remove();
            return Err(Error::NoStoppedThreads);
        }

        let mut failure = None;
        for &tid in &stopped {
            match sys::clear_breakpoint(tid, index) {
                Ok(()) => {}
                Err(Errno::ESRCH) => continue,
                Err(e) => {
                    error!(target: "tracer", "failed to clear breakpoint for thread {tid}: {e}");
                    failure = Some(e);
                    break;
                }
            }
        }

        self.resume_not_already_stopped(&stopped, &already_stopped);
        self.breakpoints.hw_sync(index).end_remove();

        match failure {
            None => {
                self.breakpoints.clear_hw(index);
                Ok(Reply::Unit)
            }
            Some(e) => Err(Error::Syscall("clear breakpoint", e)),
        }
    }

    fn remove_software_breakpoint(&mut self, address: u64) -> Result<Reply, Error> {
        let bp = self
            .breakpoints
            .software(address)
            .ok_or(Error::BreakpointNotFound(address))?;

        let (stopped, already_stopped) = self.stop_all_threads(None);
        if stopped.is_empty() {
            return Err(Error::NoStoppedThreads);
        }

        let restore = |tid: Pid| -> Result<(), Error> {
            let word = sys::peek(tid, address).map_err(|_| Error::Memory(address))?;
            sys::poke(tid, address, code::restore_word(word, &bp.saved))
                .map_err(|_| Error::Memory(address))?;
            Ok(())
        };
        let result = restore(stopped[0]);

        self.resume_not_already_stopped(&stopped, &already_stopped);
        result?;

        // threads parked on this breakpoint no longer step over anything
        self.registry.clear_software_markers(address);
        self.breakpoints.remove_software(address);
        Ok(Reply::Unit)
    }

    // -----------------------------------------------------------------------
    // Execution control commands
    // -----------------------------------------------------------------------

    fn continue_thread(&mut self, tid: Pid) -> Result<Reply, Error> {
        let Some(state) = self.registry.state(tid) else {
            // already resumed in a batch, nothing to do
            if self.shared.debug_state() == DebugState::Running {
                return Ok(Reply::Unit);
            }
            return Err(Error::ThreadNotFound(tid));
        };
        if !state.is_stopped {
            return Err(Error::ThreadNotStopped(tid));
        }

        if let DisabledSlot::SoftwareBreakpoint(address) = state.disabled {
            // step over the trap first, the completion handler re-patches
            // and resumes
            self.registry.with(tid, |t| t.stopped_by_user = false);
            self.step_over_software(tid, address, SingleStepMode::SoftwareBreakpointContinue)?;
            return Ok(Reply::Unit);
        }

        let sig = self.registry.take_pending_signal(tid);
        sys::resume(tid, sig).map_err(Error::Ptrace)?;
        self.registry.with(tid, |t| {
            t.is_stopped = false;
            t.stopped_by_user = false;
        });

        if self.current_thread == Some(tid) && !self.registry.any_stopped() {
            self.shared.set_debug_state(DebugState::Running);
            self.current_thread = None;
        }
        Ok(Reply::Unit)
    }

    fn single_step_thread(&mut self, tid: Pid) -> Result<Reply, Error> {
        let state = self.registry.state(tid).ok_or(Error::ThreadNotFound(tid))?;
        if !state.is_stopped {
            return Err(Error::ThreadNotStopped(tid));
        }

        let regs = sys::registers(tid).map_err(Error::Ptrace)?;
        let pc = sys::pc(&regs);

        let mut mode = SingleStepMode::HardwareBreakpointStep;
        if let Some(bp) = self.breakpoints.software(pc) {
            // lift the trap for the step window, re-patch on completion
            let word = sys::peek(tid, pc).map_err(|_| Error::Memory(pc))?;
            sys::poke(tid, pc, code::restore_word(word, &bp.saved))
                .map_err(|_| Error::Memory(pc))?;
            self.registry
                .with(tid, |t| t.disabled = DisabledSlot::SoftwareBreakpoint(pc));
            mode = SingleStepMode::SoftwareBreakpointStep;
        }

        // avoid re-triggering the breakpoint the thread currently sits on
        if let Some(index) = state.current_breakpoint {
            soft_error!(sys::disable_breakpoint(tid, index));
        }

        if self.current_thread == Some(tid) {
            self.shared.set_debug_state(DebugState::SingleStepping);
        }
        self.registry.with(tid, |t| {
            if t.single_step_mode == SingleStepMode::None {
                t.single_step_mode = mode;
            }
            t.single_step_count = 0;
            t.is_stopped = false;
        });

        let sig = self.registry.take_pending_signal(tid);
        sys::single_step(tid, sig).map_err(Error::Ptrace)?;
        Ok(Reply::Unit)
    }

    fn resume_user_stopped(&mut self) -> Result<Reply, Error> {
        let mut resumed = 0u64;
        for tid in self.registry.user_stopped_ids() {
            match sys::resume(tid, None) {
                Ok(()) => {
                    self.registry.with(tid, |t| {
                        t.stopped_by_user = false;
                        t.is_stopped = false;
                    });
                    resumed += 1;
                }
                Err(e) => error!(target: "tracer", "failed to resume thread {tid}: {e}"),
            }
        }
        info!(target: "tracer", "resumed {resumed} user-stopped threads");
        Ok(Reply::Value(resumed))
    }

    // -----------------------------------------------------------------------
    // Register and memory commands
    // -----------------------------------------------------------------------

    fn read_register(&mut self, tid: Pid, name: &str) -> Result<Reply, Error> {
        if !self.registry.contains(tid) {
            return Err(Error::ThreadNotFound(tid));
        }
        let reg = register::get_register_from_name(name)?;
        register::get_register_value(tid, reg).map(Reply::Value)
    }

    fn write_register(&mut self, tid: Pid, name: &str, value: u64) -> Result<Reply, Error> {
        if !self.registry.contains(tid) {
            return Err(Error::ThreadNotFound(tid));
        }
        let reg = register::get_register_from_name(name)?;
        register::set_register_value(tid, reg, value)?;
        Ok(Reply::Unit)
    }

    /// Memory is shared between threads, any stopped one will do; when none
    /// is stopped the fleet is paused for the duration of the read.
    fn read_memory(&mut self, address: u64, size: usize) -> Result<Reply, Error> {
        let mut buffer = vec![0u8; size];

        let mut read_thread = self
            .registry
            .ids()
            .into_iter()
            .find(|&tid| sys::thread_is_stopped(self.proc_pid, tid));

        let mut stopped_here = None;
        if read_thread.is_none() {
            let (stopped, already_stopped) = self.stop_all_threads(None);
            if stopped.is_empty() {
                return Err(Error::NoStoppedThreads);
            }
            read_thread = stopped.first().copied();
            stopped_here = Some((stopped, already_stopped));
        }

        let tid = read_thread.ok_or(Error::NoStoppedThreads)?;
        let bytes_read = read_words(tid, address, &mut buffer);

        if let Some((stopped, already_stopped)) = stopped_here {
            self.resume_not_already_stopped(&stopped, &already_stopped);
        }

        if bytes_read == 0 {
            return Err(Error::Memory(address));
        }
        Ok(Reply::Memory(buffer))
    }

    // -----------------------------------------------------------------------
    // Spawn command
    // -----------------------------------------------------------------------

    fn spawn_target(&mut self, program: &str, args: &[String], pty: bool) -> Result<Reply, Error> {
        info!(target: "debugger", "spawning {program} under trace");

        let (pid, pty_master) = if pty {
            let (pid, master) = spawn::spawn_with_pty(program, args)?;
            (pid, Some(master))
        } else {
            (spawn::spawn(program, args)?, None)
        };

        self.proc_pid = pid;
        self.registry.ensure_attached(pid);
        self.registry.with(pid, |t| {
            t.is_stopped = true;
            t.current_breakpoint = None;
            t.single_step_mode = SingleStepMode::None;
        });
        self.current_thread = Some(pid);
        self.shared.set_debug_state(DebugState::Paused);

        // initial notification, classified as a breakpoint stop at the entry
        // point: the client may set breakpoints before the first user
        // instruction runs
        match sys::registers(pid) {
            Ok(regs) => {
                self.registry.with(pid, |t| t.regs = Some(regs));
                let info = ExceptionInfo::new(
                    &regs,
                    ExceptionType::Breakpoint,
                    pid,
                    0,
                    SingleStepMode::None,
                    false,
                );
                self.hooks.on_exception(&info, pid);
            }
            Err(e) => warn!(target: "debugger", "failed to read registers of spawned process: {e}"),
        }

        Ok(Reply::Spawned { pid, pty_master })
    }
}

/// Word-by-word target memory read. Unreadable words are skipped and stay
/// zero in the buffer; a run of consecutive failures abandons the read.
fn read_words(tid: Pid, address: u64, buffer: &mut [u8]) -> usize {
    const MAX_CONSECUTIVE_FAILURES: u32 = 3;
    let word_size = std::mem::size_of::<i64>() as u64;
    let size = buffer.len() as u64;
    let mut bytes_read = 0u64;
    let mut consecutive_failures = 0;

    while bytes_read < size && consecutive_failures < MAX_CONSECUTIVE_FAILURES {
        let aligned = (address + bytes_read) & !(word_size - 1);
        let offset = (address + bytes_read) - aligned;

        match sys::peek(tid, aligned) {
            Ok(word) => {
                consecutive_failures = 0;
                let bytes = word.to_ne_bytes();
                let n = std::cmp::min(size - bytes_read, word_size - offset) as usize;
                buffer[bytes_read as usize..][..n]
                    .copy_from_slice(&bytes[offset as usize..offset as usize + n]);
                bytes_read += n as u64;
            }
            Err(e) => {
                consecutive_failures += 1;
                debug!(target: "tracer", "peek failed at {aligned:#x}: {e}");
                match e {
                    Errno::EIO | Errno::EFAULT => {
                        let skip = word_size - offset;
                        if bytes_read + skip >= size {
                            break;
                        }
                        bytes_read += skip;
                    }
                    Errno::ESRCH => break,
                    _ => bytes_read += 1,
                }
            }
        }
    }

    bytes_read as usize
}

fn is_stop_status(status: &WaitStatus) -> bool {
    matches!(
        status,
        WaitStatus::Stopped(_, _) | WaitStatus::PtraceEvent(_, _, _)
    )
}

fn exception_for_signal(sig: Signal) -> ExceptionType {
    match sig {
        Signal::SIGSEGV => ExceptionType::SigSegv,
        Signal::SIGBUS => ExceptionType::SigBus,
        Signal::SIGFPE => ExceptionType::SigFpe,
        Signal::SIGILL => ExceptionType::SigIll,
        Signal::SIGABRT => ExceptionType::SigAbrt,
        Signal::SIGTRAP => ExceptionType::SigTrap,
        _ => ExceptionType::Signal,
    }
}

fn sys_getevent(pid: Pid) -> nix::Result<Pid> {
    nix::sys::ptrace::getevent(pid).map(|raw| Pid::from_raw(raw as libc::pid_t))
}

fn muted_detach(tid: Pid) {
    if let Err(e) = sys::detach(tid) {
        debug!(target: "debugger", "detach thread {tid}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_words_zero_sized() {
        let mut buffer = [];
        // no syscall happens for an empty buffer, any pid will do
        assert_eq!(read_words(Pid::from_raw(1), 0x1000, &mut buffer), 0);
    }

    #[test]
    fn test_exception_for_signal_mapping() {
        assert_eq!(
            exception_for_signal(Signal::SIGSEGV),
            ExceptionType::SigSegv
        );
        assert_eq!(exception_for_signal(Signal::SIGABRT), ExceptionType::SigAbrt);
        assert_eq!(exception_for_signal(Signal::SIGUSR1), ExceptionType::Signal);
    }
}
