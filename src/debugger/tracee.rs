//! Per-thread state machine records for every attached thread.

use crate::debugger::sys::GpRegs;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Pending single-step automaton state of one thread. A thread is in at most
/// one mode at a time; the matching completion handler returns it to `None`
/// (trace mode may re-enter the same mode).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum SingleStepMode {
    #[default]
    None,
    /// Stepping past a temporarily disabled watchpoint, re-arm on completion.
    WatchpointRestore,
    /// Stepping past a hardware breakpoint, stop afterwards.
    HardwareBreakpointStep,
    /// Stepping past a hardware breakpoint, resume afterwards.
    HardwareBreakpointContinue,
    /// Stepping past a restored software breakpoint, stop afterwards.
    SoftwareBreakpointStep,
    /// Stepping past a restored software breakpoint, resume afterwards.
    SoftwareBreakpointContinue,
}

/// Which debug resource is temporarily disabled on a thread while it steps
/// past the instruction that triggered it.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum DisabledSlot {
    #[default]
    None,
    /// Hardware watchpoint slot index.
    Watchpoint(usize),
    /// Software breakpoint table key (its address).
    SoftwareBreakpoint(u64),
}

#[derive(Clone, Default)]
pub struct ThreadState {
    pub single_step_mode: SingleStepMode,
    pub single_step_count: u32,
    /// Hardware breakpoint slot the thread is currently stepping past.
    pub current_breakpoint: Option<usize>,
    pub disabled: DisabledSlot,
    /// Control word saved when a watchpoint was disabled for a step.
    pub saved_ctrl: u64,
    /// General-purpose registers captured at the last stop.
    pub regs: Option<GpRegs>,
    pub is_attached: bool,
    pub is_stopped: bool,
    pub stopped_by_user: bool,
    /// Delivered to the target by the next resume that consumes it.
    pub pending_signal: Option<Signal>,
}

/// Registry of every attached thread, keyed by thread id.
#[derive(Default)]
pub(super) struct ThreadRegistry {
    threads: Mutex<HashMap<Pid, ThreadState>>,
}

impl ThreadRegistry {
    pub fn contains(&self, tid: Pid) -> bool {
        self.threads.lock().unwrap().contains_key(&tid)
    }

    /// Register a thread (attach bookkeeping only, no kernel call).
    pub fn ensure_attached(&self, tid: Pid) {
        let mut threads = self.threads.lock().unwrap();
        let state = threads.entry(tid).or_default();
        state.is_attached = true;
    }

    pub fn remove(&self, tid: Pid) {
        self.threads.lock().unwrap().remove(&tid);
    }

    /// Run a closure against one thread's state, `None` if unknown.
    pub fn with<R>(&self, tid: Pid, f: impl FnOnce(&mut ThreadState) -> R) -> Option<R> {
        self.threads.lock().unwrap().get_mut(&tid).map(f)
    }

    pub fn state(&self, tid: Pid) -> Option<ThreadState> {
        self.threads.lock().unwrap().get(&tid).cloned()
    }

    pub fn step_mode(&self, tid: Pid) -> SingleStepMode {
        self.with(tid, |t| t.single_step_mode).unwrap_or_default()
    }

    pub fn is_stopped(&self, tid: Pid) -> bool {
        self.with(tid, |t| t.is_stopped).unwrap_or(false)
    }

    pub fn ids(&self) -> Vec<Pid> {
        self.threads.lock().unwrap().keys().copied().collect()
    }

    pub fn any_stopped(&self) -> bool {
        self.threads.lock().unwrap().values().any(|t| t.is_stopped)
    }

    pub fn user_stopped_ids(&self) -> Vec<Pid> {
        self.threads
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, t)| t.stopped_by_user)
            .map(|(tid, _)| *tid)
            .collect()
    }

    /// Drop every thread that the kernel no longer lists as alive.
    pub fn prune_dead(&self, live: &HashSet<Pid>) {
        self.threads
            .lock()
            .unwrap()
            .retain(|tid, _| live.contains(tid));
    }

    pub fn take_pending_signal(&self, tid: Pid) -> Option<Signal> {
        self.with(tid, |t| t.pending_signal.take()).flatten()
    }

    /// Forget the software-breakpoint step-over marker on every thread parked
    /// at the given address. Called when the breakpoint itself is removed.
    pub fn clear_software_markers(&self, address: u64) {
        let mut threads = self.threads.lock().unwrap();
        for state in threads.values_mut() {
            if state.disabled == DisabledSlot::SoftwareBreakpoint(address) {
                state.disabled = DisabledSlot::None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_attach_and_prune() {
        let registry = ThreadRegistry::default();
        let t1 = Pid::from_raw(100);
        let t2 = Pid::from_raw(200);

        registry.ensure_attached(t1);
        registry.ensure_attached(t2);
        assert!(registry.contains(t1));
        assert_eq!(registry.ids().len(), 2);

        let live = HashSet::from([t1]);
        registry.prune_dead(&live);
        assert!(registry.contains(t1));
        assert!(!registry.contains(t2));
    }

    #[test]
    fn test_pending_signal_consumed_once() {
        let registry = ThreadRegistry::default();
        let tid = Pid::from_raw(100);
        registry.ensure_attached(tid);
        registry.with(tid, |t| t.pending_signal = Some(Signal::SIGUSR1));

        assert_eq!(registry.take_pending_signal(tid), Some(Signal::SIGUSR1));
        assert_eq!(registry.take_pending_signal(tid), None);
    }

    #[test]
    fn test_software_markers_cleared_on_remove() {
        let registry = ThreadRegistry::default();
        let tid = Pid::from_raw(100);
        registry.ensure_attached(tid);
        registry.with(tid, |t| t.disabled = DisabledSlot::SoftwareBreakpoint(0x5000));

        registry.clear_software_markers(0x6000);
        assert_eq!(
            registry.with(tid, |t| t.disabled),
            Some(DisabledSlot::SoftwareBreakpoint(0x5000))
        );

        registry.clear_software_markers(0x5000);
        assert_eq!(registry.with(tid, |t| t.disabled), Some(DisabledSlot::None));
    }
}
