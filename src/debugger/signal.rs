//! Signal disposition configuration.
//!
//! Dispositions live in two places: a process-global table that survives
//! debugger recreation, and a per-debugger copy synchronized from the global
//! table at creation time. Updates through [`crate::debugger::Debugger`]
//! write both.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;

/// What to do when the target receives a signal.
///
/// Default is GDB-like: don't stop, suppress the signal.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct SignalPolicy {
    /// Stop and notify the client when this signal is observed.
    pub catch: bool,
    /// Deliver the signal to the target on resume (otherwise suppress).
    pub pass: bool,
}

static GLOBAL_POLICIES: Lazy<Mutex<HashMap<i32, SignalPolicy>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub(super) fn global_policies() -> HashMap<i32, SignalPolicy> {
    GLOBAL_POLICIES.lock().unwrap().clone()
}

pub(super) fn set_global_policy(signal: i32, policy: SignalPolicy) {
    GLOBAL_POLICIES.lock().unwrap().insert(signal, policy);
}

pub(super) fn remove_global_policy(signal: i32) {
    GLOBAL_POLICIES.lock().unwrap().remove(&signal);
}
