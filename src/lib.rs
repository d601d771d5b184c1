pub mod debugger;
pub mod log;

pub use debugger::hook::{
    Architecture, EventHook, ExceptionInfo, ExceptionType, NullHook, RegisterSnapshot,
};
pub use debugger::register::debug::{AccessType, BreakSize};
pub use debugger::signal::SignalPolicy;
pub use debugger::{BreakpointKind, DebugState, Debugger, DebuggerBuilder, Error};
