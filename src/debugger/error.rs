use nix::unistd::Pid;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),

    // --------------------------------- capacity errors -------------------------------------------
    #[error("no free hardware watchpoint slot")]
    WatchpointSlotsExhausted,
    #[error("no free hardware breakpoint slot")]
    BreakpointSlotsExhausted,

    // --------------------------------- addressing errors -----------------------------------------
    #[error("unknown register {0:?}")]
    RegisterNameNotFound(String),
    #[error("read memory at {0:#x}")]
    Memory(u64),
    #[error("watchpoint not found at address {0:#x}")]
    WatchpointNotFound(u64),
    #[error("breakpoint not found at address {0:#x}")]
    BreakpointNotFound(u64),
    #[error("breakpoint already set at address {0:#x}")]
    BreakpointExists(u64),

    // --------------------------------- liveness errors -------------------------------------------
    #[error("thread {0} is not attached")]
    ThreadNotFound(Pid),
    #[error("thread {0} is not stopped")]
    ThreadNotStopped(Pid),
    #[error("no stopped threads available")]
    NoStoppedThreads,
    #[error("debugee process exit with code {0}")]
    ProcessExit(i32),
    #[error("process pid {0} not found")]
    AttachedProcessNotFound(Pid),

    // --------------------------------- syscall errors --------------------------------------------
    #[error("attach a running process: {0}")]
    Attach(nix::Error),
    #[error("waitpid syscall error: {0}")]
    Waitpid(nix::Error),
    #[error("ptrace syscall error: {0}")]
    Ptrace(nix::Error),
    #[error("{0} syscall error: {1}")]
    Syscall(&'static str, nix::Error),

    // --------------------------------- engine lifecycle errors -----------------------------------
    #[error("debugger thread is gone")]
    EngineShutdown,
}

impl Error {
    /// True when the session cannot usefully continue after this error;
    /// everything else leaves the target debuggable.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::IO(_) => false,
            Error::WatchpointSlotsExhausted => false,
            Error::BreakpointSlotsExhausted => false,
            Error::RegisterNameNotFound(_) => false,
            Error::Memory(_) => false,
            Error::WatchpointNotFound(_) => false,
            Error::BreakpointNotFound(_) => false,
            Error::BreakpointExists(_) => false,
            Error::ThreadNotFound(_) => false,
            Error::ThreadNotStopped(_) => false,
            Error::NoStoppedThreads => false,
            Error::Waitpid(_) => false,
            Error::Ptrace(_) => false,

            // currently fatal errors
            Error::ProcessExit(_) => true,
            Error::AttachedProcessNotFound(_) => true,
            Error::Attach(_) => true,
            Error::Syscall(_, _) => true,
            Error::EngineShutdown => true,
        }
    }
}

/// Evaluate a fallible expression, demoting a failure to a warning.
///
/// Expands to `Some(value)` on success; on error the failure lands in the
/// log and `None` comes back. For kernel calls whose failure must not abort
/// the surrounding operation.
#[macro_export]
macro_rules! soft_error {
    ($res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!(target: "debugger", "{:#}", e);
                None
            }
        }
    };
}
