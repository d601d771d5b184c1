//! Upcall surface between the engine and its client.

use crate::debugger::sys::GpRegs;
use crate::debugger::tracee::SingleStepMode;
use log::Level;
use nix::unistd::Pid;

/// Architecture tag carried by every exception notification.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Architecture {
    Arm64 = 1,
    X8664 = 2,
}

/// Logical classification of a debug stop, see [`ExceptionInfo`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ExceptionType {
    Unknown = 0,
    Breakpoint = 1,
    Watchpoint = 2,
    SingleStep = 3,
    Signal = 4,
    SigSegv = 5,
    SigBus = 6,
    SigFpe = 7,
    SigIll = 8,
    SigAbrt = 9,
    SigTrap = 10,
}

/// ARM64 general-purpose register file at stop time.
#[derive(Clone, Copy, Debug, Default)]
pub struct Arm64Registers {
    pub x: [u64; 30],
    pub lr: u64,
    pub sp: u64,
    pub pc: u64,
    pub cpsr: u64,
    pub fp: u64,
}

/// x86_64 general-purpose register file at stop time.
#[derive(Clone, Copy, Debug, Default)]
pub struct X8664Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cs: u64,
    pub ss: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
    pub fs_base: u64,
    pub gs_base: u64,
}

/// Register file snapshot for the architecture the target runs on.
#[derive(Clone, Copy, Debug)]
pub enum RegisterSnapshot {
    Arm64(Arm64Registers),
    X8664(X8664Registers),
}

impl RegisterSnapshot {
    #[cfg(target_arch = "x86_64")]
    pub(super) fn capture(regs: &GpRegs) -> Self {
        RegisterSnapshot::X8664(X8664Registers {
            rax: regs.rax,
            rbx: regs.rbx,
            rcx: regs.rcx,
            rdx: regs.rdx,
            rsi: regs.rsi,
            rdi: regs.rdi,
            rbp: regs.rbp,
            rsp: regs.rsp,
            r8: regs.r8,
            r9: regs.r9,
            r10: regs.r10,
            r11: regs.r11,
            r12: regs.r12,
            r13: regs.r13,
            r14: regs.r14,
            r15: regs.r15,
            rip: regs.rip,
            rflags: regs.eflags,
            cs: regs.cs,
            ss: regs.ss,
            ds: regs.ds,
            es: regs.es,
            fs: regs.fs,
            gs: regs.gs,
            fs_base: regs.fs_base,
            gs_base: regs.gs_base,
        })
    }

    #[cfg(target_arch = "aarch64")]
    pub(super) fn capture(regs: &GpRegs) -> Self {
        let mut x = [0u64; 30];
        x.copy_from_slice(&regs.regs[..30]);
        RegisterSnapshot::Arm64(Arm64Registers {
            x,
            lr: regs.regs[30],
            sp: regs.sp,
            pc: regs.pc,
            cpsr: regs.pstate,
            fp: regs.regs[29],
        })
    }

    /// Instruction pointer at stop time.
    pub fn pc(&self) -> u64 {
        match self {
            RegisterSnapshot::Arm64(r) => r.pc,
            RegisterSnapshot::X8664(r) => r.rip,
        }
    }
}

/// Exception record handed to the client on every notified stop.
#[derive(Clone, Debug)]
pub struct ExceptionInfo {
    pub arch: Architecture,
    pub registers: RegisterSnapshot,
    pub exception: ExceptionType,
    pub thread: Pid,
    /// Fault address for watchpoints and memory faults, 0 if not applicable.
    pub memory_address: u64,
    pub step_mode: SingleStepMode,
    /// True for trace-mode single-steps, false for user-requested ones.
    pub is_trace: bool,
}

impl ExceptionInfo {
    pub(super) fn new(
        regs: &GpRegs,
        exception: ExceptionType,
        thread: Pid,
        memory_address: u64,
        step_mode: SingleStepMode,
        is_trace: bool,
    ) -> Self {
        #[cfg(target_arch = "x86_64")]
        let arch = Architecture::X8664;
        #[cfg(target_arch = "aarch64")]
        let arch = Architecture::Arm64;

        Self {
            arch,
            registers: RegisterSnapshot::capture(regs),
            exception,
            thread,
            memory_address,
            step_mode,
            is_trace,
        }
    }
}

/// Client-provided upcalls, installed once at debugger creation.
///
/// `on_exception` runs on the debugger thread: it must not call back into the
/// debugger request API (that would deadlock on the command queue). Other
/// client threads may call the API freely while an upcall is in flight.
pub trait EventHook: Send + Sync {
    /// Engine log messages, level ordering follows the `log` crate
    /// (error=1 .. trace=5).
    fn log(&self, _level: Level, _message: &str) {}

    /// A debug stop was classified and is presented to the client.
    ///
    /// Return `true` to enter break state (the thread stays stopped until a
    /// continue or single-step request), `false` to silently continue: the
    /// engine transparently steps over the trap and resumes without
    /// presenting the event to the user.
    fn on_exception(&self, info: &ExceptionInfo, pid: Pid) -> bool;
}

/// Hook that breaks on every notified exception and drops log output.
#[derive(Default)]
pub struct NullHook;

impl EventHook for NullHook {
    fn on_exception(&self, _: &ExceptionInfo, _: Pid) -> bool {
        true
    }
}
