//! General-purpose register access and the canonical register name set.

pub mod debug;

use crate::debugger::error::Error;
use crate::debugger::sys::{self, GpRegs};
use nix::unistd::Pid;
use std::str::FromStr;

#[cfg(target_arch = "x86_64")]
pub use self::x86_64::Register;

#[cfg(target_arch = "aarch64")]
pub use self::aarch64::Register;

#[cfg(target_arch = "x86_64")]
mod x86_64 {
    use super::GpRegs;
    use strum_macros::{Display, EnumIter, EnumString};

    /// Canonical x86_64 register set, named by the usual mnemonics.
    #[derive(Copy, Clone, PartialEq, Eq, Debug, Display, EnumString, EnumIter)]
    #[strum(serialize_all = "snake_case")]
    pub enum Register {
        Rax,
        Rbx,
        Rcx,
        Rdx,
        Rsi,
        Rdi,
        Rbp,
        Rsp,
        R8,
        R9,
        R10,
        R11,
        R12,
        R13,
        R14,
        R15,
        Rip,
        #[strum(to_string = "rflags", serialize = "eflags")]
        Rflags,
        Cs,
        Ss,
        Ds,
        Es,
        Fs,
        Gs,
        FsBase,
        GsBase,
    }

    impl Register {
        pub fn value(self, regs: &GpRegs) -> u64 {
            match self {
                Register::Rax => regs.rax,
                Register::Rbx => regs.rbx,
                Register::Rcx => regs.rcx,
                Register::Rdx => regs.rdx,
                Register::Rsi => regs.rsi,
                Register::Rdi => regs.rdi,
                Register::Rbp => regs.rbp,
                Register::Rsp => regs.rsp,
                Register::R8 => regs.r8,
                Register::R9 => regs.r9,
                Register::R10 => regs.r10,
                Register::R11 => regs.r11,
                Register::R12 => regs.r12,
                Register::R13 => regs.r13,
                Register::R14 => regs.r14,
                Register::R15 => regs.r15,
                Register::Rip => regs.rip,
                Register::Rflags => regs.eflags,
                Register::Cs => regs.cs,
                Register::Ss => regs.ss,
                Register::Ds => regs.ds,
                Register::Es => regs.es,
                Register::Fs => regs.fs,
                Register::Gs => regs.gs,
                Register::FsBase => regs.fs_base,
                Register::GsBase => regs.gs_base,
            }
        }

        pub fn update(self, regs: &mut GpRegs, value: u64) {
            match self {
                Register::Rax => regs.rax = value,
                Register::Rbx => regs.rbx = value,
                Register::Rcx => regs.rcx = value,
                Register::Rdx => regs.rdx = value,
                Register::Rsi => regs.rsi = value,
                Register::Rdi => regs.rdi = value,
                Register::Rbp => regs.rbp = value,
                Register::Rsp => regs.rsp = value,
                Register::R8 => regs.r8 = value,
                Register::R9 => regs.r9 = value,
                Register::R10 => regs.r10 = value,
                Register::R11 => regs.r11 = value,
                Register::R12 => regs.r12 = value,
                Register::R13 => regs.r13 = value,
                Register::R14 => regs.r14 = value,
                Register::R15 => regs.r15 = value,
                Register::Rip => regs.rip = value,
                Register::Rflags => regs.eflags = value,
                Register::Cs => regs.cs = value,
                Register::Ss => regs.ss = value,
                Register::Ds => regs.ds = value,
                Register::Es => regs.es = value,
                Register::Fs => regs.fs = value,
                Register::Gs => regs.gs = value,
                Register::FsBase => regs.fs_base = value,
                Register::GsBase => regs.gs_base = value,
            }
        }
    }
}

#[cfg(target_arch = "aarch64")]
mod aarch64 {
    use super::GpRegs;
    use strum_macros::{Display, EnumIter, EnumString};

    /// Canonical ARM64 register set, named by the usual mnemonics.
    #[derive(Copy, Clone, PartialEq, Eq, Debug, Display, EnumString, EnumIter)]
    #[strum(serialize_all = "lowercase")]
    pub enum Register {
        X0,
        X1,
        X2,
        X3,
        X4,
        X5,
        X6,
        X7,
        X8,
        X9,
        X10,
        X11,
        X12,
        X13,
        X14,
        X15,
        X16,
        X17,
        X18,
        X19,
        X20,
        X21,
        X22,
        X23,
        X24,
        X25,
        X26,
        X27,
        X28,
        X29,
        X30,
        Sp,
        Pc,
        Pstate,
    }

    impl Register {
        fn index(self) -> Option<usize> {
            match self {
                Register::Sp | Register::Pc | Register::Pstate => None,
                reg => Some(reg as usize),
            }
        }

        pub fn value(self, regs: &GpRegs) -> u64 {
            match self {
                Register::Sp => regs.sp,
                Register::Pc => regs.pc,
                Register::Pstate => regs.pstate,
                reg => regs.regs[reg.index().expect("infallible")],
            }
        }

        pub fn update(self, regs: &mut GpRegs, value: u64) {
            match self {
                Register::Sp => regs.sp = value,
                Register::Pc => regs.pc = value,
                Register::Pstate => regs.pstate = value,
                reg => regs.regs[reg.index().expect("infallible")] = value,
            }
        }
    }
}

/// Resolve a register by its canonical name, names outside the canon are rejected.
pub fn get_register_from_name(name: &str) -> Result<Register, Error> {
    Register::from_str(name).map_err(|_| Error::RegisterNameNotFound(name.to_string()))
}

/// Read a single register of a stopped thread.
pub fn get_register_value(tid: Pid, reg: Register) -> Result<u64, Error> {
    let regs = sys::registers(tid).map_err(Error::Ptrace)?;
    Ok(reg.value(&regs))
}

/// Write a single register of a stopped thread.
pub(super) fn set_register_value(tid: Pid, reg: Register, value: u64) -> Result<(), Error> {
    let mut regs = sys::registers(tid).map_err(Error::Ptrace)?;
    reg.update(&mut regs, value);
    sys::set_registers(tid, &regs).map_err(Error::Ptrace)
}
