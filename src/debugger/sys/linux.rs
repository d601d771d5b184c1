//! Linux/Android back-end: ptrace plus `/proc/<pid>/task`.
//!
//! Every function here expects to run on the thread that seized the target
//! (the debugger thread), ptrace requests from any other thread fail.

use crate::debugger::register::debug::{AccessType, BreakSize};
#[cfg(target_arch = "aarch64")]
use nix::errno::Errno;
use nix::libc;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::fs;

/// Hardware slot count for watchpoints and execution breakpoints. Both
/// architectures expose four programmable slots through the Linux ptrace
/// interface.
pub const HW_SLOTS: usize = 4;

#[cfg(target_arch = "x86_64")]
pub type GpRegs = libc::user_regs_struct;
#[cfg(target_arch = "aarch64")]
pub type GpRegs = libc::user_pt_regs;

pub fn pc(regs: &GpRegs) -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        regs.rip
    }
    #[cfg(target_arch = "aarch64")]
    {
        regs.pc
    }
}

pub fn set_pc(regs: &mut GpRegs, value: u64) {
    #[cfg(target_arch = "x86_64")]
    {
        regs.rip = value;
    }
    #[cfg(target_arch = "aarch64")]
    {
        regs.pc = value;
    }
}

// ---------------------------------------------------------------------------
// Thread enumeration through /proc
// ---------------------------------------------------------------------------

fn thread_state_char(pid: Pid, tid: Pid) -> Option<char> {
    let status = fs::read_to_string(format!("/proc/{pid}/task/{tid}/status")).ok()?;
    let state_line = status.lines().find(|l| l.starts_with("State:"))?;
    state_line[6..].trim_start().chars().next()
}

/// Live (non zombie, non dead) thread identifiers of the target process.
pub fn thread_ids(pid: Pid) -> Vec<Pid> {
    let Ok(entries) = fs::read_dir(format!("/proc/{pid}/task")) else {
        log::error!(target: "debugger", "failed to list threads of process {pid}");
        return vec![];
    };

    entries
        .flatten()
        .filter_map(|e| e.file_name().to_string_lossy().parse::<i32>().ok())
        .filter(|&tid| tid > 0)
        .map(Pid::from_raw)
        .filter(|&tid| !matches!(thread_state_char(pid, tid), Some('Z' | 'X' | 'x') | None))
        .collect()
}

/// True when the kernel reports the thread as stopped or in tracing stop.
pub fn thread_is_stopped(pid: Pid, tid: Pid) -> bool {
    matches!(thread_state_char(pid, tid), Some('T' | 't'))
}

// ---------------------------------------------------------------------------
// Trace control
// ---------------------------------------------------------------------------

/// Establish a trace relationship without stopping the thread. New threads
/// cloned by a seized thread are attached automatically.
pub fn seize(tid: Pid) -> nix::Result<()> {
    ptrace::seize(tid, Options::PTRACE_O_TRACECLONE)
}

pub fn interrupt(tid: Pid) -> nix::Result<()> {
    ptrace::interrupt(tid)
}

pub fn resume(tid: Pid, signal: Option<Signal>) -> nix::Result<()> {
    ptrace::cont(tid, signal)
}

pub fn single_step(tid: Pid, signal: Option<Signal>) -> nix::Result<()> {
    ptrace::step(tid, signal)
}

pub fn detach(tid: Pid) -> nix::Result<()> {
    ptrace::detach(tid, None)
}

/// Fault address from the pending signal information, 0 when unavailable.
pub fn fault_address(tid: Pid) -> u64 {
    match ptrace::getsiginfo(tid) {
        Ok(info) => unsafe { info.si_addr() as u64 },
        Err(_) => 0,
    }
}

// ---------------------------------------------------------------------------
// Target memory, word at a time
// ---------------------------------------------------------------------------

pub fn peek(tid: Pid, address: u64) -> nix::Result<i64> {
    ptrace::read(tid, address as usize as ptrace::AddressType).map(|word| word as i64)
}

pub fn poke(tid: Pid, address: u64, word: i64) -> nix::Result<()> {
    ptrace::write(
        tid,
        address as usize as ptrace::AddressType,
        word as libc::c_long,
    )
}

// ---------------------------------------------------------------------------
// General-purpose registers
// ---------------------------------------------------------------------------

#[cfg(target_arch = "x86_64")]
pub fn registers(tid: Pid) -> nix::Result<GpRegs> {
    ptrace::getregs(tid)
}

#[cfg(target_arch = "x86_64")]
pub fn set_registers(tid: Pid, regs: &GpRegs) -> nix::Result<()> {
    ptrace::setregs(tid, *regs)
}

#[cfg(target_arch = "aarch64")]
const NT_PRSTATUS: libc::c_int = 1;

#[cfg(target_arch = "aarch64")]
pub fn registers(tid: Pid) -> nix::Result<GpRegs> {
    let mut regs: GpRegs = unsafe { std::mem::zeroed() };
    regset(
        tid,
        libc::PTRACE_GETREGSET as u32,
        NT_PRSTATUS,
        &mut regs,
        std::mem::size_of::<GpRegs>(),
    )?;
    Ok(regs)
}

#[cfg(target_arch = "aarch64")]
pub fn set_registers(tid: Pid, regs: &GpRegs) -> nix::Result<()> {
    let mut copy = *regs;
    regset(
        tid,
        libc::PTRACE_SETREGSET as u32,
        NT_PRSTATUS,
        &mut copy,
        std::mem::size_of::<GpRegs>(),
    )
}

/// Raw regset request, nix has no wrapper for the ARM64 register sets.
#[cfg(target_arch = "aarch64")]
fn regset<T>(
    tid: Pid,
    request: u32,
    set: libc::c_int,
    data: &mut T,
    len: usize,
) -> nix::Result<()> {
    let mut iov = libc::iovec {
        iov_base: data as *mut T as *mut libc::c_void,
        iov_len: len,
    };
    let res = unsafe {
        libc::ptrace(
            request as _,
            tid.as_raw() as libc::pid_t,
            set as libc::c_long,
            &mut iov as *mut libc::iovec,
        )
    };
    Errno::result(res).map(drop)
}

// ---------------------------------------------------------------------------
// Hardware debug registers, x86_64: DR0..DR3 + DR6/DR7 in the user area
// ---------------------------------------------------------------------------

#[cfg(target_arch = "x86_64")]
mod hw {
    use super::*;
    use crate::debugger::register::debug::{BreakCondition, DebugRegisterNumber, Dr7};

    fn dr_offset(index: usize) -> u64 {
        (std::mem::offset_of!(libc::user, u_debugreg) + index * 8) as u64
    }

    fn read_dr(tid: Pid, index: usize) -> nix::Result<u64> {
        ptrace::read_user(tid, dr_offset(index) as usize as ptrace::AddressType)
            .map(|word| word as u64)
    }

    fn write_dr(tid: Pid, index: usize, value: u64) -> nix::Result<()> {
        ptrace::write_user(
            tid,
            dr_offset(index) as usize as ptrace::AddressType,
            value as libc::c_long,
        )
    }

    fn dr_number(index: usize) -> DebugRegisterNumber {
        DebugRegisterNumber::from_repr(index).expect("hardware slot index out of range")
    }

    /// Debug status register, low four bits name the slot that fired.
    pub fn debug_status(tid: Pid) -> nix::Result<u64> {
        read_dr(tid, 6)
    }

    /// Clear DR6 to prepare for the next debug exception.
    pub fn clear_debug_status(tid: Pid) -> nix::Result<()> {
        write_dr(tid, 6, 0)
    }

    pub fn install_watchpoint(
        tid: Pid,
        index: usize,
        address: u64,
        size: BreakSize,
        access: AccessType,
    ) -> nix::Result<()> {
        write_dr(tid, index, address)?;
        let mut dr7 = Dr7(read_dr(tid, 7)?);
        dr7.configure(dr_number(index), BreakCondition::from(access), size);
        dr7.set_enabled(dr_number(index), true);
        write_dr(tid, 7, dr7.0)
    }

    pub fn clear_watchpoint(tid: Pid, index: usize) -> nix::Result<()> {
        write_dr(tid, index, 0)?;
        let mut dr7 = Dr7(read_dr(tid, 7)?);
        dr7.clear(dr_number(index));
        write_dr(tid, 7, dr7.0)
    }

    /// Drop the enable bit of a slot on one thread, returns the previous
    /// control word for bookkeeping.
    pub fn disable_watchpoint(tid: Pid, index: usize) -> nix::Result<u64> {
        let mut dr7 = Dr7(read_dr(tid, 7)?);
        let saved = dr7.0;
        dr7.set_enabled(dr_number(index), false);
        write_dr(tid, 7, dr7.0)?;
        Ok(saved)
    }

    pub fn install_breakpoint(tid: Pid, index: usize, address: u64) -> nix::Result<()> {
        write_dr(tid, index, address)?;
        let mut dr7 = Dr7(read_dr(tid, 7)?);
        dr7.configure(dr_number(index), BreakCondition::Execute, BreakSize::Bytes1);
        dr7.set_enabled(dr_number(index), true);
        write_dr(tid, 7, dr7.0)
    }

    pub fn clear_breakpoint(tid: Pid, index: usize) -> nix::Result<()> {
        write_dr(tid, index, 0)?;
        let mut dr7 = Dr7(read_dr(tid, 7)?);
        dr7.clear(dr_number(index));
        write_dr(tid, 7, dr7.0)
    }

    pub fn disable_breakpoint(tid: Pid, index: usize) -> nix::Result<()> {
        let mut dr7 = Dr7(read_dr(tid, 7)?);
        dr7.set_enabled(dr_number(index), false);
        write_dr(tid, 7, dr7.0)
    }

    pub fn enable_breakpoint(tid: Pid, index: usize, address: u64) -> nix::Result<()> {
        install_breakpoint(tid, index, address)
    }
}

// ---------------------------------------------------------------------------
// Hardware debug registers, ARM64: NT_ARM_HW_WATCH / NT_ARM_HW_BREAK regsets
// ---------------------------------------------------------------------------

#[cfg(target_arch = "aarch64")]
mod hw {
    use super::*;
    use crate::debugger::register::debug::{break_ctrl, watch_ctrl};

    const NT_ARM_HW_BREAK: libc::c_int = 0x402;
    const NT_ARM_HW_WATCH: libc::c_int = 0x403;

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct HwDebugReg {
        pub addr: u64,
        pub ctrl: u32,
        pub pad: u32,
    }

    /// Kernel layout of the hardware debug regsets: an 8-byte info header
    /// followed by 16 bytes per slot.
    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct HwDebugState {
        pub dbg_info: u32,
        pub pad: u32,
        pub dbg_regs: [HwDebugReg; 16],
    }

    const IOV_LEN: usize = 8 + 16 * HW_SLOTS;

    fn get_state(tid: Pid, set: libc::c_int) -> nix::Result<HwDebugState> {
        let mut state: HwDebugState = unsafe { std::mem::zeroed() };
        regset(tid, libc::PTRACE_GETREGSET as u32, set, &mut state, IOV_LEN)?;
        Ok(state)
    }

    fn set_state(tid: Pid, set: libc::c_int, state: &mut HwDebugState) -> nix::Result<()> {
        regset(tid, libc::PTRACE_SETREGSET as u32, set, state, IOV_LEN)
    }

    /// DR6 has no ARM64 counterpart, hits are matched by fault address.
    pub fn debug_status(_tid: Pid) -> nix::Result<u64> {
        Ok(0)
    }

    pub fn clear_debug_status(_tid: Pid) -> nix::Result<()> {
        Ok(())
    }

    pub fn install_watchpoint(
        tid: Pid,
        index: usize,
        address: u64,
        size: BreakSize,
        access: AccessType,
    ) -> nix::Result<()> {
        let mut state = get_state(tid, NT_ARM_HW_WATCH)?;
        // re-arm any slot left disabled by a step-over on this thread
        for reg in state.dbg_regs.iter_mut().take(HW_SLOTS) {
            if reg.addr != 0 {
                reg.ctrl |= 1;
            }
        }
        state.dbg_regs[index].addr = address;
        state.dbg_regs[index].ctrl = watch_ctrl(size, access);
        set_state(tid, NT_ARM_HW_WATCH, &mut state)
    }

    pub fn clear_watchpoint(tid: Pid, index: usize) -> nix::Result<()> {
        let mut state = get_state(tid, NT_ARM_HW_WATCH)?;
        state.dbg_regs[index].addr = 0;
        state.dbg_regs[index].ctrl = 0;
        set_state(tid, NT_ARM_HW_WATCH, &mut state)
    }

    pub fn disable_watchpoint(tid: Pid, index: usize) -> nix::Result<u64> {
        let mut state = get_state(tid, NT_ARM_HW_WATCH)?;
        let saved = state.dbg_regs[index].ctrl as u64;
        state.dbg_regs[index].ctrl = 0;
        set_state(tid, NT_ARM_HW_WATCH, &mut state)?;
        Ok(saved)
    }

    pub fn install_breakpoint(tid: Pid, index: usize, address: u64) -> nix::Result<()> {
        let mut state = get_state(tid, NT_ARM_HW_BREAK)?;
        for reg in state.dbg_regs.iter_mut().take(HW_SLOTS) {
            if reg.addr != 0 {
                reg.ctrl = break_ctrl();
            }
        }
        state.dbg_regs[index].addr = address;
        state.dbg_regs[index].ctrl = break_ctrl();
        set_state(tid, NT_ARM_HW_BREAK, &mut state)
    }

    pub fn clear_breakpoint(tid: Pid, index: usize) -> nix::Result<()> {
        let mut state = get_state(tid, NT_ARM_HW_BREAK)?;
        state.dbg_regs[index].addr = 0;
        state.dbg_regs[index].ctrl = 0;
        set_state(tid, NT_ARM_HW_BREAK, &mut state)
    }

    pub fn disable_breakpoint(tid: Pid, index: usize) -> nix::Result<()> {
        let mut state = get_state(tid, NT_ARM_HW_BREAK)?;
        state.dbg_regs[index].ctrl = 0;
        set_state(tid, NT_ARM_HW_BREAK, &mut state)
    }

    pub fn enable_breakpoint(tid: Pid, index: usize, address: u64) -> nix::Result<()> {
        let mut state = get_state(tid, NT_ARM_HW_BREAK)?;
        state.dbg_regs[index].addr = address;
        state.dbg_regs[index].ctrl = break_ctrl();
        set_state(tid, NT_ARM_HW_BREAK, &mut state)
    }
}

pub use hw::*;

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::getpid;

    #[test]
    fn test_thread_ids_sees_current_process() {
        let pid = getpid();
        let tids = thread_ids(pid);
        assert!(tids.contains(&pid));
    }

    #[test]
    fn test_thread_ids_empty_for_dead_process() {
        // pid 0 has no /proc entry from a user process point of view
        assert!(thread_ids(Pid::from_raw(0)).is_empty());
    }
}
