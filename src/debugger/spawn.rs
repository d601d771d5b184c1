//! Process creation under tracing.
//!
//! The child requests tracing of itself before exec; once the post-exec trap
//! arrives the parent promotes the relationship from TRACEME to SEIZE so the
//! spawned process behaves exactly like an attached one (new threads
//! auto-attach, interrupts produce seize-stops).

use crate::debugger::error::Error;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::pty::{forkpty, ForkptyResult, Winsize};
use nix::sys::ptrace;
use nix::sys::signal::{kill, Signal};
use nix::sys::termios::Termios;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd};

/// Exit code of the child when exec fails.
const EXEC_FAILED: i32 = 127;

fn exec_args(program: &str, args: &[String]) -> Result<(CString, Vec<CString>), Error> {
    let to_cstring = |s: &str| {
        CString::new(s).map_err(|_| Error::Syscall("execvp", nix::Error::EINVAL))
    };
    let program = to_cstring(program)?;
    let mut argv = vec![program.clone()];
    for arg in args {
        argv.push(to_cstring(arg)?);
    }
    Ok((program, argv))
}

/// Runs in the child after fork: request tracing of self and exec the target.
fn trace_me_and_exec(program: &CString, argv: &[CString]) -> ! {
    if ptrace::traceme().is_err() {
        unsafe { nix::libc::_exit(EXEC_FAILED) };
    }
    let _ = nix::unistd::execvp(program, argv);
    unsafe { nix::libc::_exit(EXEC_FAILED) }
}

/// Promote a TRACEME child stopped at its post-exec trap to SEIZE semantics:
/// deliver SIGSTOP, detach, wait for the stop to materialize, seize with
/// clone tracing, interrupt, and wait for the seize-stop.
fn promote_to_seize(pid: Pid) -> Result<(), Error> {
    kill(pid, Signal::SIGSTOP).map_err(|e| Error::Syscall("kill", e))?;
    ptrace::detach(pid, None).map_err(Error::Ptrace)?;

    let status = waitpid(pid, Some(WaitPidFlag::WUNTRACED)).map_err(Error::Waitpid)?;
    if !matches!(status, WaitStatus::Stopped(_, _)) {
        return Err(Error::Syscall("waitpid", nix::Error::ECHILD));
    }

    ptrace::seize(pid, ptrace::Options::PTRACE_O_TRACECLONE).map_err(Error::Ptrace)?;
    ptrace::interrupt(pid).map_err(Error::Ptrace)?;
    waitpid(pid, None).map_err(Error::Waitpid)?;

    Ok(())
}

fn await_initial_trap(pid: Pid) -> Result<(), Error> {
    match waitpid(pid, None).map_err(Error::Waitpid)? {
        WaitStatus::Stopped(_, _) => Ok(()),
        WaitStatus::Exited(_, code) => Err(Error::ProcessExit(code)),
        WaitStatus::Signaled(_, sig, _) => Err(Error::ProcessExit(128 + sig as i32)),
        status => {
            log::error!(target: "debugger", "unexpected spawn wait status: {status:?}");
            Err(Error::Syscall("waitpid", nix::Error::ECHILD))
        }
    }
}

/// Fork and exec a target under trace. Returns once the child is stopped
/// under SEIZE semantics, before its first user instruction.
pub(super) fn spawn(program: &str, args: &[String]) -> Result<Pid, Error> {
    let (program, argv) = exec_args(program, args)?;

    match unsafe { fork() }.map_err(|e| Error::Syscall("fork", e))? {
        ForkResult::Child => trace_me_and_exec(&program, &argv),
        ForkResult::Parent { child } => {
            await_initial_trap(child)?;
            promote_to_seize(child)?;
            log::info!(target: "debugger", "spawned process {child} re-attached with seize");
            Ok(child)
        }
    }
}

/// [`spawn`] with a pseudo-terminal: the child gets the slave as its
/// controlling terminal, the caller receives the non-blocking master.
pub(super) fn spawn_with_pty(program: &str, args: &[String]) -> Result<(Pid, OwnedFd), Error> {
    let (program, argv) = exec_args(program, args)?;

    let winsize = Winsize {
        ws_row: 50,
        ws_col: 120,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    let fork_result = unsafe { forkpty(Some(&winsize), None::<&Termios>) }
        .map_err(|e| Error::Syscall("forkpty", e))?;
    match fork_result {
        ForkptyResult::Child => trace_me_and_exec(&program, &argv),
        ForkptyResult::Parent { child, master } => {
            let flags = fcntl(master.as_raw_fd(), FcntlArg::F_GETFL)
                .map_err(|e| Error::Syscall("fcntl", e))?;
            let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
            fcntl(master.as_raw_fd(), FcntlArg::F_SETFL(flags))
                .map_err(|e| Error::Syscall("fcntl", e))?;

            await_initial_trap(child)?;
            promote_to_seize(child)?;
            log::info!(target: "debugger", "spawned process {child} re-attached with seize (pty)");
            Ok((child, master))
        }
    }
}
