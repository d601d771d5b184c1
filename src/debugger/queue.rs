//! Typed command queue between client threads and the debugger thread.
//!
//! All externally visible operations become a [`Request`] executed in FIFO
//! order by the debugger thread; the caller blocks on the request's condition
//! variable and reads the typed result when woken.

use crate::debugger::breakpoint::BreakpointKind;
use crate::debugger::error::Error;
use crate::debugger::register::debug::AccessType;
use nix::unistd::Pid;
use std::collections::VecDeque;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

#[derive(Debug)]
pub(super) enum Command {
    SetWatchpoint {
        address: u64,
        size: u8,
        access: AccessType,
    },
    RemoveWatchpoint {
        address: u64,
    },
    SetBreakpoint {
        address: u64,
        hit_count: u32,
        kind: BreakpointKind,
    },
    RemoveBreakpoint {
        address: u64,
    },
    Continue {
        tid: Pid,
    },
    SingleStep {
        tid: Pid,
    },
    /// Re-arm every active watchpoint on all threads; `finished` is the
    /// hitting thread that just completed its restore step.
    ReapplyWatchpoints {
        finished: Option<Pid>,
    },
    ReadRegister {
        tid: Pid,
        name: String,
    },
    WriteRegister {
        tid: Pid,
        name: String,
        value: u64,
    },
    ReadMemory {
        address: u64,
        size: usize,
    },
    Spawn {
        program: String,
        args: Vec<String>,
        pty: bool,
    },
    ResumeUserStopped,
}

#[derive(Debug)]
pub(super) enum Reply {
    Unit,
    Value(u64),
    Memory(Vec<u8>),
    Spawned {
        pid: Pid,
        pty_master: Option<OwnedFd>,
    },
}

pub(super) struct Request {
    pub command: Command,
    state: Mutex<Option<Result<Reply, Error>>>,
    done: Condvar,
}

impl Request {
    fn new(command: Command) -> Self {
        Self {
            command,
            state: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    pub fn complete(&self, result: Result<Reply, Error>) {
        *self.state.lock().unwrap() = Some(result);
        self.done.notify_one();
    }

    fn wait(&self) -> Result<Reply, Error> {
        let mut state = self.state.lock().unwrap();
        while state.is_none() {
            state = self.done.wait(state).unwrap();
        }
        state.take().expect("completed request carries a result")
    }
}

#[derive(Default)]
pub(super) struct CommandQueue {
    requests: Mutex<VecDeque<Arc<Request>>>,
    closed: AtomicBool,
}

impl CommandQueue {
    /// Enqueue a command and block until the debugger thread completed it.
    pub fn submit(&self, command: Command) -> Result<Reply, Error> {
        let request = Arc::new(Request::new(command));
        {
            // the closed check shares the queue lock with close() so a
            // request is either drained by close or rejected here, never lost
            let mut requests = self.requests.lock().unwrap();
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::EngineShutdown);
            }
            requests.push_back(request.clone());
        }
        request.wait()
    }

    /// Enqueue a command nobody waits for. Used by the debugger thread to
    /// schedule follow-up work for itself without deadlocking on its own
    /// queue.
    pub fn post(&self, command: Command) {
        let mut requests = self.requests.lock().unwrap();
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        requests.push_back(Arc::new(Request::new(command)));
    }

    pub fn pop(&self) -> Option<Arc<Request>> {
        self.requests.lock().unwrap().pop_front()
    }

    /// Reject new submissions and fail everything still queued.
    pub fn close(&self) {
        let drained: Vec<_> = {
            let mut requests = self.requests.lock().unwrap();
            self.closed.store(true, Ordering::SeqCst);
            requests.drain(..).collect()
        };
        for request in drained {
            request.complete(Err(Error::EngineShutdown));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_order_and_completion() {
        let queue = Arc::new(CommandQueue::default());

        let executor = {
            let queue = queue.clone();
            thread::spawn(move || loop {
                if let Some(request) = queue.pop() {
                    let reply = match &request.command {
                        Command::ReadMemory { address, .. } => Ok(Reply::Value(*address)),
                        _ => Ok(Reply::Unit),
                    };
                    let last = matches!(&request.command, Command::ResumeUserStopped);
                    request.complete(reply);
                    if last {
                        break;
                    }
                } else {
                    thread::sleep(Duration::from_millis(1));
                }
            })
        };

        let reply = queue
            .submit(Command::ReadMemory {
                address: 0xABCD,
                size: 8,
            })
            .unwrap();
        assert!(matches!(reply, Reply::Value(0xABCD)));

        assert!(queue.submit(Command::ResumeUserStopped).is_ok());
        executor.join().unwrap();
    }

    #[test]
    fn test_closed_queue_rejects_and_drains() {
        let queue = CommandQueue::default();
        queue.post(Command::ResumeUserStopped);
        queue.close();

        assert!(matches!(
            queue.submit(Command::ResumeUserStopped),
            Err(Error::EngineShutdown)
        ));
        assert!(queue.pop().is_none());
    }
}
