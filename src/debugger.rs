//! Thin contract over the OS debugger primitives, and its ptrace engine.
//!
//! Everything the process-control core asks of the kernel goes through the
//! `Debugger` trait: seizing and releasing tasks, remote memory access,
//! syscall injection and stack unwinding.  Tests drive the same core through
//! a scripted implementation.

use std::io;
use std::time::Duration;

use libc::{c_long, c_void};
use log::{debug, error, warn};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{self, WaitStatus};
use nix::sys::{ptrace, signal};
use nix::unistd::Pid;

use crate::errors::{Error, Result};
use crate::proc::{self, TaskRunState, VmaEntry};
use crate::stack::{Backtrace, Frame};

pub const WORD_SIZE: usize = std::mem::size_of::<u64>();

const MAX_FRAMES: usize = 64;

/// What became of a task when we tried to bring it under control.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Stopped by us; will not schedule until resumed.
    Alive,
    /// Already in a trace-stop under a foreign tracer.
    Stopped,
    Zombie,
    Dead,
    /// Gone between enumeration and the stop request.
    Vanished,
}

/// The OS surface the process-control core runs against.
pub trait Debugger {
    /// Per-session injection state, allocated by `prepare`.
    type Handle;

    /// Task ids of the target at this instant.
    fn tasks(&mut self, pid: Pid) -> Result<Vec<Pid>>;

    /// The target's current memory map.
    fn vm_areas(&mut self, pid: Pid) -> Result<Vec<VmaEntry>>;

    /// Bring `tid` under our control, classifying what we found.
    fn stop(&mut self, tid: Pid) -> Result<TaskState>;

    /// Undo a successful `stop`, returning the task to its prior scheduling
    /// state.
    fn resume(&mut self, tid: Pid) -> Result<()>;

    /// Word-granular remote memory access.  `buf`/`data` whose length is not
    /// a multiple of the word size is refused with `BadAlignment`.
    fn read(&mut self, tid: Pid, addr: u64, buf: &mut [u8]) -> Result<()>;
    fn write(&mut self, tid: Pid, addr: u64, data: &[u8]) -> Result<()>;

    /// Set up syscall injection in a stopped target; `cure` undoes it.
    fn prepare(&mut self, pid: Pid) -> Result<Self::Handle>;
    fn cure(&mut self, handle: Self::Handle) -> Result<()>;

    /// Run one syscall inside the target.  The returned value is the raw
    /// kernel return, negative values still encoding errno; decoding happens
    /// in the gateway.
    fn inject_syscall(
        &mut self,
        handle: &mut Self::Handle,
        nr: c_long,
        args: [u64; 6],
    ) -> Result<i64>;

    /// Unwind the call stack of a stopped task.
    fn backtrace_of(&mut self, tid: Pid) -> Result<Backtrace>;

    /// Back off before another seize attempt.
    fn snooze(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Injection state for one linked session: the leader's saved registers and
/// the text word we replaced with `syscall; int3`.
pub struct InfectHandle {
    pid: Pid,
    saved_regs: libc::user_regs_struct,
    saved_text: i64,
    syscall_ip: u64,
}

/// Splice `syscall; int3` into the low bytes of an instruction word.
fn splice_syscall_text(word: i64) -> i64 {
    (word & !0xff_ffff) | 0x00cc_050f
}

/// The real adapter: plain ptrace plus `/proc`.
pub struct PtraceEngine;

impl PtraceEngine {
    pub fn new() -> Self {
        PtraceEngine
    }
}

impl Default for PtraceEngine {
    fn default() -> Self {
        PtraceEngine::new()
    }
}

impl Debugger for PtraceEngine {
    type Handle = InfectHandle;

    fn tasks(&mut self, pid: Pid) -> Result<Vec<Pid>> {
        proc::task_ids(pid)
    }

    fn vm_areas(&mut self, pid: Pid) -> Result<Vec<VmaEntry>> {
        proc::read_vm_areas(pid)
    }

    fn stop(&mut self, tid: Pid) -> Result<TaskState> {
        let state = match proc::task_run_state(tid) {
            Ok(state) => state,
            Err(Error::Io(ref err))
                if err.kind() == io::ErrorKind::NotFound
                    || err.raw_os_error() == Some(libc::ESRCH) =>
            {
                return Ok(TaskState::Vanished)
            }
            Err(err) => return Err(err),
        };
        match state {
            TaskRunState::Zombie => return Ok(TaskState::Zombie),
            TaskRunState::Dead => return Ok(TaskState::Dead),
            // a trace-stop means a foreign tracer holds the task; a plain
            // job-control stop ('T') is still attachable and falls through
            TaskRunState::TraceStopped => return Ok(TaskState::Stopped),
            _live => (),
        }

        match ptrace::attach(tid) {
            Ok(()) => (),
            Err(nix::Error::Sys(Errno::ESRCH)) => return Ok(TaskState::Vanished),
            Err(nix::Error::Sys(Errno::EPERM)) => return Ok(TaskState::Stopped),
            Err(err) => return Err(err.into()),
        }

        match wait::waitpid(tid, None) {
            Ok(WaitStatus::Stopped(_, sig)) => {
                if sig != signal::SIGSTOP {
                    debug!("thread {} stopped with pending {:?}", tid, sig);
                }
                Ok(TaskState::Alive)
            }
            Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => Ok(TaskState::Dead),
            Ok(status) => {
                warn!("unexpected wait status {:?} from thread {}", status, tid);
                Ok(TaskState::Alive)
            }
            Err(nix::Error::Sys(Errno::ECHILD)) => Ok(TaskState::Vanished),
            Err(err) => Err(err.into()),
        }
    }

    fn resume(&mut self, tid: Pid) -> Result<()> {
        ptrace::detach(tid).map_err(Error::from)
    }

    fn read(&mut self, tid: Pid, addr: u64, buf: &mut [u8]) -> Result<()> {
        if buf.len() % WORD_SIZE != 0 {
            return Err(Error::BadAlignment {
                addr,
                size: buf.len(),
            });
        }
        for (i, chunk) in buf.chunks_mut(WORD_SIZE).enumerate() {
            let at = addr + (i * WORD_SIZE) as u64;
            let word = ptrace::read(tid, at as ptrace::AddressType)?;
            chunk.copy_from_slice(&word.to_ne_bytes());
        }
        Ok(())
    }

    fn write(&mut self, tid: Pid, addr: u64, data: &[u8]) -> Result<()> {
        if data.len() % WORD_SIZE != 0 {
            return Err(Error::BadAlignment {
                addr,
                size: data.len(),
            });
        }
        for (i, chunk) in data.chunks(WORD_SIZE).enumerate() {
            let mut bytes = [0u8; WORD_SIZE];
            bytes.copy_from_slice(chunk);
            let word = i64::from_ne_bytes(bytes);
            let at = addr + (i * WORD_SIZE) as u64;
            ptrace::write(tid, at as ptrace::AddressType, word as *mut c_void)?;
        }
        Ok(())
    }

    fn prepare(&mut self, pid: Pid) -> Result<InfectHandle> {
        let saved_regs = ptrace::getregs(pid)?;
        let syscall_ip = saved_regs.rip;
        let saved_text = ptrace::read(pid, syscall_ip as ptrace::AddressType)?;
        ptrace::write(
            pid,
            syscall_ip as ptrace::AddressType,
            splice_syscall_text(saved_text) as *mut c_void,
        )?;
        debug!("prepared injection at {:#x} in {}", syscall_ip, pid);
        Ok(InfectHandle {
            pid,
            saved_regs,
            saved_text,
            syscall_ip,
        })
    }

    fn cure(&mut self, handle: InfectHandle) -> Result<()> {
        ptrace::write(
            handle.pid,
            handle.syscall_ip as ptrace::AddressType,
            handle.saved_text as *mut c_void,
        )?;
        ptrace::setregs(handle.pid, handle.saved_regs)?;
        Ok(())
    }

    fn inject_syscall(
        &mut self,
        handle: &mut InfectHandle,
        nr: c_long,
        args: [u64; 6],
    ) -> Result<i64> {
        let mut regs = handle.saved_regs;
        regs.orig_rax = nr as u64;
        regs.rax = nr as u64;
        regs.rdi = args[0];
        regs.rsi = args[1];
        regs.rdx = args[2];
        regs.r10 = args[3];
        regs.r8 = args[4];
        regs.r9 = args[5];
        regs.rip = handle.syscall_ip;

        ptrace::setregs(handle.pid, regs)?;
        ptrace::cont(handle.pid, None)?;

        let result = match wait::waitpid(handle.pid, None) {
            Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => {
                let after = ptrace::getregs(handle.pid)?;
                Ok(after.rax as i64)
            }
            Ok(unexpected) => {
                error!(
                    "unexpected wait status {:?} while running syscall {} in {}",
                    unexpected, nr, handle.pid
                );
                Err(Error::Os(Errno::EIO))
            }
            Err(err) => Err(err.into()),
        };

        // whatever happened, the leader must come back as we found it
        let _ = ptrace::setregs(handle.pid, handle.saved_regs);
        result
    }

    fn backtrace_of(&mut self, tid: Pid) -> Result<Backtrace> {
        let regs = ptrace::getregs(tid)?;
        let mut frames = vec![Frame {
            ip: regs.rip,
            sp: regs.rsp,
        }];

        // frame-pointer chain; stops at the first hole rather than failing,
        // a truncated unwind only makes the verdict conservative
        let mut fp = regs.rbp;
        while frames.len() < MAX_FRAMES {
            if fp == 0 || fp % WORD_SIZE as u64 != 0 {
                break;
            }
            let next = match ptrace::read(tid, fp as ptrace::AddressType) {
                Ok(word) => word as u64,
                Err(_) => break,
            };
            let ret = match ptrace::read(tid, (fp + WORD_SIZE as u64) as ptrace::AddressType) {
                Ok(word) => word as u64,
                Err(_) => break,
            };
            if ret == 0 {
                break;
            }
            frames.push(Frame {
                ip: ret,
                sp: fp + 2 * WORD_SIZE as u64,
            });
            if next <= fp {
                break;
            }
            fp = next;
        }
        Ok(Backtrace::new(frames))
    }
}
