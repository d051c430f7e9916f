use std::io;

use libc::c_long;
use nix::errno::Errno;
use nix::unistd::Pid;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while holding a target process.
///
/// Kernel-style negative-errno returns stop at this boundary: callers get a
/// variant, the CLI turns it back into an exit status via `exit_code`.
#[derive(Debug, Error)]
pub enum Error {
    /// Remote memory access whose size is not a multiple of the word size.
    #[error("remote access of {size} bytes at {addr:#x} is not word aligned")]
    BadAlignment { addr: u64, size: usize },

    /// The thread is already stopped by a foreign tracer; not recoverable here.
    #[error("thread {0} is traced by another process")]
    Busy(Pid),

    /// Enumeration of the target yielded no live threads.
    #[error("process {0} has no live threads")]
    NoThreads(Pid),

    /// The retry budget ran out before the target quiesced in a safe place.
    #[error("gave up waiting for process {0} to reach a patchable state")]
    Timeout(Pid),

    /// The debugger could not drive a syscall in the target at all.  Distinct
    /// from the syscall itself failing, which comes back as `Os`.
    #[error("failed to execute syscall {nr} in the target")]
    InjectFailure { nr: c_long },

    /// Bytes in the target do not match what the patch expects to replace.
    #[error("target bytes at {addr:#x} do not match the expected original")]
    Mismatch { addr: u64 },

    /// A remote operation was attempted outside the link..unlink window.
    #[error("no debugger control handle, session is not linked")]
    Unlinked,

    /// The patch description itself is unusable.
    #[error("bad patch description: {0}")]
    Patch(String),

    #[error("os error: {} ({:?})", .0.desc(), .0)]
    Os(Errno),

    #[error("{0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Exit status for the command line, mirroring the errno the kernel-side
    /// convention would have produced.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::BadAlignment { .. }
            | Error::Mismatch { .. }
            | Error::Unlinked
            | Error::Patch(_) => libc::EINVAL,
            Error::Busy(_) => libc::EBUSY,
            Error::NoThreads(_) => libc::ESRCH,
            Error::Timeout(_) => libc::ETIME,
            Error::InjectFailure { .. } => libc::EIO,
            Error::Os(errno) => *errno as i32,
            Error::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        match err {
            nix::Error::Sys(errno) => Error::Os(errno),
            _other => Error::Os(Errno::EINVAL),
        }
    }
}
