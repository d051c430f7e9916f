//! Per-thread call-stack inspection: decide whether any thread currently
//! executes inside code the patch is about to displace.

use log::{error, info};
use nix::unistd::Pid;

use crate::debugger::Debugger;
use crate::errors::Result;
use crate::patch::PatchOps;
use crate::proc::VmaEntry;
use crate::threads::ThreadSet;

/// One unwound frame of a stopped thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frame {
    pub ip: u64,
    pub sp: u64,
}

/// Snapshot of a thread's call stack at the moment of seize, innermost frame
/// first.  Valid only while the thread stays stopped.
#[derive(Debug)]
pub struct Backtrace {
    frames: Vec<Frame>,
}

impl Backtrace {
    pub fn new(frames: Vec<Frame>) -> Self {
        Backtrace { frames }
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

impl std::fmt::Display for Backtrace {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for (i, frame) in self.frames.iter().enumerate() {
            writeln!(f, "#{:<2} {:#018x} sp {:#x}", i, frame.ip, frame.sp)?;
        }
        Ok(())
    }
}

/// Outcome of judging one backtrace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StackVerdict {
    /// The stack is clear of the regions to be modified.
    Clear,
    /// A frame sits inside a region to be modified; may clear up on its own,
    /// worth backing off and retrying.
    Displaced,
}

/// Unwind every seized thread in observation order and ask `ops` whether its
/// stack tolerates the patch.  The first non-clear verdict wins; errors from
/// the judgement are fatal and propagate as-is.
pub fn inspect_threads<D, P>(
    dbg: &mut D,
    pid: Pid,
    threads: &ThreadSet,
    vmas: &[VmaEntry],
    ops: &P,
) -> Result<StackVerdict>
where
    D: Debugger,
    P: PatchOps,
{
    info!("= checking {} stack...", pid);
    for t in threads.iter() {
        info!("  {}:", t.tid);
        let bt = dbg.backtrace_of(t.tid).map_err(|e| {
            error!("failed to unwind stack of thread {}: {}", t.tid, e);
            e
        })?;
        match ops.check_backtrace(t.tid, &bt, vmas)? {
            StackVerdict::Clear => (),
            verdict => return Ok(verdict),
        }
    }
    Ok(StackVerdict::Clear)
}
