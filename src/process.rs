//! The process-control core: one owned session around a target process.
//!
//! A `ProcessCtx` brackets everything done to the target.  `suspend` brings
//! every thread under seize control and proves their stacks tolerate the
//! patch; `link`/`unlink` bracket the injection window and own the scratch
//! page; `cure_threads` releases the target on every exit path.

use std::cmp;
use std::time::Duration;

use libc;
use log::{debug, error, info, warn};
use nix::unistd::Pid;

use crate::debugger::{Debugger, TaskState};
use crate::errors::{Error, Result};
use crate::patch::PatchOps;
use crate::stack::{self, StackVerdict};
use crate::threads::ThreadSet;

lazy_static! {
    static ref PAGE_SIZE: u64 = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 };
}

pub fn page_size() -> u64 {
    *PAGE_SIZE
}

const CATCH_TRIES: u32 = 25;
const BACKOFF_START: Duration = Duration::from_millis(1);
const BACKOFF_CAP: Duration = Duration::from_millis(1000);

/// The one page mapped into the target for staging syscall arguments.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScratchRegion {
    pub remote_addr: u64,
    pub remote_size: u64,
}

/// An owned session with a target process.  Alive state (debugger handle,
/// scratch page, seized threads) never outlives the context: dropping or
/// failing any operation releases what was acquired.
pub struct ProcessCtx<D: Debugger> {
    pub(crate) pid: Pid,
    pub(crate) dbg: D,
    pub(crate) ctl: Option<D::Handle>,
    pub(crate) scratch: Option<ScratchRegion>,
    pub(crate) threads: ThreadSet,
}

impl<D: Debugger> ProcessCtx<D> {
    pub fn new(pid: Pid, dbg: D) -> Self {
        ProcessCtx {
            pid,
            dbg,
            ctl: None,
            scratch: None,
            threads: ThreadSet::new(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn threads(&self) -> &ThreadSet {
        &self.threads
    }

    pub fn scratch(&self) -> Option<ScratchRegion> {
        self.scratch
    }

    pub fn is_linked(&self) -> bool {
        self.ctl.is_some()
    }

    /// Attach the debugger to the (already seized) leader and map the
    /// scratch page.  On any failure nothing stays acquired.
    pub fn link(&mut self) -> Result<()> {
        debug!("= preparing {}", self.pid);

        let ctl = self.dbg.prepare(self.pid).map_err(|e| {
            error!("can't create debugger control for {}: {}", self.pid, e);
            e
        })?;
        self.ctl = Some(ctl);

        let size = page_size();
        match self.remote_mmap(
            0,
            size,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
            -1,
            0,
        ) {
            Ok(remote_addr) => {
                self.scratch = Some(ScratchRegion {
                    remote_addr,
                    remote_size: size,
                });
                Ok(())
            }
            Err(err) => {
                error!(
                    "failed to create scratch region in process {}: {}",
                    self.pid, err
                );
                let ctl = self.ctl.take().unwrap();
                if let Err(e) = self.dbg.cure(ctl) {
                    error!("failed to cure process {}: {}", self.pid, e);
                }
                Err(err)
            }
        }
    }

    /// Tear the injection window down.  Idempotent; best-effort after the
    /// first failure, but the debugger is always cured and the handle always
    /// dropped.
    pub fn unlink(&mut self) -> Result<()> {
        if self.ctl.is_none() {
            return Ok(());
        }
        debug!("= cleanup {}", self.pid);

        let mut first_err = None;
        if let Some(scratch) = self.scratch.take() {
            if let Err(e) = self.remote_munmap(scratch.remote_addr, scratch.remote_size) {
                warn!(
                    "failed to unmap scratch region {:#x} in {}: {}",
                    scratch.remote_addr, self.pid, e
                );
                first_err = Some(e);
            }
        }

        let ctl = self.ctl.take().unwrap();
        if let Err(e) = self.dbg.cure(ctl) {
            error!("failed to cure process {}: {}", self.pid, e);
            first_err.get_or_insert(e);
        }

        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    fn collect_threads(&mut self) -> Result<()> {
        for tid in self.dbg.tasks(self.pid)? {
            if self.threads.observe(tid) {
                debug!("  observed thread {}", tid);
            }
        }
        Ok(())
    }

    /// Quiescence witness: stop requests go out in insertion order, so a
    /// seized tail entry means no thread appeared after the last pass.
    fn needs_seize(&self) -> bool {
        match self.threads.last() {
            None => true,
            Some(t) => !t.seized,
        }
    }

    fn seize_threads(&mut self) -> Result<()> {
        let mut i = 0;
        while i < self.threads.len() {
            if self.threads.get(i).seized {
                i += 1;
                continue;
            }
            let tid = self.threads.get(i).tid;
            debug!("  {}", tid);
            match self.dbg.stop(tid)? {
                TaskState::Alive => {
                    self.threads.get_mut(i).seized = true;
                    i += 1;
                }
                TaskState::Stopped => {
                    debug!("BUSY");
                    return Err(Error::Busy(tid));
                }
                TaskState::Zombie => {
                    debug!("ZOMBIE");
                    self.threads.discard(i);
                }
                TaskState::Dead => {
                    debug!("DEAD");
                    self.threads.discard(i);
                }
                TaskState::Vanished => {
                    debug!("VANISHED");
                    self.threads.discard(i);
                }
            }
        }
        Ok(())
    }

    /// Bring every thread of the target under seize control, converging even
    /// while the target spawns or reaps threads.  On error the partial seize
    /// is rolled back before returning.
    pub fn infect(&mut self) -> Result<()> {
        debug!("= infecting process {}:", self.pid);
        let res = self.infect_loop();
        if res.is_err() {
            if let Err(e) = self.cure_threads() {
                warn!("failed to release threads of {}: {}", self.pid, e);
            }
        }
        res
    }

    fn infect_loop(&mut self) -> Result<()> {
        loop {
            self.collect_threads()?;
            if !self.needs_seize() {
                break;
            }
            self.seize_threads()?;
            if self.threads.is_empty() {
                error!("failed to collect any threads of {}", self.pid);
                error!("process {} is considered dead", self.pid);
                return Err(Error::NoThreads(self.pid));
            }
        }
        Ok(())
    }

    /// Resume every seized thread and forget the set.  The walk never stops
    /// early; the first error is reported after everyone had their chance to
    /// run again.
    pub fn cure_threads(&mut self) -> Result<()> {
        let mut first_err = None;
        for t in self.threads.drain() {
            if !t.seized {
                continue;
            }
            debug!("  {}", t.tid);
            if let Err(e) = self.dbg.resume(t.tid) {
                error!("can't unseize thread {}: {}", t.tid, e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// One attempt: seize everything, then judge every stack.  On a clear
    /// verdict the threads stay seized for the caller; otherwise they are
    /// released before returning.
    fn catch<P: PatchOps>(&mut self, ops: &P) -> Result<StackVerdict> {
        self.infect()?;

        let verdict = self
            .dbg
            .vm_areas(self.pid)
            .and_then(|vmas| stack::inspect_threads(&mut self.dbg, self.pid, &self.threads, &vmas, ops));

        match verdict {
            Ok(StackVerdict::Clear) => Ok(StackVerdict::Clear),
            Ok(StackVerdict::Displaced) => {
                if let Err(e) = self.cure_threads() {
                    warn!("failed to release threads of {}: {}", self.pid, e);
                }
                Ok(StackVerdict::Displaced)
            }
            Err(err) => {
                let _ = self.cure_threads();
                Err(err)
            }
        }
    }

    /// The outer retry loop: keep catching the target until every stack is
    /// clear of the patched regions, backing off exponentially between
    /// attempts.  Success leaves every thread seized for the caller to
    /// mutate the target.
    pub fn suspend<P: PatchOps>(&mut self, ops: &P) -> Result<()> {
        let mut backoff = BACKOFF_START;
        for attempt in 0..CATCH_TRIES {
            if attempt > 0 {
                info!(
                    "  failed to catch process in a suitable time/place, retry in {} msec",
                    backoff.as_millis()
                );
                self.dbg.snooze(backoff);
                backoff = next_backoff(backoff);
            }
            match self.catch(ops)? {
                StackVerdict::Clear => return Ok(()),
                StackVerdict::Displaced => continue,
            }
        }
        Err(Error::Timeout(self.pid))
    }
}

fn next_backoff(current: Duration) -> Duration {
    if current < BACKOFF_CAP {
        cmp::min(current * 2, BACKOFF_CAP)
    } else {
        current
    }
}
