//! The patch capability and the two top-level operations.
//!
//! The process-control core only arbitrates timing; what a patch does to the
//! target is the `PatchOps` implementor's business.  `CodePatch` is the
//! concrete implementation: a JSON description of byte replacements, plus an
//! optional code object mapped into the target through the remote gateway.

use std::ffi::CString;
use std::fs::File;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use libc;
use log::{debug, error, info, warn};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::debugger::{Debugger, PtraceEngine, WORD_SIZE};
use crate::errors::{Error, Result};
use crate::process::{page_size, ProcessCtx};
use crate::proc::VmaEntry;
use crate::stack::{Backtrace, StackVerdict};

/// The three operations the core invokes on a patch.  `check_backtrace` runs
/// while the target is seized and must not mutate it; `apply` and `revert`
/// run inside the link..unlink window.
pub trait PatchOps {
    fn apply<D: Debugger>(&mut self, ctx: &mut ProcessCtx<D>) -> Result<()>;

    fn check_backtrace(
        &self,
        tid: Pid,
        bt: &Backtrace,
        vmas: &[VmaEntry],
    ) -> Result<StackVerdict>;

    fn revert<D: Debugger>(&mut self, ctx: &mut ProcessCtx<D>) -> Result<()>;
}

/// One byte replacement: `old` must currently be at `addr`, `new` replaces it.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PatchSite {
    pub addr: u64,
    pub old: Vec<u8>,
    pub new: Vec<u8>,
}

/// On-disk patch description.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PatchDesc {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub sites: Vec<PatchSite>,
    /// Optional code object mapped read/exec into the target before the
    /// sites are written; replacement bytes may jump into it.
    #[serde(default)]
    pub payload: Option<PathBuf>,
}

pub struct CodePatch {
    desc: PatchDesc,
    payload_map: Option<(u64, u64)>,
    applied: usize,
}

/// Word-aligned span covering `len` bytes at `addr`.
fn span_of(addr: u64, len: usize) -> (u64, usize) {
    let word = WORD_SIZE as u64;
    let start = addr & !(word - 1);
    let end = (addr + len as u64 + word - 1) & !(word - 1);
    (start, (end - start) as usize)
}

/// Write `bytes` at `addr` by splicing them into the covering word-aligned
/// span.  With `expected`, the current bytes are verified first and a
/// mismatch refused before anything is written.
fn splice_write<D: Debugger>(
    ctx: &mut ProcessCtx<D>,
    addr: u64,
    expected: Option<&[u8]>,
    bytes: &[u8],
) -> Result<()> {
    let (start, span_len) = span_of(addr, bytes.len());
    let mut span = vec![0u8; span_len];
    ctx.read_data(start, &mut span)?;

    let off = (addr - start) as usize;
    if let Some(expected) = expected {
        if &span[off..off + bytes.len()] != expected {
            return Err(Error::Mismatch { addr });
        }
    }
    span[off..off + bytes.len()].copy_from_slice(bytes);
    ctx.write_data(start, &span)
}

impl CodePatch {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            error!("can't open patch description {:?}: {}", path, e);
            Error::Io(e)
        })?;
        let desc = serde_json::from_reader(file)
            .map_err(|e| Error::Patch(format!("malformed description: {}", e)))?;
        CodePatch::from_desc(desc)
    }

    pub fn from_desc(desc: PatchDesc) -> Result<Self> {
        if desc.sites.is_empty() && desc.payload.is_none() {
            return Err(Error::Patch(String::from("patch describes no work")));
        }
        for site in &desc.sites {
            if site.new.is_empty() {
                return Err(Error::Patch(format!("site {:#x} is empty", site.addr)));
            }
            if site.old.len() != site.new.len() {
                return Err(Error::Patch(format!(
                    "site {:#x}: replacement is {} bytes, original is {}",
                    site.addr,
                    site.new.len(),
                    site.old.len()
                )));
            }
        }
        Ok(CodePatch {
            desc,
            payload_map: None,
            applied: 0,
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.desc.name.as_ref().map(|s| s.as_str())
    }

    /// Open the payload object inside the target and map it read/exec.
    fn map_payload<D: Debugger>(&mut self, ctx: &mut ProcessCtx<D>, path: &Path) -> Result<()> {
        let len = std::fs::metadata(path)?.len();
        if len == 0 {
            return Err(Error::Patch(format!("payload object {:?} is empty", path)));
        }
        let size = (len + page_size() - 1) / page_size() * page_size();
        let cpath = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| Error::Patch(format!("payload path {:?} contains NUL", path)))?;

        let fd = ctx.remote_open(&cpath, libc::O_RDONLY, 0)?;
        let base = match ctx.remote_mmap(
            0,
            size,
            libc::PROT_READ | libc::PROT_EXEC,
            libc::MAP_PRIVATE,
            fd,
            0,
        ) {
            Ok(base) => base,
            Err(err) => {
                let _ = ctx.remote_close(fd);
                return Err(err);
            }
        };
        self.payload_map = Some((base, size));
        ctx.remote_close(fd)?;

        info!("  payload {:?} mapped at {:#x}", path, base);
        Ok(())
    }
}

impl PatchOps for CodePatch {
    fn apply<D: Debugger>(&mut self, ctx: &mut ProcessCtx<D>) -> Result<()> {
        match self.name() {
            Some(name) => info!("= applying {:?} to process {}", name, ctx.pid()),
            None => info!("= applying patch to process {}", ctx.pid()),
        }

        if let Some(path) = self.desc.payload.clone() {
            if let Err(err) = self.map_payload(ctx, &path) {
                if let Err(e) = self.revert(ctx) {
                    warn!("failed to back out payload mapping: {}", e);
                }
                return Err(err);
            }
        }

        for i in 0..self.desc.sites.len() {
            let addr = self.desc.sites[i].addr;
            let res = {
                let site = &self.desc.sites[i];
                splice_write(ctx, site.addr, Some(&site.old), &site.new)
            };
            match res {
                Ok(()) => {
                    self.applied = i + 1;
                    debug!("  patched {} bytes at {:#x}", self.desc.sites[i].new.len(), addr);
                }
                Err(err) => {
                    error!(
                        "failed to patch site {:#x} in {}: {}",
                        addr,
                        ctx.pid(),
                        err
                    );
                    if let Err(e) = self.revert(ctx) {
                        warn!("failed to back out partially applied patch: {}", e);
                    }
                    return Err(err);
                }
            }
        }

        info!(
            "= patched {} site(s) in process {}",
            self.desc.sites.len(),
            ctx.pid()
        );
        Ok(())
    }

    fn check_backtrace(
        &self,
        tid: Pid,
        bt: &Backtrace,
        vmas: &[VmaEntry],
    ) -> Result<StackVerdict> {
        for frame in bt.frames() {
            for site in &self.desc.sites {
                let len = site.new.len() as u64;
                if frame.ip >= site.addr && frame.ip < site.addr + len {
                    let mapping = vmas
                        .iter()
                        .find(|v| v.contains(frame.ip))
                        .and_then(|v| v.path())
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| String::from("?"));
                    debug!(
                        "  thread {} executes at {:#x} ({}) inside a patched range",
                        tid, frame.ip, mapping
                    );
                    return Ok(StackVerdict::Displaced);
                }
            }
        }
        Ok(StackVerdict::Clear)
    }

    /// Restore the original bytes of every written site, newest first, then
    /// drop the payload mapping.  The walk finishes even when a step fails;
    /// the first error is reported.
    fn revert<D: Debugger>(&mut self, ctx: &mut ProcessCtx<D>) -> Result<()> {
        let mut first_err = None;
        for i in (0..self.applied).rev() {
            let addr = self.desc.sites[i].addr;
            let res = {
                let site = &self.desc.sites[i];
                splice_write(ctx, site.addr, None, &site.old)
            };
            if let Err(e) = res {
                error!("failed to restore bytes at {:#x}: {}", addr, e);
                first_err.get_or_insert(e);
            }
        }
        self.applied = 0;

        if let Some((base, size)) = self.payload_map.take() {
            if let Err(e) = ctx.remote_munmap(base, size) {
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

/// Drive one complete patch session.  After a successful `suspend` the
/// teardown half (`unlink`, `cure_threads`) runs no matter how `apply`
/// fared; the first error in session order wins.
pub fn run_patch<D, P>(ctx: &mut ProcessCtx<D>, ops: &mut P) -> Result<()>
where
    D: Debugger,
    P: PatchOps,
{
    ctx.suspend(ops)?;
    if let Err(err) = ctx.link() {
        let _ = ctx.cure_threads();
        return Err(err);
    }

    let applied = ops.apply(ctx);
    let unlinked = ctx.unlink();
    let cured = ctx.cure_threads();
    applied.and(unlinked).and(cured)
}

/// Seize and inspect only: report whether the patch could be applied right
/// now, leaving the target untouched.
pub fn run_check<D, P>(ctx: &mut ProcessCtx<D>, ops: &P) -> Result<()>
where
    D: Debugger,
    P: PatchOps,
{
    ctx.suspend(ops)?;
    info!("= patch is applicable to process {}", ctx.pid());
    ctx.cure_threads()
}

pub fn patch_process(pid: libc::pid_t, patchfile: &Path) -> Result<()> {
    let mut ops = CodePatch::load(patchfile)?;
    let mut ctx = ProcessCtx::new(Pid::from_raw(pid), PtraceEngine::new());
    run_patch(&mut ctx, &mut ops)
}

pub fn check_process(pid: libc::pid_t, patchfile: &Path) -> Result<()> {
    let ops = CodePatch::load(patchfile)?;
    let mut ctx = ProcessCtx::new(Pid::from_raw(pid), PtraceEngine::new());
    run_check(&mut ctx, &ops)
}
