//! Typed envelopes over syscall injection, plus remote memory access.
//!
//! Each wrapper marshals its arguments, runs the syscall inside the target
//! through the debugger, and decodes the kernel's signed return exactly
//! once: a transport failure is `InjectFailure`, a negative return becomes
//! `Os(errno)`, anything else is the result.

use std::ffi::CStr;

use libc::{self, c_long};
use log::{error, info};
use nix::errno;

use crate::debugger::Debugger;
use crate::errors::{Error, Result};
use crate::process::ProcessCtx;

pub(crate) fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

fn show_prot(prot: i32) -> String {
    let mut buf = String::from("---");
    if prot & libc::PROT_READ != 0 {
        buf.replace_range(0..1, "r");
    }
    if prot & libc::PROT_WRITE != 0 {
        buf.replace_range(1..2, "w");
    }
    if prot & libc::PROT_EXEC != 0 {
        buf.replace_range(2..3, "x");
    }
    buf
}

fn show_flags(flags: i32) -> String {
    let mut buf = String::from(if flags & libc::MAP_SHARED != 0 {
        "MAP_SHARED"
    } else {
        "MAP_PRIVATE"
    });
    if flags & libc::MAP_FIXED != 0 {
        buf.push_str(" | MAP_FIXED");
    }
    if flags & libc::MAP_ANONYMOUS != 0 {
        buf.push_str(" | MAP_ANONYMOUS");
    }
    buf
}

impl<D: Debugger> ProcessCtx<D> {
    fn remote_syscall(&mut self, nr: c_long, args: [u64; 6]) -> Result<i64> {
        let ctl = match self.ctl.as_mut() {
            Some(ctl) => ctl,
            None => return Err(Error::Unlinked),
        };
        let sret = match self.dbg.inject_syscall(ctl, nr, args) {
            Ok(sret) => sret,
            Err(err) => {
                error!(
                    "failed to execute syscall {} in {}: {}",
                    nr, self.pid, err
                );
                return Err(Error::InjectFailure { nr });
            }
        };
        if sret as u64 >= -4096i64 as u64 {
            Err(Error::Os(errno::from_i32(-sret as i32)))
        } else {
            Ok(sret)
        }
    }

    /// `mmap` in the target.  Returns the mapped address.
    pub fn remote_mmap(
        &mut self,
        addr: u64,
        size: u64,
        prot: i32,
        flags: i32,
        fd: i32,
        offset: u64,
    ) -> Result<u64> {
        let maddr = self
            .remote_syscall(
                libc::SYS_mmap,
                [addr, size, prot as u64, flags as u64, fd as i64 as u64, offset],
            )
            .map_err(|e| {
                error!("failed to create mmap of {} bytes: {}", size, e);
                e
            })? as u64;

        info!(
            "  - mmap: {:#x}-{:#x}, off: {:#x}, prot: {}, flags: {}",
            maddr,
            maddr + size,
            offset,
            show_prot(prot),
            show_flags(flags)
        );
        Ok(maddr)
    }

    pub fn remote_munmap(&mut self, addr: u64, size: u64) -> Result<()> {
        self.remote_syscall(libc::SYS_munmap, [addr, size, 0, 0, 0, 0])
            .map_err(|e| {
                error!("failed to unmap {:#x}-{:#x}: {}", addr, addr + size, e);
                e
            })?;
        info!("  - munmap: {:#x}-{:#x}", addr, addr + size);
        Ok(())
    }

    /// `open` in the target.  The path is staged through the scratch region,
    /// NUL terminated and padded to the next word boundary, which is the
    /// reason that region must sit at a stable remote address.
    pub fn remote_open(&mut self, path: &CStr, flags: i32, mode: u32) -> Result<i32> {
        let scratch = self.scratch.ok_or(Error::Unlinked)?;
        let bytes = path.to_bytes_with_nul();
        let padded = round_up(bytes.len(), 8);
        if padded as u64 > scratch.remote_size {
            return Err(Error::Os(errno::Errno::ENAMETOOLONG));
        }

        let mut staged = vec![0u8; padded];
        staged[..bytes.len()].copy_from_slice(bytes);
        self.write_data(scratch.remote_addr, &staged)?;

        let fd = self
            .remote_syscall(
                libc::SYS_open,
                [
                    scratch.remote_addr,
                    flags as u64,
                    mode as u64,
                    0,
                    0,
                    0,
                ],
            )
            .map_err(|e| {
                error!("failed to open {:?} in process {}: {}", path, self.pid, e);
                e
            })?;
        Ok(fd as i32)
    }

    pub fn remote_close(&mut self, fd: i32) -> Result<()> {
        self.remote_syscall(libc::SYS_close, [fd as u64, 0, 0, 0, 0, 0])
            .map_err(|e| {
                error!("failed to close fd {} in process {}: {}", fd, self.pid, e);
                e
            })?;
        Ok(())
    }

    /// Word-granular read from the target's memory.
    pub fn read_data(&mut self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let size = buf.len();
        self.dbg.read(self.pid, addr, buf).map_err(|e| {
            error!(
                "failed to read range {:#x}-{:#x} from process {}: {}",
                addr,
                addr + size as u64,
                self.pid,
                e
            );
            e
        })
    }

    /// Word-granular write into the target's memory.
    pub fn write_data(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        self.dbg.write(self.pid, addr, data).map_err(|e| {
            error!(
                "failed to write range {:#x}-{:#x} in process {}: {}",
                addr,
                addr + data.len() as u64,
                self.pid,
                e
            );
            e
        })
    }
}
