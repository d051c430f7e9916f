//! The read-only `/proc` surface of the target: thread ids, per-task run
//! state, and the virtual memory map.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use combine::error::ParseError;
use combine::parser::char::{char, digit, hex_digit, spaces};
use combine::Parser;
use combine::{choice, count, many1, none_of, optional, Stream};

use libc;
use nix::unistd::Pid;

use crate::errors::{Error, Result};

/// One line of `/proc/<pid>/maps`.
#[derive(Clone, PartialEq, Eq)]
pub struct VmaEntry {
    start: u64,
    end: u64,
    prot: i32,
    flags: i32,
    offset: u64,
    dev: (i32, i32),
    inode: u64,
    path: Option<PathBuf>,
}

impl VmaEntry {
    pub fn start(&self) -> u64 {
        self.start
    }
    pub fn end(&self) -> u64 {
        self.end
    }
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
    pub fn is_exec(&self) -> bool {
        self.prot & libc::PROT_EXEC != 0
    }
    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }
}

impl std::fmt::Debug for VmaEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut perms = String::with_capacity(4);
        perms.push(if self.prot & libc::PROT_READ != 0 { 'r' } else { '-' });
        perms.push(if self.prot & libc::PROT_WRITE != 0 { 'w' } else { '-' });
        perms.push(if self.prot & libc::PROT_EXEC != 0 { 'x' } else { '-' });
        perms.push(if self.flags & libc::MAP_SHARED != 0 { 's' } else { 'p' });
        write!(
            f,
            "{:x}-{:x} {} {:08x} {:02x}:{:02x} {}",
            self.start, self.end, perms, self.offset, self.dev.0, self.dev.1, self.inode
        )?;
        if let Some(p) = &self.path {
            write!(f, " {}", p.display())?;
        }
        Ok(())
    }
}

fn hex_value<I>() -> impl Parser<Input = I, Output = u64>
where
    I: Stream<Item = char>,
    // Necessary due to rust-lang/rust#24159
    I::Error: ParseError<I::Item, I::Range, I::Position>,
{
    many1::<String, _>(hex_digit()).map(|s| u64::from_str_radix(&s, 16).unwrap_or(0))
}

fn dec_value<I>() -> impl Parser<Input = I, Output = u64>
where
    I: Stream<Item = char>,
    // Necessary due to rust-lang/rust#24159
    I::Error: ParseError<I::Item, I::Range, I::Position>,
{
    many1::<String, _>(digit()).map(|s| s.parse::<u64>().unwrap_or(0))
}

fn device<I>() -> impl Parser<Input = I, Output = (i32, i32)>
where
    I: Stream<Item = char>,
    I::Error: ParseError<I::Item, I::Range, I::Position>,
{
    (
        spaces(),
        count::<String, _>(2, hex_digit()),
        char(':'),
        count::<String, _>(2, hex_digit()),
    )
        .map(|(_, major, _, minor)| {
            (
                i32::from_str_radix(&major, 16).unwrap_or(0),
                i32::from_str_radix(&minor, 16).unwrap_or(0),
            )
        })
}

fn perms<I>() -> impl Parser<Input = I, Output = (i32, i32)>
where
    I: Stream<Item = char>,
    I::Error: ParseError<I::Item, I::Range, I::Position>,
{
    (
        spaces(),
        choice([char('-'), char('r')]),
        choice([char('-'), char('w')]),
        choice([char('-'), char('x')]),
        choice([char('-'), char('s'), char('p')]),
    )
        .map(|(_, r, w, x, s)| {
            let mut prot: i32 = 0;
            let mut flags: i32 = 0;
            if r == 'r' {
                prot |= libc::PROT_READ;
            }
            if w == 'w' {
                prot |= libc::PROT_WRITE;
            }
            if x == 'x' {
                prot |= libc::PROT_EXEC;
            }
            if s == 's' {
                flags |= libc::MAP_SHARED;
            } else {
                flags |= libc::MAP_PRIVATE;
            }
            (prot, flags)
        })
}

fn map_path<I>() -> impl Parser<Input = I, Output = Option<PathBuf>>
where
    I: Stream<Item = char>,
    I::Error: ParseError<I::Item, I::Range, I::Position>,
{
    (
        spaces(),
        optional(many1::<String, _>(none_of("\r\n".chars()))),
    )
        .map(|(_, p)| p.map(PathBuf::from))
}

fn vma_line<I>() -> impl Parser<Input = I, Output = VmaEntry>
where
    I: Stream<Item = char>,
    I::Error: ParseError<I::Item, I::Range, I::Position>,
{
    (
        hex_value(),
        char('-'),
        hex_value(),
        perms(),
        spaces(),
        hex_value(),
        device(),
        spaces(),
        dec_value(),
        map_path(),
    )
        .map(
            |(start, _, end, (prot, flags), _, offset, dev, _, inode, path)| VmaEntry {
                start,
                end,
                prot,
                flags,
                offset,
                dev,
                inode,
                path,
            },
        )
}

fn parse_vma_entry(line: &str) -> Result<VmaEntry> {
    match vma_line().easy_parse(line) {
        Ok((entry, _rest)) => Ok(entry),
        Err(err) => Err(Error::Patch(format!(
            "unparsable maps line {:?}: {}",
            line, err
        ))),
    }
}

/// Decode `/proc/<pid>/maps` of the target.
pub fn read_vm_areas(pid: Pid) -> Result<Vec<VmaEntry>> {
    let path = PathBuf::from("/proc").join(format!("{}", pid)).join("maps");
    let mut contents = String::new();
    File::open(path)?.read_to_string(&mut contents)?;
    contents.lines().map(parse_vma_entry).collect()
}

/// Scheduler state of a single task, as reported by `/proc/<tid>/status`.
/// Kernel 3.13+ state letters only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskRunState {
    Running,
    Sleeping,
    DiskSleep,
    Stopped,
    TraceStopped,
    Zombie,
    Dead,
}

pub fn task_run_state(tid: Pid) -> Result<TaskRunState> {
    let path = PathBuf::from("/proc")
        .join(format!("{}", tid))
        .join("status");
    let contents = std::fs::read_to_string(&path)?;
    contents
        .lines()
        .find(|l| l.starts_with("State:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|s| match s {
            "R" => Some(TaskRunState::Running),
            "S" => Some(TaskRunState::Sleeping),
            "D" => Some(TaskRunState::DiskSleep),
            "T" => Some(TaskRunState::Stopped),
            "t" => Some(TaskRunState::TraceStopped),
            "Z" => Some(TaskRunState::Zombie),
            "X" => Some(TaskRunState::Dead),
            _ => None,
        })
        .ok_or_else(|| Error::Patch(format!("could not read state from {:?}", path)))
}

/// Enumerate `/proc/<pid>/task/`: the ids of every task of the target at the
/// moment of the readdir, numerically sorted.
pub fn task_ids(pid: Pid) -> Result<Vec<Pid>> {
    let dir = PathBuf::from("/proc").join(format!("{}", pid)).join("task");
    let mut tids: Vec<libc::pid_t> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
            tids.push(tid);
        }
    }
    tids.sort();
    Ok(tids.into_iter().map(Pid::from_raw).collect())
}
