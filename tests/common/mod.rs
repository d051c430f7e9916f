#![allow(dead_code)]

//! A scripted, in-memory stand-in for the ptrace engine.  Tests drive the
//! real process-control core against it and read the counters afterwards.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use libc::c_long;
use nix::errno::{self, Errno};
use nix::unistd::Pid;

use livepatch::debugger::{Debugger, TaskState};
use livepatch::errors::{Error, Result};
use livepatch::patch::PatchOps;
use livepatch::proc::VmaEntry;
use livepatch::process::ProcessCtx;
use livepatch::stack::{Backtrace, Frame, StackVerdict};

/// Where the simulated kernel places the first remote mapping.
pub const FIRST_MAP_ADDR: u64 = 0x7000_0000;

#[derive(Default)]
pub struct SimState {
    /// Tids currently listed in the simulated task directory.
    pub live: Vec<i32>,
    /// (enumeration round, tid): the tid appears starting with that round.
    pub spawn_at_round: Vec<(u32, i32)>,
    pub rounds: u32,

    pub stops: HashMap<i32, u32>,
    pub resumes: HashMap<i32, u32>,
    /// Tids already held by a foreign tracer.
    pub foreign: Vec<i32>,
    /// Tids that exit between enumeration and the stop request.
    pub vanish_on_stop: Vec<i32>,

    /// Scripted per-thread instruction pointers for the unwinder.
    pub frames: HashMap<i32, Vec<u64>>,
    /// Total stop count recorded at each unwind, to prove seizing precedes
    /// inspection.
    pub stops_at_unwind: Vec<u32>,

    /// Sparse target memory.
    pub mem: HashMap<u64, u8>,
    pub writes: Vec<(u64, Vec<u8>)>,

    pub mmaps: u32,
    pub munmaps: u32,
    pub opens: u32,
    pub closes: u32,
    pub prepares: u32,
    pub cures: u32,
    pub prepare_fail: bool,
    pub mmap_fail: bool,
    next_map: u64,

    pub sleeps: Vec<Duration>,
}

impl SimState {
    pub fn total_stops(&self) -> u32 {
        self.stops.values().sum()
    }

    pub fn total_resumes(&self) -> u32 {
        self.resumes.values().sum()
    }

    pub fn read_mem(&self, addr: u64, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| self.mem.get(&(addr + i as u64)).copied().unwrap_or(0))
            .collect()
    }

    pub fn seed_mem(&mut self, addr: u64, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            self.mem.insert(addr + i as u64, *b);
        }
    }
}

pub struct SimTarget {
    state: Rc<RefCell<SimState>>,
}

impl SimTarget {
    pub fn new(tids: &[i32]) -> Self {
        let mut state = SimState::default();
        state.live = tids.to_vec();
        state.next_map = FIRST_MAP_ADDR;
        SimTarget {
            state: Rc::new(RefCell::new(state)),
        }
    }

    pub fn state(&self) -> Rc<RefCell<SimState>> {
        self.state.clone()
    }
}

impl Debugger for SimTarget {
    type Handle = ();

    fn tasks(&mut self, _pid: Pid) -> Result<Vec<Pid>> {
        let mut st = self.state.borrow_mut();
        st.rounds += 1;
        let round = st.rounds;
        let due: Vec<i32> = st
            .spawn_at_round
            .iter()
            .filter(|(r, _)| *r <= round)
            .map(|(_, tid)| *tid)
            .collect();
        st.spawn_at_round.retain(|(r, _)| *r > round);
        for tid in due {
            if !st.live.contains(&tid) {
                st.live.push(tid);
            }
        }
        Ok(st.live.iter().map(|t| Pid::from_raw(*t)).collect())
    }

    fn vm_areas(&mut self, _pid: Pid) -> Result<Vec<VmaEntry>> {
        Ok(Vec::new())
    }

    fn stop(&mut self, tid: Pid) -> Result<TaskState> {
        let mut st = self.state.borrow_mut();
        let raw = tid.as_raw();
        if let Some(pos) = st.vanish_on_stop.iter().position(|t| *t == raw) {
            st.vanish_on_stop.remove(pos);
            st.live.retain(|t| *t != raw);
            return Ok(TaskState::Vanished);
        }
        if st.foreign.contains(&raw) {
            return Ok(TaskState::Stopped);
        }
        if !st.live.contains(&raw) {
            return Ok(TaskState::Vanished);
        }
        *st.stops.entry(raw).or_insert(0) += 1;
        Ok(TaskState::Alive)
    }

    fn resume(&mut self, tid: Pid) -> Result<()> {
        let mut st = self.state.borrow_mut();
        *st.resumes.entry(tid.as_raw()).or_insert(0) += 1;
        Ok(())
    }

    fn read(&mut self, _tid: Pid, addr: u64, buf: &mut [u8]) -> Result<()> {
        let st = self.state.borrow();
        for (i, slot) in buf.iter_mut().enumerate() {
            *slot = st.mem.get(&(addr + i as u64)).copied().unwrap_or(0);
        }
        Ok(())
    }

    fn write(&mut self, _tid: Pid, addr: u64, data: &[u8]) -> Result<()> {
        let mut st = self.state.borrow_mut();
        st.writes.push((addr, data.to_vec()));
        for (i, b) in data.iter().enumerate() {
            st.mem.insert(addr + i as u64, *b);
        }
        Ok(())
    }

    fn prepare(&mut self, _pid: Pid) -> Result<()> {
        let mut st = self.state.borrow_mut();
        if st.prepare_fail {
            return Err(Error::Os(Errno::EPERM));
        }
        st.prepares += 1;
        Ok(())
    }

    fn cure(&mut self, _handle: ()) -> Result<()> {
        self.state.borrow_mut().cures += 1;
        Ok(())
    }

    fn inject_syscall(&mut self, _handle: &mut (), nr: c_long, args: [u64; 6]) -> Result<i64> {
        let mut st = self.state.borrow_mut();
        if nr == libc::SYS_mmap {
            if st.mmap_fail {
                return Ok(-(libc::ENOMEM as i64));
            }
            st.mmaps += 1;
            let base = st.next_map;
            st.next_map += (args[1] + 0xfff) & !0xfff;
            Ok(base as i64)
        } else if nr == libc::SYS_munmap {
            st.munmaps += 1;
            Ok(0)
        } else if nr == libc::SYS_open {
            st.opens += 1;
            Ok(3)
        } else if nr == libc::SYS_close {
            st.closes += 1;
            Ok(0)
        } else {
            Ok(0)
        }
    }

    fn backtrace_of(&mut self, tid: Pid) -> Result<Backtrace> {
        let mut st = self.state.borrow_mut();
        let total = st.total_stops();
        st.stops_at_unwind.push(total);
        let frames = st
            .frames
            .get(&tid.as_raw())
            .map(|ips| {
                ips.iter()
                    .map(|ip| Frame { ip: *ip, sp: 0x7ffd_0000 })
                    .collect()
            })
            .unwrap_or_else(|| {
                vec![Frame {
                    ip: 0x1000,
                    sp: 0x7ffd_0000,
                }]
            });
        Ok(Backtrace::new(frames))
    }

    fn snooze(&mut self, duration: Duration) {
        self.state.borrow_mut().sleeps.push(duration);
    }
}

/// How one `check_backtrace` call should come out.
#[derive(Clone, Copy, Debug)]
pub enum Ruling {
    Clear,
    Displaced,
    Fail(i32),
}

/// Patch ops whose stack judgement follows a script; `apply` and `revert`
/// only count invocations.
pub struct ScriptedOps {
    script: RefCell<VecDeque<Ruling>>,
    fallback: Ruling,
    pub checks: Cell<u32>,
    pub applies: Cell<u32>,
    pub reverts: Cell<u32>,
}

impl ScriptedOps {
    pub fn always(ruling: Ruling) -> Self {
        ScriptedOps {
            script: RefCell::new(VecDeque::new()),
            fallback: ruling,
            checks: Cell::new(0),
            applies: Cell::new(0),
            reverts: Cell::new(0),
        }
    }

    pub fn clear() -> Self {
        ScriptedOps::always(Ruling::Clear)
    }

    pub fn sequence(rulings: &[Ruling], fallback: Ruling) -> Self {
        ScriptedOps {
            script: RefCell::new(rulings.iter().copied().collect()),
            fallback,
            checks: Cell::new(0),
            applies: Cell::new(0),
            reverts: Cell::new(0),
        }
    }
}

impl PatchOps for ScriptedOps {
    fn apply<D: Debugger>(&mut self, _ctx: &mut ProcessCtx<D>) -> Result<()> {
        self.applies.set(self.applies.get() + 1);
        Ok(())
    }

    fn check_backtrace(
        &self,
        _tid: Pid,
        _bt: &Backtrace,
        _vmas: &[VmaEntry],
    ) -> Result<StackVerdict> {
        self.checks.set(self.checks.get() + 1);
        let ruling = self
            .script
            .borrow_mut()
            .pop_front()
            .unwrap_or(self.fallback);
        match ruling {
            Ruling::Clear => Ok(StackVerdict::Clear),
            Ruling::Displaced => Ok(StackVerdict::Displaced),
            Ruling::Fail(e) => Err(Error::Os(errno::from_i32(e))),
        }
    }

    fn revert<D: Debugger>(&mut self, _ctx: &mut ProcessCtx<D>) -> Result<()> {
        self.reverts.set(self.reverts.get() + 1);
        Ok(())
    }
}
