//! Seize-loop convergence against targets that spawn and lose threads.

mod common;

use nix::unistd::Pid;

use common::{Ruling, ScriptedOps, SimTarget};
use livepatch::errors::Error;
use livepatch::process::ProcessCtx;

fn ctx_for(sim: SimTarget) -> ProcessCtx<SimTarget> {
    ProcessCtx::new(Pid::from_raw(1), sim)
}

#[test]
fn five_thread_target_is_fully_seized_before_inspection() {
    let sim = SimTarget::new(&[1, 2, 3, 4, 5]);
    let state = sim.state();
    let mut ctx = ctx_for(sim);
    let ops = ScriptedOps::clear();

    ctx.suspend(&ops).unwrap();

    assert_eq!(ctx.threads().len(), 5);
    assert!(ctx.threads().iter().all(|t| t.seized));
    {
        let st = state.borrow();
        // every unwind happened after all five stops
        assert_eq!(st.stops_at_unwind.len(), 5);
        assert!(st.stops_at_unwind.iter().all(|n| *n == 5));
    }

    ctx.cure_threads().unwrap();
    let st = state.borrow();
    assert_eq!(st.total_stops(), 5);
    assert_eq!(st.total_resumes(), 5);
}

#[test]
fn thread_spawned_between_rounds_forces_another_pass() {
    let sim = SimTarget::new(&[10, 11]);
    let state = sim.state();
    state.borrow_mut().spawn_at_round.push((2, 12));
    let mut ctx = ctx_for(sim);
    let ops = ScriptedOps::clear();

    ctx.suspend(&ops).unwrap();

    assert_eq!(ctx.threads().len(), 3);
    assert!(ctx.threads().iter().all(|t| t.seized));
    // round 1 saw the original pair, round 2 the newcomer, round 3 was quiet
    assert_eq!(state.borrow().rounds, 3);

    ctx.cure_threads().unwrap();
    let st = state.borrow();
    assert_eq!(st.total_stops(), 3);
    assert_eq!(st.total_resumes(), 3);
}

#[test]
fn final_thread_set_matches_the_task_listing() {
    let sim = SimTarget::new(&[20, 21, 22]);
    let state = sim.state();
    state.borrow_mut().spawn_at_round.push((2, 23));
    state.borrow_mut().spawn_at_round.push((3, 24));
    let mut ctx = ctx_for(sim);
    let ops = ScriptedOps::clear();

    ctx.suspend(&ops).unwrap();

    let seized: Vec<i32> = ctx.threads().iter().map(|t| t.tid.as_raw()).collect();
    let mut listed = state.borrow().live.clone();
    let mut sorted = seized.clone();
    sorted.sort();
    listed.sort();
    assert_eq!(sorted, listed);
    assert!(ctx.threads().iter().all(|t| t.seized));

    ctx.cure_threads().unwrap();
}

#[test]
fn vanished_thread_is_dropped_silently() {
    let sim = SimTarget::new(&[30, 31]);
    let state = sim.state();
    state.borrow_mut().vanish_on_stop.push(31);
    let mut ctx = ctx_for(sim);
    let ops = ScriptedOps::clear();

    ctx.suspend(&ops).unwrap();

    assert_eq!(ctx.threads().len(), 1);
    assert_eq!(ctx.threads().get(0).tid.as_raw(), 30);

    ctx.cure_threads().unwrap();
    let st = state.borrow();
    assert_eq!(st.total_stops(), 1);
    assert_eq!(st.total_resumes(), 1);
}

#[test]
fn losing_the_only_thread_reports_no_threads() {
    let sim = SimTarget::new(&[40]);
    let state = sim.state();
    state.borrow_mut().vanish_on_stop.push(40);
    let mut ctx = ctx_for(sim);
    let ops = ScriptedOps::clear();

    match ctx.suspend(&ops) {
        Err(Error::NoThreads(_)) => (),
        other => panic!("expected NoThreads, got {:?}", other.map(|_| ())),
    }

    let st = state.borrow();
    assert_eq!(st.total_stops(), 0);
    assert_eq!(st.total_resumes(), 0);
}

#[test]
fn foreign_tracer_aborts_without_stranding_threads() {
    let sim = SimTarget::new(&[50, 51]);
    let state = sim.state();
    state.borrow_mut().foreign.push(51);
    let mut ctx = ctx_for(sim);
    let ops = ScriptedOps::always(Ruling::Clear);

    match ctx.suspend(&ops) {
        Err(Error::Busy(tid)) => assert_eq!(tid.as_raw(), 51),
        other => panic!("expected Busy, got {:?}", other.map(|_| ())),
    }

    let st = state.borrow();
    assert_eq!(st.total_stops(), 1);
    assert_eq!(st.total_resumes(), 1);
    assert!(ctx.threads().is_empty());
}
