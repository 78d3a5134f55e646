//! Per-hart round-robin scheduler: intrusive ready/blocked queues plus
//! the tick-driven preemption check and the shutdown-vs-panic decision
//! when a hart runs dry of ready work.
//!
//! Queue insert/remove, the ready<->blocked transitions, and
//! `schedule()`'s zombie-wait-wakeup scan and shutdown rule are linked
//! through the pool's `queue_next` field rather than raw pointers.

use crate::param::{NPROC, TIME_SLICE_LEN};
use crate::proc::{self, Pid, PoolState, Proc, ProcState};

/// Appends `pid` to the ready queue and marks it `Ready`, unless it's
/// already queued.
pub fn insert_to_ready_queue(state: &mut PoolState<'_>, pid: Pid) {
    if already_queued(state.procs, *state.ready_head, pid) {
        return;
    }
    state.procs[pid.0 as usize].status = ProcState::Ready;
    state.procs[pid.0 as usize].queue_next = None;
    append(state.procs, state.ready_head, pid);
}

pub fn insert_to_blocked_queue(state: &mut PoolState<'_>, pid: Pid) {
    if already_queued(state.procs, *state.blocked_head, pid) {
        return;
    }
    state.procs[pid.0 as usize].status = ProcState::Blocked;
    state.procs[pid.0 as usize].queue_next = None;
    append(state.procs, state.blocked_head, pid);
}

pub fn remove_from_ready_queue(state: &mut PoolState<'_>, pid: Pid) {
    remove(state.procs, state.ready_head, pid);
}

pub fn remove_from_blocked_queue(state: &mut PoolState<'_>, pid: Pid) {
    remove(state.procs, state.blocked_head, pid);
}

pub fn from_ready_to_blocked(state: &mut PoolState<'_>, pid: Pid) {
    remove_from_ready_queue(state, pid);
    insert_to_blocked_queue(state, pid);
}

pub fn from_blocked_to_ready(state: &mut PoolState<'_>, pid: Pid) {
    remove_from_blocked_queue(state, pid);
    insert_to_ready_queue(state, pid);
}

fn already_queued(procs: &[Proc; NPROC], head: Option<Pid>, pid: Pid) -> bool {
    let mut cur = head;
    while let Some(p) = cur {
        if p == pid {
            return true;
        }
        cur = procs[p.0 as usize].queue_next;
    }
    false
}

fn append(procs: &mut [Proc; NPROC], head: &mut Option<Pid>, pid: Pid) {
    match head {
        None => *head = Some(pid),
        Some(h) => {
            let mut cur = *h;
            loop {
                let next = procs[cur.0 as usize].queue_next;
                match next {
                    Some(n) => cur = n,
                    None => break,
                }
            }
            procs[cur.0 as usize].queue_next = Some(pid);
        }
    }
}

fn remove(procs: &mut [Proc; NPROC], head: &mut Option<Pid>, pid: Pid) {
    let Some(h) = *head else { return };
    if h == pid {
        *head = procs[pid.0 as usize].queue_next;
        procs[pid.0 as usize].queue_next = None;
        return;
    }
    let mut cur = h;
    loop {
        let next = procs[cur.0 as usize].queue_next;
        match next {
            Some(n) if n == pid => {
                procs[cur.0 as usize].queue_next = procs[pid.0 as usize].queue_next;
                procs[pid.0 as usize].queue_next = None;
                return;
            }
            Some(n) => cur = n,
            None => return,
        }
    }
}

/// Scans the blocked queue for processes whose awaited child has gone
/// `Zombie` and wakes them, then either resumes the head of the ready
/// queue or, if nothing is runnable and every process is `Free`/`Zombie`,
/// shuts the hart down. A ready-empty pool with anything else alive is
/// a scheduling bug, not a valid idle state, and panics -- this kernel
/// has no idle loop.
pub fn schedule(hart: usize) -> ! {
    let next = proc::pool(hart).with_state(|mut state| {
        wake_waiters_on_zombie_children(&mut state);

        if state.ready_head.is_none() {
            if all_free_or_zombie(state.procs) {
                return None;
            }
            panic!(
                "schedule: hart {} has no ready process but some are still alive",
                hart
            );
        }

        let pid = state.ready_head.unwrap();
        assert_eq!(state.procs[pid.0 as usize].status, ProcState::Ready);
        *state.ready_head = state.procs[pid.0 as usize].queue_next;
        state.procs[pid.0 as usize].queue_next = None;
        state.procs[pid.0 as usize].status = ProcState::Running;
        Some(pid)
    });

    match next {
        Some(pid) => {
            proc::set_current(hart, Some(pid));
            crate::trap::switch_to(hart, pid)
        }
        None => crate::sbi_shutdown(),
    }
}

/// Wakes any `wait`-blocked process whose awaited child has gone
/// `Zombie`: clears `waiting_pid` and moves it back to ready. Zombies
/// are not freed here -- the child stays `Zombie` until the waiter
/// reaps it itself. Rewinding `epc` back onto the `ecall` instruction
/// makes the resumed process re-enter the `wait` syscall from scratch,
/// so `resolve_wait` does the actual reaping through its normal
/// already-zombie branch instead of this scan reaping it directly.
fn wake_waiters_on_zombie_children(state: &mut PoolState<'_>) {
    let mut cur = *state.blocked_head;
    while let Some(pid) = cur {
        let next = state.procs[pid.0 as usize].queue_next;
        if let Some(waited) = state.procs[pid.0 as usize].waiting_pid {
            if state.procs[waited.0 as usize].status == ProcState::Zombie {
                state.procs[pid.0 as usize].waiting_pid = None;
                state.procs[pid.0 as usize].trapframe().epc -= 4;
                from_blocked_to_ready(state, pid);
            }
        }
        cur = next;
    }
}

fn all_free_or_zombie(procs: &[Proc; NPROC]) -> bool {
    procs
        .iter()
        .all(|p| matches!(p.status, ProcState::Free | ProcState::Zombie))
}

/// Called on every timer interrupt for the process currently running on
/// `hart`: if its slice (`TIME_SLICE_LEN` ticks) is used up, requeue it
/// and pick the next ready process; otherwise just count the tick and
/// return to it.
pub fn tick(hart: usize) -> ! {
    let requeue = proc::pool(hart).with_state(|mut state| {
        let pid = proc::current_pid(hart).expect("tick: no current process");
        let p = &mut state.procs[pid.0 as usize];
        p.tick_count += 1;
        if p.tick_count >= TIME_SLICE_LEN {
            p.tick_count = 0;
            insert_to_ready_queue(&mut state, pid);
            true
        } else {
            false
        }
    });

    if requeue {
        schedule(hart)
    } else {
        crate::trap::switch_to(hart, proc::current_pid(hart).unwrap())
    }
}
