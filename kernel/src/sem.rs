//! Counting semaphores, integrated with the per-hart scheduler's
//! block/wake paths.
//!
//! The table is a fixed-size array shared by both harts, so it sits
//! behind a `Spinlock` rather than the unsynchronized global array a
//! single-threaded version could get away with. P's "go to sleep" path
//! is a blocking loop around the table rather than a one-shot check.

use crate::param::MAX_SEMAPHORE_NUM;
use crate::proc::{self, sched, Pid};
use crate::spinlock::Spinlock;

struct SemTable {
    lock: Spinlock,
    counts: [i32; MAX_SEMAPHORE_NUM],
    len: usize,
}

impl SemTable {
    #[cfg(test)]
    fn empty() -> Self {
        SemTable {
            lock: Spinlock::init_lock("sem-test"),
            counts: [0; MAX_SEMAPHORE_NUM],
            len: 0,
        }
    }

    fn new_sem(&mut self, initial: i32) -> Result<usize, SemaphoreTableFull> {
        if self.len >= MAX_SEMAPHORE_NUM {
            return Err(SemaphoreTableFull);
        }
        let index = self.len;
        self.counts[index] = initial;
        self.len += 1;
        Ok(index)
    }

    /// Decrements `index`'s count if it's positive and reports whether it
    /// did -- the non-blocking half of P, and the half V uses to decide
    /// whether a waiter can be woken.
    fn try_take(&mut self, index: usize) -> bool {
        if self.counts[index] >= 1 {
            self.counts[index] -= 1;
            true
        } else {
            false
        }
    }

    fn give(&mut self, index: usize) {
        self.counts[index] += 1;
    }
}

static SEMAPHORES: SemTableCell = SemTableCell::new();

struct SemTableCell {
    inner: core::cell::UnsafeCell<SemTable>,
}
unsafe impl Sync for SemTableCell {}

impl SemTableCell {
    const fn new() -> Self {
        SemTableCell {
            inner: core::cell::UnsafeCell::new(SemTable {
                lock: Spinlock::init_lock("sem"),
                counts: [0; MAX_SEMAPHORE_NUM],
                len: 0,
            }),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut SemTable) -> R) -> R {
        // SAFETY: the table's own spinlock serializes access; the cell
        // just gets us past `&self` into a `&mut` the lock already
        // protects.
        let table = unsafe { &mut *self.inner.get() };
        table.lock.acquire();
        let r = f(table);
        table.lock.release();
        r
    }
}

#[derive(Debug)]
pub struct SemaphoreTableFull;

/// Creates a new semaphore with the given initial count, returning its
/// index. Indices are never reused across the table's lifetime -- there
/// is no `sem_destroy`.
pub fn sem_new(initial: i32) -> Result<usize, SemaphoreTableFull> {
    SEMAPHORES.with(|t| t.new_sem(initial))
}

/// P(index): decrements if positive, otherwise blocks the calling
/// process on `hart` until a matching `V` wakes it.
pub fn p(hart: usize, index: usize) {
    loop {
        let acquired = SEMAPHORES.with(|t| t.try_take(index));

        if acquired {
            return;
        }

        let pid = proc::current_pid(hart).expect("sem::p: no current process");
        proc::pool(hart).with_state(|mut state| {
            state.procs[pid.0 as usize].sem_index = Some(index);
            sched::from_ready_to_blocked(&mut state, pid);
        });
        sched::schedule(hart);
        // schedule() never returns on this path (it hands control to
        // another process via a trap return); once this process is
        // rescheduled here, it resumes right after the `schedule()`
        // call above via the normal trap-return path and loops to
        // recheck the count -- see `trap::switch_to`.
    }
}

/// V(index): increments the count, then wakes every blocked process
/// across this hart's pool whose semaphore can now be satisfied. A full
/// blocked-queue scan rather than waking only one waiter, so starved
/// waiters on other semaphores aren't skipped over.
pub fn v(hart: usize, index: usize) {
    SEMAPHORES.with(|t| t.give(index));

    proc::pool(hart).with_state(|mut state| {
        let mut cur = *state.blocked_head;
        while let Some(pid) = cur {
            let next = state.procs[pid.0 as usize].queue_next;
            if let Some(sem) = state.procs[pid.0 as usize].sem_index {
                let woke = SEMAPHORES.with(|t| t.try_take(sem));
                if woke {
                    state.procs[pid.0 as usize].sem_index = None;
                    sched::from_blocked_to_ready(&mut state, pid);
                }
            }
            cur = next;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    // The real P/V operate on the single process-wide `SEMAPHORES` table,
    // which every test in this binary shares -- so these tests exercise
    // the same `SemTable` methods `p`/`v`/`sem_new` call, just on a
    // freshly-constructed table, to stay independent of test execution
    // order (matching the pattern `RamVfs::empty()` uses in `vfs.rs`).

    #[test]
    fn new_sem_starts_at_its_initial_count() {
        let mut t = SemTable::empty();
        let idx = t.new_sem(0).unwrap();
        assert_eq!(t.counts[idx], 0);
        assert!(!t.try_take(idx), "P on a zero count must not succeed");
    }

    #[test]
    fn give_then_take_does_not_block() {
        let mut t = SemTable::empty();
        let idx = t.new_sem(0).unwrap();
        t.give(idx); // V
        assert!(t.try_take(idx), "P must succeed once V has posted");
        assert_eq!(t.counts[idx], 0);
        assert!(!t.try_take(idx), "second P with no matching V must not succeed");
    }

    #[test]
    fn table_full_is_reported() {
        let mut t = SemTable::empty();
        for _ in 0..MAX_SEMAPHORE_NUM {
            assert!(t.new_sem(1).is_ok());
        }
        assert!(matches!(t.new_sem(1), Err(SemaphoreTableFull)));
    }
}
