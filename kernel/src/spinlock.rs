//! Mutual exclusion for short critical sections shared between the two
//! harts: the page-table freelist, the per-hart ready/blocked queues, the
//! semaphore table, the console sink.
//!
//! Built on `core::sync::atomic` rather than hand-rolled `amoswap`
//! wrappers, and tracks the holding hart by id rather than a pointer to
//! a per-hart struct -- there's no such struct in this design; see
//! `DESIGN.md`.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::riscv::{intr_get, intr_off, intr_on, r_tp};

const NO_HOLDER: usize = usize::MAX;

pub struct Spinlock {
    locked: AtomicBool,
    name: &'static str,
    holder: AtomicUsize,
}

impl Spinlock {
    pub const fn init_lock(name: &'static str) -> Self {
        Spinlock {
            locked: AtomicBool::new(false),
            name,
            holder: AtomicUsize::new(NO_HOLDER),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Spins until the lock is acquired. Disables interrupts first so a
    /// timer interrupt on this hart can't reenter the critical section.
    pub fn acquire(&self) {
        push_off();
        if self.holding() {
            panic!("acquire: {} already held by this hart", self.name);
        }
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        self.holder.store(r_tp(), Ordering::Relaxed);
    }

    pub fn release(&self) {
        if !self.holding() {
            panic!("release: {} not held by this hart", self.name);
        }
        self.holder.store(NO_HOLDER, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        pop_off();
    }

    /// True iff the calling hart holds this lock. Interrupts must be off.
    fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) && self.holder.load(Ordering::Relaxed) == r_tp()
    }
}

/// Per-hart count of nested `push_off` calls, and whether interrupts were
/// enabled before the first one. Indexed by hart id (`r_tp()`).
static PUSH_OFF_DEPTH: [AtomicUsize; crate::param::NCPU] =
    [const { AtomicUsize::new(0) }; crate::param::NCPU];
static INTENA_BEFORE: [AtomicBool; crate::param::NCPU] =
    [const { AtomicBool::new(false) }; crate::param::NCPU];

/// Like `intr_off()`/`intr_on()`, except nestable: it takes as many
/// `pop_off()`s to restore interrupts as there were `push_off()`s, and if
/// interrupts were already off, they stay off.
pub fn push_off() {
    let was_enabled = intr_get();
    intr_off();
    let hart = r_tp();
    if PUSH_OFF_DEPTH[hart].load(Ordering::Relaxed) == 0 {
        INTENA_BEFORE[hart].store(was_enabled, Ordering::Relaxed);
    }
    PUSH_OFF_DEPTH[hart].fetch_add(1, Ordering::Relaxed);
}

pub fn pop_off() {
    let hart = r_tp();
    if intr_get() {
        panic!("pop_off: interruptible");
    }
    let depth = PUSH_OFF_DEPTH[hart].load(Ordering::Relaxed);
    if depth == 0 {
        panic!("pop_off: unbalanced");
    }
    let depth = depth - 1;
    PUSH_OFF_DEPTH[hart].store(depth, Ordering::Relaxed);
    if depth == 0 && INTENA_BEFORE[hart].load(Ordering::Relaxed) {
        intr_on();
    }
}
