//! Process descriptors and the per-hart process pool.
//!
//! The process descriptor's segment bookkeeping (`mapped_info`) and its
//! two heap directories (`page_dir`/`malloc_dir`) mirror a `process_t`
//! with one deliberate structural change: rather than lifetime-tagged
//! references into a process's own page table, this pool is a plain
//! arena of `Proc` values indexed by a stable `Pid(u8)`. Page
//! tables/trapframes/mapped-info pages are addressed by their physical
//! address, which doubles as a kernel virtual address since the kernel
//! direct-maps all of physical memory (see `vm::kvmmake`). `DESIGN.md`
//! records the reasoning.

pub mod heap;
pub mod lifecycle;
pub mod sched;

use crate::param::{MAX_HEAP_PAGES, MAX_MALLOC_IN_HEAP, NCPU, NPROC};
use crate::riscv::PGSIZE;
use crate::spinlock::Spinlock;
use crate::vfs::MAX_OPEN_FDS;

/// Identifies a process within its owning hart's pool. Stable for the
/// process's whole lifetime, including while `ZOMBIE` -- unlike a raw
/// pointer, it never dangles and is `Copy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pid(pub u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Free,
    Ready,
    Running,
    Blocked,
    Zombie,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentType {
    Stack,
    Context,
    System,
    Heap,
    Code,
    Data,
}

pub const MAX_MAPPED_REGIONS: usize = 16;

// Fixed slots every process's `mapped_info` starts with, in allocation
// order; CODE/DATA segments from the loaded ELF image are appended after
// these four, growing `total_mapped_region`.
pub const STACK_SEGMENT_INDEX: usize = 0;
pub const CONTEXT_SEGMENT_INDEX: usize = 1;
pub const SYSTEM_SEGMENT_INDEX: usize = 2;
pub const HEAP_SEGMENT_INDEX: usize = 3;

#[derive(Debug, Clone, Copy)]
pub struct MappedRegion {
    pub va: usize,
    pub npages: u32,
    pub seg_type: SegmentType,
}

impl MappedRegion {
    const fn empty() -> Self {
        MappedRegion {
            va: 0,
            npages: 0,
            seg_type: SegmentType::Stack,
        }
    }
}

/// Saved user-mode register file plus the bookkeeping the trap entry
/// path needs to get back into the kernel. Field order mirrors
/// `trapframe_t` in `process.h` (registers, then the `kernel_*`
/// bookkeeping fields the source keeps in the same struct).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TrapFrame {
    pub ra: u64,
    pub sp: u64,
    pub gp: u64,
    pub tp: u64,
    pub t0: u64,
    pub t1: u64,
    pub t2: u64,
    pub s0: u64,
    pub s1: u64,
    pub a0: u64,
    pub a1: u64,
    pub a2: u64,
    pub a3: u64,
    pub a4: u64,
    pub a5: u64,
    pub a6: u64,
    pub a7: u64,
    pub s2: u64,
    pub s3: u64,
    pub s4: u64,
    pub s5: u64,
    pub s6: u64,
    pub s7: u64,
    pub s8: u64,
    pub s9: u64,
    pub s10: u64,
    pub s11: u64,
    pub t3: u64,
    pub t4: u64,
    pub t5: u64,
    pub t6: u64,

    pub kernel_sp: u64,
    pub kernel_trap: u64,
    pub epc: u64,
    pub kernel_satp: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct PageDentry {
    pub va_page: usize,
    pub pa_page: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct MallocDentry {
    pub va_start: usize,
    pub va_end: usize,
}

/// Bump-style heap manager for the page-granular "naive" allocator.
/// Separate from the byte-granular directories below; a process uses
/// one style or the other (see `proc::heap`).
#[derive(Debug, Clone, Copy)]
pub struct NaiveHeap {
    pub heap_top: usize,
    pub heap_bottom: usize,
    pub free_pages: [usize; MAX_HEAP_PAGES],
    pub free_pages_count: usize,
}

impl NaiveHeap {
    const fn empty() -> Self {
        NaiveHeap {
            heap_top: 0,
            heap_bottom: 0,
            free_pages: [0; MAX_HEAP_PAGES],
            free_pages_count: 0,
        }
    }
}

#[derive(Clone, Copy)]
pub struct Proc {
    pub kstack: usize,
    pub pagetable: usize, // physical/kernel-VA of the root page table, 0 if unset
    pub trapframe: usize, // physical/kernel-VA of this process's TrapFrame page

    pub mapped_info: [MappedRegion; MAX_MAPPED_REGIONS],
    pub total_mapped_region: usize,

    pub user_heap: NaiveHeap,

    pub pid: Pid,
    pub status: ProcState,
    pub parent: Option<Pid>,
    pub queue_next: Option<Pid>,

    pub tick_count: u32,

    pub waiting_pid: Option<Pid>,

    pub page_dir: [PageDentry; MAX_HEAP_PAGES],
    pub num_page: usize,
    pub malloc_dir: [MallocDentry; MAX_MALLOC_IN_HEAP],
    pub num_malloc: usize,
    /// Next free virtual address the better-malloc allocator will map a
    /// fresh page at; resets to `USER_FREE_ADDRESS_START` whenever
    /// `proc::heap::clear_page_dir` runs.
    pub better_heap_next_va: usize,

    pub sem_index: Option<usize>,

    /// Which `RamVfs` descriptor slots this process currently owns --
    /// the file table itself is one flat global array (see `vfs.rs`), so
    /// this is the only thing stopping one process from guessing another
    /// process's fd number and operating on its open file.
    owned_fds: [bool; MAX_OPEN_FDS],
}

impl Proc {
    const fn empty(pid: Pid) -> Self {
        Proc {
            kstack: 0,
            pagetable: 0,
            trapframe: 0,
            mapped_info: [MappedRegion::empty(); MAX_MAPPED_REGIONS],
            total_mapped_region: 0,
            user_heap: NaiveHeap::empty(),
            pid,
            status: ProcState::Free,
            parent: None,
            queue_next: None,
            tick_count: 0,
            waiting_pid: None,
            page_dir: [PageDentry {
                va_page: 0,
                pa_page: 0,
            }; MAX_HEAP_PAGES],
            num_page: 0,
            malloc_dir: [MallocDentry {
                va_start: 0,
                va_end: 0,
            }; MAX_MALLOC_IN_HEAP],
            num_malloc: 0,
            better_heap_next_va: 0,
            sem_index: None,
            owned_fds: [false; MAX_OPEN_FDS],
        }
    }

    pub fn pagetable(&self) -> &'static mut crate::riscv::PageTable {
        assert_ne!(self.pagetable, 0, "proc has no page table");
        unsafe { &mut *(self.pagetable as *mut crate::riscv::PageTable) }
    }

    pub fn trapframe(&self) -> &'static mut TrapFrame {
        assert_ne!(self.trapframe, 0, "proc has no trapframe");
        unsafe { &mut *(self.trapframe as *mut TrapFrame) }
    }

    pub fn killed(&self) -> bool {
        matches!(self.status, ProcState::Zombie)
    }

    /// Records that this process holds `fd`. Called once a VFS open
    /// succeeds, before the fd number is handed back to user code.
    pub fn claim_fd(&mut self, fd: usize) {
        if fd < MAX_OPEN_FDS {
            self.owned_fds[fd] = true;
        }
    }

    /// Whether this process is allowed to operate on `fd`.
    pub fn owns_fd(&self, fd: usize) -> bool {
        fd < MAX_OPEN_FDS && self.owned_fds[fd]
    }

    /// Drops ownership of `fd`, called alongside closing it.
    pub fn release_fd(&mut self, fd: usize) {
        if fd < MAX_OPEN_FDS {
            self.owned_fds[fd] = false;
        }
    }
}

/// One hart's process pool plus the lock guarding it. Each hart only
/// ever touches its own pool (no process migration between harts), but
/// the lock still matters: a timer interrupt on this hart can preempt
/// kernel code that's mid-mutation of the pool.
pub struct ProcPool {
    lock: Spinlock,
    procs: [Proc; NPROC],
    /// Head of the intrusive ready-queue singly linked through
    /// `Proc::queue_next`, oldest-runnable-first.
    ready_head: Option<Pid>,
    /// Head of the intrusive blocked-queue, same linkage.
    blocked_head: Option<Pid>,
}

/// Everything `proc::sched` needs in one borrow: the process table plus
/// both queue heads, all under the same lock.
pub struct PoolState<'a> {
    pub procs: &'a mut [Proc; NPROC],
    pub ready_head: &'a mut Option<Pid>,
    pub blocked_head: &'a mut Option<Pid>,
}

impl ProcPool {
    const fn empty() -> Self {
        // NPROC Procs, each remembering its own index as `pid`.
        let mut procs = [Proc::empty(Pid(0)); NPROC];
        let mut i = 0;
        while i < NPROC {
            procs[i].pid = Pid(i as u8);
            i += 1;
        }
        ProcPool {
            lock: Spinlock::init_lock("proc_pool"),
            procs,
            ready_head: None,
            blocked_head: None,
        }
    }

    pub fn with_lock<R>(&self, f: impl FnOnce(&mut [Proc; NPROC]) -> R) -> R {
        self.lock.acquire();
        // SAFETY: the pool's spinlock is held for the duration of `f`,
        // and only the owning hart ever calls into this pool.
        let procs = unsafe { &mut *(&self.procs as *const [Proc; NPROC] as *mut [Proc; NPROC]) };
        let result = f(procs);
        self.lock.release();
        result
    }

    /// Like `with_lock`, but also hands the caller the queue heads --
    /// what the scheduler and semaphore wake paths need.
    pub fn with_state<R>(&self, f: impl FnOnce(PoolState<'_>) -> R) -> R {
        self.lock.acquire();
        let this = unsafe {
            &mut *(self as *const ProcPool as *mut ProcPool)
        };
        let result = f(PoolState {
            procs: &mut this.procs,
            ready_head: &mut this.ready_head,
            blocked_head: &mut this.blocked_head,
        });
        self.lock.release();
        result
    }
}

unsafe impl Sync for ProcPool {}

static POOLS: [ProcPool; NCPU] = [const { ProcPool::empty() }; NCPU];

pub fn pool(hart: usize) -> &'static ProcPool {
    &POOLS[hart]
}

pub fn my_pool() -> &'static ProcPool {
    pool(crate::riscv::r_tp())
}

pub fn init_proc_pool(hart: usize) {
    POOLS[hart].with_lock(|procs| {
        for (i, p) in procs.iter_mut().enumerate() {
            *p = Proc::empty(Pid(i as u8));
        }
    });
}

/// Currently-running process on each hart. `None` before the first
/// `schedule()` call, or transiently while the hart is between
/// processes.
static CURRENT: [core::sync::atomic::AtomicU8; NCPU] =
    [const { core::sync::atomic::AtomicU8::new(NO_PID) }; NCPU];
const NO_PID: u8 = u8::MAX;

pub fn set_current(hart: usize, pid: Option<Pid>) {
    CURRENT[hart].store(pid.map(|p| p.0).unwrap_or(NO_PID), core::sync::atomic::Ordering::Relaxed);
}

pub fn current_pid(hart: usize) -> Option<Pid> {
    let raw = CURRENT[hart].load(core::sync::atomic::Ordering::Relaxed);
    if raw == NO_PID {
        None
    } else {
        Some(Pid(raw))
    }
}

pub fn my_pid() -> Option<Pid> {
    current_pid(crate::riscv::r_tp())
}

/// Allocates an unused page for a process's kernel stack and maps it (plus
/// a preceding guard page) beneath the trampoline region of the kernel
/// page table, for every slot in every hart's pool. Called once at boot
/// from `vm::kvmmake`.
pub fn map_kernel_stacks(kpgtbl: &mut crate::riscv::PageTable) {
    for hart in 0..NCPU {
        for i in 0..NPROC {
            let pa = crate::pmm::PMM.alloc_page().expect("map_kernel_stacks: out of memory");
            let va = crate::KSTACK!(hart * NPROC + i);
            crate::vm::mappages(
                kpgtbl,
                va,
                pa,
                PGSIZE,
                crate::riscv::prot_to_type(
                    crate::riscv::PROT_READ | crate::riscv::PROT_WRITE,
                    false,
                ),
            )
            .expect("map_kernel_stacks: mappages");
        }
    }
}

pub fn either_copyout(pagetable: &mut crate::riscv::PageTable, is_user_dst: bool, dst: usize, src: &[u8]) -> bool {
    if is_user_dst {
        crate::vm::copyout(pagetable, dst, src)
    } else {
        crate::string::memcpy(dst as *mut u8, src.as_ptr(), src.len());
        true
    }
}

pub fn either_copyin(dst: &mut [u8], is_user_src: bool, pagetable: &mut crate::riscv::PageTable, src: usize) -> bool {
    if is_user_src {
        crate::vm::copyin(pagetable, dst, src)
    } else {
        crate::string::memcpy(dst.as_mut_ptr(), src as *const u8, dst.len());
        true
    }
}
