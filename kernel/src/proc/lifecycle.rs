//! Process creation, fork, exec, wait, and teardown.
//!
//! Every fresh process gets the same four fixed segments before anything
//! else happens to it: a one-page stack, its trapframe mapped at the
//! shared `TRAPFRAME` virtual address, the trampoline mapped at
//! `TRAMPOLINE`, and an empty heap. `CODE`/`DATA` segments are appended
//! by `elf::load` during `exec`.

use crate::elf;
use crate::error::KernelError;
use crate::memlayout::{TRAMPOLINE, TRAPFRAME, USER_FREE_ADDRESS_START, USER_STACK_TOP};
use crate::param::{MAX_HEAP_PAGES, NPROC};
use crate::pmm::PMM;
use crate::proc::heap::{clear_malloc_dir, clear_page_dir};
use crate::proc::sched;
use crate::proc::{
    MappedRegion, NaiveHeap, Pid, PoolState, Proc, ProcState, SegmentType, CONTEXT_SEGMENT_INDEX,
    HEAP_SEGMENT_INDEX, STACK_SEGMENT_INDEX, SYSTEM_SEGMENT_INDEX,
};
use crate::riscv::{prot_to_type, PGSIZE, PROT_EXEC, PROT_READ, PROT_WRITE};
use crate::string::memset;
use crate::vfs::{Vfs, MAX_OPEN_FDS, RAMVFS};

/// Finds a `Free` slot and builds its address space: page table,
/// trapframe, user stack, the trapframe/trampoline mappings shared by
/// every process, and an empty heap. Leaves `status` at `Free` -- the
/// caller (boot, `do_fork`) decides what state to move it to and when
/// to publish it on a queue.
pub fn alloc_process(hart: usize, procs: &mut [Proc; NPROC]) -> Option<Pid> {
    let i = procs.iter().position(|p| p.status == ProcState::Free)?;
    let pid = Pid(i as u8);

    let trapframe_pa = PMM.alloc_page()?;
    memset(trapframe_pa as *mut u8, 0, PGSIZE);

    let pagetable = crate::vm::uvmcreate()?;
    let pagetable_pa = pagetable as *mut _ as usize;

    let user_stack_pa = PMM.alloc_page()?;

    let p = &mut procs[i];
    p.trapframe = trapframe_pa;
    p.pagetable = pagetable_pa;
    p.kstack = crate::KSTACK!(hart * NPROC + i);

    p.trapframe().sp = USER_STACK_TOP as u64;
    p.trapframe().tp = hart as u64;

    crate::vm::mappages(
        p.pagetable(),
        USER_STACK_TOP - PGSIZE,
        user_stack_pa,
        PGSIZE,
        prot_to_type(PROT_READ | PROT_WRITE, true),
    )
    .ok()?;
    p.mapped_info[STACK_SEGMENT_INDEX] = MappedRegion {
        va: USER_STACK_TOP - PGSIZE,
        npages: 1,
        seg_type: SegmentType::Stack,
    };

    crate::vm::mappages(
        p.pagetable(),
        TRAPFRAME,
        trapframe_pa,
        PGSIZE,
        prot_to_type(PROT_READ | PROT_WRITE, false),
    )
    .ok()?;
    p.mapped_info[CONTEXT_SEGMENT_INDEX] = MappedRegion {
        va: TRAPFRAME,
        npages: 1,
        seg_type: SegmentType::Context,
    };

    crate::vm::mappages(
        p.pagetable(),
        TRAMPOLINE,
        crate::trap::trampoline_pa(),
        PGSIZE,
        prot_to_type(PROT_READ | PROT_EXEC, false),
    )
    .ok()?;
    p.mapped_info[SYSTEM_SEGMENT_INDEX] = MappedRegion {
        va: TRAMPOLINE,
        npages: 1,
        seg_type: SegmentType::System,
    };

    p.user_heap = NaiveHeap {
        heap_top: USER_FREE_ADDRESS_START,
        heap_bottom: USER_FREE_ADDRESS_START,
        free_pages: [0; MAX_HEAP_PAGES],
        free_pages_count: 0,
    };
    p.mapped_info[HEAP_SEGMENT_INDEX] = MappedRegion {
        va: USER_FREE_ADDRESS_START,
        npages: 0,
        seg_type: SegmentType::Heap,
    };
    p.total_mapped_region = 4;
    p.better_heap_next_va = USER_FREE_ADDRESS_START;

    p.parent = None;
    p.queue_next = None;
    p.tick_count = 0;
    p.waiting_pid = None;
    p.num_page = 0;
    p.num_malloc = 0;
    p.sem_index = None;
    for fd in 0..crate::vfs::MAX_OPEN_FDS {
        p.release_fd(fd);
    }

    Some(pid)
}

/// Marks `pid` `Zombie`, closes every fd it still holds, and drops its
/// heap directories, but -- by design -- never unmaps its page table,
/// stack, or code/data pages. The shutdown rule (`sched::schedule`)
/// treats `Zombie` the same as `Free` for the purpose of deciding the
/// hart has no more work, so the leak never blocks a clean exit.
pub fn free_process(state: &mut PoolState<'_>, pid: Pid) {
    let p = &mut state.procs[pid.0 as usize];
    for fd in 0..MAX_OPEN_FDS {
        if p.owns_fd(fd) {
            RAMVFS.close(fd);
            p.release_fd(fd);
        }
    }
    p.status = ProcState::Zombie;
    clear_malloc_dir(p);
    clear_page_dir(p);
    sched::remove_from_blocked_queue(state, pid);
    sched::remove_from_ready_queue(state, pid);
}

/// Builds a child by walking the parent's `mapped_info`: the trapframe
/// is copied outright, the stack page is deep-copied, the heap is
/// shared copy-on-write, and `CODE` is mapped read/exec without copying
/// while `DATA` is deep-copied -- each into a freshly-appended region on
/// the child. Returns the child's pid, already queued `Ready`.
pub fn do_fork(hart: usize, state: &mut PoolState<'_>, parent: Pid) -> Option<Pid> {
    let child = alloc_process(hart, state.procs)?;

    for i in 0..state.procs[parent.0 as usize].total_mapped_region {
        let region = state.procs[parent.0 as usize].mapped_info[i];
        match region.seg_type {
            SegmentType::Context => {
                *state.procs[child.0 as usize].trapframe() =
                    *state.procs[parent.0 as usize].trapframe();
            }
            SegmentType::Stack => {
                let child_va = state.procs[child.0 as usize].mapped_info[STACK_SEGMENT_INDEX].va;
                let parent_pa =
                    crate::vm::walkaddr(state.procs[parent.0 as usize].pagetable(), region.va)
                        .expect("do_fork: parent stack page unmapped");
                let child_pa =
                    crate::vm::walkaddr(state.procs[child.0 as usize].pagetable(), child_va)
                        .expect("do_fork: child stack page unmapped");
                crate::string::memcpy(child_pa as *mut u8, parent_pa as *const u8, PGSIZE);
            }
            SegmentType::Heap => {
                let parent_idx = parent.0 as usize;
                let child_idx = child.0 as usize;
                let heap_bottom = state.procs[parent_idx].user_heap.heap_bottom;
                let heap_top = state.procs[parent_idx].user_heap.heap_top;
                let free_count = state.procs[parent_idx].user_heap.free_pages_count;
                let free_pages = state.procs[parent_idx].user_heap.free_pages;

                let mut heap_block = heap_bottom;
                while heap_block < heap_top {
                    let is_free = free_pages[..free_count].contains(&heap_block);
                    if !is_free {
                        crate::vm::share_page_cow(
                            state.procs[parent_idx].pagetable(),
                            state.procs[child_idx].pagetable(),
                            heap_block,
                        )
                        .expect("do_fork: failed to share heap page copy-on-write");
                    }
                    heap_block += PGSIZE;
                }
                state.procs[child_idx].mapped_info[HEAP_SEGMENT_INDEX].npages =
                    state.procs[parent_idx].mapped_info[HEAP_SEGMENT_INDEX].npages;
                state.procs[child_idx].user_heap = state.procs[parent_idx].user_heap;
            }
            SegmentType::Code => {
                let pa = crate::vm::walkaddr(state.procs[parent.0 as usize].pagetable(), region.va)
                    .expect("do_fork: code segment unmapped");
                crate::vm::mappages(
                    state.procs[child.0 as usize].pagetable(),
                    region.va,
                    pa,
                    region.npages as usize * PGSIZE,
                    prot_to_type(PROT_EXEC | PROT_READ, true),
                )
                .expect("do_fork: failed to map code segment into child");
                append_region(state, child, region);
            }
            SegmentType::Data => {
                for j in 0..region.npages as usize {
                    let va = region.va + j * PGSIZE;
                    let pa =
                        crate::vm::walkaddr(state.procs[parent.0 as usize].pagetable(), va)
                            .expect("do_fork: data page unmapped");
                    let new_pa = PMM
                        .alloc_page()
                        .expect("do_fork: out of physical memory copying data segment");
                    crate::string::memcpy(new_pa as *mut u8, pa as *const u8, PGSIZE);
                    crate::vm::mappages(
                        state.procs[child.0 as usize].pagetable(),
                        va,
                        new_pa,
                        PGSIZE,
                        prot_to_type(PROT_READ | PROT_WRITE, true),
                    )
                    .expect("do_fork: failed to map data page into child");
                }
                append_region(state, child, region);
            }
            SegmentType::System => {
                // Already set up identically by `alloc_process`; nothing
                // parent-specific to carry over.
            }
        }
    }

    state.procs[child.0 as usize].trapframe().a0 = 0;
    state.procs[child.0 as usize].parent = Some(parent);
    sched::insert_to_ready_queue(state, child);

    Some(child)
}

fn append_region(state: &mut PoolState<'_>, pid: Pid, region: MappedRegion) {
    let idx = state.procs[pid.0 as usize].total_mapped_region;
    state.procs[pid.0 as usize].mapped_info[idx] = region;
    state.procs[pid.0 as usize].total_mapped_region += 1;
}

/// Drops `pid`'s `CODE`/`DATA` segments and every mapped heap page,
/// leaving the fixed stack/trapframe/trampoline slots and the page
/// table itself intact, ready for a fresh image to be loaded over it.
fn clear_process(procs: &mut [Proc; NPROC], pid: Pid) {
    let p = &mut procs[pid.0 as usize];

    for i in 4..p.total_mapped_region {
        let region = p.mapped_info[i];
        crate::vm::uvmunmap(p.pagetable(), region.va, region.npages as usize, true);
    }
    p.total_mapped_region = 4;

    let heap_bottom = p.user_heap.heap_bottom;
    let heap_top = p.user_heap.heap_top;
    let mut va = heap_bottom;
    while va < heap_top {
        crate::vm::uvmunmap(p.pagetable(), va, 1, true);
        va += PGSIZE;
    }
    p.user_heap.heap_top = heap_bottom;
    p.user_heap.free_pages_count = 0;
    p.mapped_info[HEAP_SEGMENT_INDEX].npages = 0;

    clear_page_dir(p);
    clear_malloc_dir(p);
}

/// Discards `pid`'s current image and loads `path` from `vfs` over it,
/// keeping the same pid, parent, and page table. A failure here is
/// process-fatal: by the time the old image is cleared there's nothing
/// left to resume, so the caller must zombie the process rather than
/// return a negative syscall result.
pub fn do_exec(
    state: &mut PoolState<'_>,
    pid: Pid,
    vfs: &dyn Vfs,
    path: &str,
    argv: &[&str],
) -> Result<(), KernelError> {
    let fd = vfs.open(path, crate::vfs::O_RDONLY);
    if fd < 0 {
        return Err(KernelError::ProcessFatal("exec: no such file"));
    }
    let fd = fd as usize;

    let mut image = [0u8; crate::vfs::MAX_FILE_SIZE];
    let mut total = 0usize;
    loop {
        let n = vfs.read(fd, &mut image[total..]);
        if n <= 0 {
            break;
        }
        total += n as usize;
    }
    vfs.close(fd);

    clear_process(state.procs, pid);
    state.procs[pid.0 as usize].trapframe().sp = USER_STACK_TOP as u64;

    elf::load(&mut state.procs[pid.0 as usize], &image[..total], argv)
        .map_err(|_| KernelError::ProcessFatal("exec: malformed ELF image"))?;

    Ok(())
}

pub enum WaitOutcome {
    Invalid,
    Reaped(Pid),
    Blocked,
}

/// Resolves `pid_arg` (-1 = any child, >=0 = a specific one) to a
/// non-`Free` child of the caller; reaps it immediately if it's already
/// `Zombie`, otherwise blocks the caller (`sched::schedule` picks up
/// from there and never returns to this call). Returns `Invalid` for no
/// matching child, an out-of-range pid, or a negative pid other than -1.
pub fn resolve_wait(state: &mut PoolState<'_>, me: Pid, pid_arg: i64) -> WaitOutcome {
    let target = if pid_arg == -1 {
        (0..NPROC).find(|&i| {
            state.procs[i].parent == Some(me) && state.procs[i].status != ProcState::Free
        })
    } else if pid_arg >= 0 && (pid_arg as usize) < NPROC {
        let i = pid_arg as usize;
        if state.procs[i].parent == Some(me) && state.procs[i].status != ProcState::Free {
            Some(i)
        } else {
            None
        }
    } else {
        None
    };

    let Some(child_idx) = target else {
        return WaitOutcome::Invalid;
    };
    let child = Pid(child_idx as u8);

    if state.procs[child_idx].status == ProcState::Zombie {
        state.procs[child_idx].status = ProcState::Free;
        return WaitOutcome::Reaped(child);
    }

    state.procs[me.0 as usize].waiting_pid = Some(child);
    sched::from_ready_to_blocked(state, me);
    WaitOutcome::Blocked
}
