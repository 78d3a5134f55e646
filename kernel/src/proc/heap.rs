//! Two independent user-heap mechanisms, both driven off a process's own
//! state rather than a single hart-wide `current` pointer:
//!
//! - The *naive* page-granular allocator (`NaiveHeap` in `proc::mod`):
//!   `allocate_page`/`free_page` hand out and take back whole pages from
//!   a bump region, with freed pages pushed onto a small LIFO so they're
//!   reused before the bump pointer advances again. This is also the
//!   heap the copy-on-write fork path shares lazily.
//! - The *better* byte-granular allocator below: `do_better_malloc`
//!   carves arbitrary-sized regions out of a directory of mapped pages
//!   (`page_dir`), reusing front/inner/rear gaps in the sorted
//!   `malloc_dir` before asking for more pages. `do_better_free` only
//!   removes the directory entry -- freed bytes aren't given back to the
//!   page allocator until the whole process exits, matching the
//!   reference allocator this is modeled on.
//!
//! `page_dir`/`malloc_dir` are not part of the copy-on-write fork path:
//! a forked child starts with both empty, same as the source. A child
//! that calls `better_allocate_page` gets its own fresh directory.

use crate::param::{MAX_HEAP_PAGES, MAX_MALLOC_IN_HEAP};
use crate::pmm::PMM;
use crate::proc::{MallocDentry, PageDentry, Proc};
use crate::riscv::{prot_to_type, PGSIZE, PROT_READ, PROT_WRITE};
use crate::PGROUNDUP;

#[derive(Debug)]
pub struct OutOfHeap;

/// Maps one fresh page at the top of the naive heap and returns its
/// virtual address, or `None` if the heap's page budget is exhausted.
pub fn allocate_page(proc: &mut Proc) -> Option<usize> {
    if proc.user_heap.free_pages_count > 0 {
        // A previously-freed page: it's already mapped at this virtual
        // address, just lend it back out.
        proc.user_heap.free_pages_count -= 1;
        return Some(proc.user_heap.free_pages[proc.user_heap.free_pages_count]);
    }

    let pa = PMM.alloc_page()?;
    let va = proc.user_heap.heap_top;
    crate::vm::mappages(
        proc.pagetable(),
        va,
        pa,
        PGSIZE,
        prot_to_type(PROT_READ | PROT_WRITE, true),
    )
    .ok()?;
    proc.user_heap.heap_top += PGSIZE;
    proc.mapped_info[super::HEAP_SEGMENT_INDEX].npages += 1;
    Some(va)
}

/// Returns a page to the naive heap's free list without unmapping it --
/// it will be handed back out by a later `allocate_page` before the heap
/// grows further.
pub fn free_page(proc: &mut Proc, va: usize) -> bool {
    if crate::vm::walkaddr(proc.pagetable(), va).is_none() {
        return false;
    }
    if proc.user_heap.free_pages_count >= MAX_HEAP_PAGES {
        return false;
    }
    proc.user_heap.free_pages[proc.user_heap.free_pages_count] = va;
    proc.user_heap.free_pages_count += 1;
    true
}

/// Carves out `n` bytes from the byte-granular allocator, mapping fresh
/// pages only when no existing gap in `page_dir` is large enough.
pub fn do_better_malloc(proc: &mut Proc, n: usize) -> Result<usize, OutOfHeap> {
    if proc.num_page == 0 {
        let pages_needed = PGROUNDUP!(n) / PGSIZE;
        if !alloc_n_page(proc, pages_needed) {
            return Err(OutOfHeap);
        }
        let va_start = proc.page_dir[0].va_page;
        add_to_malloc_dir(proc, va_start, va_start + n)?;
        return Ok(va_start);
    }

    let va_page_start = proc.page_dir[0].va_page;
    let va_page_end = proc.page_dir[proc.num_page - 1].va_page + PGSIZE;

    if proc.num_malloc == 0 {
        // Pages are still held (do_better_free never returns them) but
        // every live allocation has been freed -- start fresh at the
        // bottom of the directory, the same outcome a front_gap hit
        // would give.
        add_to_malloc_dir(proc, va_page_start, va_page_start + n)?;
        return Ok(va_page_start);
    }

    let front_gap = proc.malloc_dir[0].va_start - va_page_start;
    if front_gap >= n {
        add_to_malloc_dir(proc, va_page_start, va_page_start + n)?;
        return Ok(va_page_start);
    }

    if proc.num_malloc >= 2 {
        for i in 0..proc.num_malloc - 1 {
            let gap = proc.malloc_dir[i + 1].va_start - proc.malloc_dir[i].va_end;
            if gap >= n {
                let start = proc.malloc_dir[i].va_end;
                add_to_malloc_dir(proc, start, start + n)?;
                return Ok(start);
            }
        }
    }

    let new_va_start = proc.malloc_dir[proc.num_malloc - 1].va_end;
    add_to_malloc_dir(proc, new_va_start, new_va_start + n)?;

    let rear_offset = va_page_end - new_va_start;
    if rear_offset < n {
        let pages_needed = PGROUNDUP!(n - rear_offset) / PGSIZE;
        if !alloc_n_page(proc, pages_needed) {
            return Err(OutOfHeap);
        }
    }
    Ok(new_va_start)
}

/// Drops the directory entry for the region starting at `va`. The
/// backing pages stay mapped until the process exits -- this allocator
/// never compacts or returns pages mid-life.
pub fn do_better_free(proc: &mut Proc, va: usize) -> bool {
    let Some(index) = find_malloc_dir(proc, va) else {
        return false;
    };
    remove_from_malloc_dir(proc, index);
    true
}

fn alloc_n_page(proc: &mut Proc, n: usize) -> bool {
    if proc.num_page + n > MAX_HEAP_PAGES {
        return false;
    }
    for _ in 0..n {
        let Some(pa) = PMM.alloc_page() else {
            return false;
        };
        let va = proc.better_heap_next_va;
        if crate::vm::mappages(
            proc.pagetable(),
            va,
            pa,
            PGSIZE,
            prot_to_type(PROT_READ | PROT_WRITE, true),
        )
        .is_err()
        {
            PMM.free_page(pa);
            return false;
        }
        add_to_page_dir(proc, va, pa);
        proc.better_heap_next_va += PGSIZE;
    }
    true
}

fn add_to_page_dir(proc: &mut Proc, va_page: usize, pa_page: usize) {
    proc.page_dir[proc.num_page] = PageDentry { va_page, pa_page };
    proc.num_page += 1;
    sort_page_dir(proc);
}

fn sort_page_dir(proc: &mut Proc) {
    let n = proc.num_page;
    for i in 0..n.saturating_sub(1) {
        for j in 0..n - i - 1 {
            if proc.page_dir[j].va_page > proc.page_dir[j + 1].va_page {
                proc.page_dir.swap(j, j + 1);
            }
        }
    }
}

fn add_to_malloc_dir(proc: &mut Proc, va_start: usize, va_end: usize) -> Result<(), OutOfHeap> {
    if proc.num_malloc + 1 > MAX_MALLOC_IN_HEAP {
        return Err(OutOfHeap);
    }
    proc.malloc_dir[proc.num_malloc] = MallocDentry { va_start, va_end };
    proc.num_malloc += 1;
    sort_malloc_dir(proc);
    Ok(())
}

fn sort_malloc_dir(proc: &mut Proc) {
    let n = proc.num_malloc;
    for i in 0..n.saturating_sub(1) {
        for j in 0..n - i - 1 {
            if proc.malloc_dir[j].va_start > proc.malloc_dir[j + 1].va_start {
                proc.malloc_dir.swap(j, j + 1);
            }
        }
    }
}

fn find_malloc_dir(proc: &Proc, va: usize) -> Option<usize> {
    proc.malloc_dir[..proc.num_malloc]
        .iter()
        .position(|d| d.va_start == va)
}

fn remove_from_malloc_dir(proc: &mut Proc, index: usize) {
    for i in index..proc.num_malloc - 1 {
        proc.malloc_dir[i] = proc.malloc_dir[i + 1];
    }
    proc.num_malloc -= 1;
}

/// Unmaps every page tracked in `page_dir` and empties both directories.
/// Called when a process exits or is `exec`'d over.
pub fn clear_page_dir(proc: &mut Proc) {
    for i in 0..proc.num_page {
        crate::vm::uvmunmap(proc.pagetable(), proc.page_dir[i].va_page, 1, true);
    }
    proc.num_page = 0;
    proc.better_heap_next_va = crate::memlayout::USER_FREE_ADDRESS_START;
}

pub fn clear_malloc_dir(proc: &mut Proc) {
    proc.num_malloc = 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::Pid;

    /// A bare process with no page table -- fine for exercising the
    /// directory bookkeeping below, none of which touches `vm`/`PMM`.
    fn fresh_proc() -> Proc {
        Proc::empty(Pid(0))
    }

    #[test]
    fn add_to_page_dir_keeps_ascending_va() {
        let mut proc = fresh_proc();
        add_to_page_dir(&mut proc, 0x3000, 1);
        add_to_page_dir(&mut proc, 0x1000, 2);

        assert_eq!(proc.num_page, 2);
        assert_eq!(proc.page_dir[0].va_page, 0x1000);
        assert_eq!(proc.page_dir[1].va_page, 0x3000);
    }

    #[test]
    fn malloc_dir_finds_and_removes_entry() {
        let mut proc = fresh_proc();
        add_to_malloc_dir(&mut proc, 0x10, 0x20).unwrap();
        add_to_malloc_dir(&mut proc, 0x20, 0x30).unwrap();

        let found = find_malloc_dir(&proc, 0x20);
        assert_eq!(found, Some(1));

        remove_from_malloc_dir(&mut proc, found.unwrap());
        assert_eq!(proc.num_malloc, 1);
        assert_eq!(proc.malloc_dir[0].va_start, 0x10);
    }

    #[test]
    fn add_to_malloc_dir_reports_full_table() {
        let mut proc = fresh_proc();
        for i in 0..MAX_MALLOC_IN_HEAP {
            let base = (i * 0x10) as usize;
            add_to_malloc_dir(&mut proc, base, base + 0x10).unwrap();
        }
        assert!(add_to_malloc_dir(&mut proc, 0x1000, 0x1010).is_err());
    }

    /// Regression for the directory-bootstrap underflow: pages already
    /// held (`num_page > 0`) but every live allocation freed
    /// (`num_malloc == 0`) must restart at the bottom of the page
    /// directory instead of indexing `malloc_dir[0]` on an empty table.
    #[test]
    fn better_malloc_restarts_at_front_when_all_freed() {
        let mut proc = fresh_proc();
        add_to_page_dir(&mut proc, 0x2000, 0xAAAA000);
        assert_eq!(proc.num_page, 1);
        assert_eq!(proc.num_malloc, 0);

        let va = do_better_malloc(&mut proc, 0x40).expect("front of directory has room");
        assert_eq!(va, 0x2000);
        assert_eq!(proc.num_malloc, 1);
    }

    #[test]
    fn better_malloc_reuses_front_gap_before_extending() {
        let mut proc = fresh_proc();
        add_to_page_dir(&mut proc, 0x2000, 0xAAAA000);
        add_to_malloc_dir(&mut proc, 0x2040, 0x2080).unwrap();

        let va = do_better_malloc(&mut proc, 0x20).expect("front gap covers the request");
        assert_eq!(va, 0x2000);
        assert_eq!(proc.num_malloc, 2);
    }

    #[test]
    fn better_malloc_reuses_inner_gap_between_entries() {
        let mut proc = fresh_proc();
        add_to_page_dir(&mut proc, 0x2000, 0xAAAA000);
        add_to_malloc_dir(&mut proc, 0x2000, 0x2010).unwrap();
        add_to_malloc_dir(&mut proc, 0x2080, 0x2090).unwrap();

        let va = do_better_malloc(&mut proc, 0x20).expect("inner gap covers the request");
        assert_eq!(va, 0x2010);
        assert_eq!(proc.num_malloc, 3);
    }

    #[test]
    fn better_free_drops_the_matching_entry_only() {
        let mut proc = fresh_proc();
        add_to_page_dir(&mut proc, 0x2000, 0xAAAA000);
        add_to_malloc_dir(&mut proc, 0x2000, 0x2010).unwrap();
        add_to_malloc_dir(&mut proc, 0x2010, 0x2020).unwrap();

        assert!(do_better_free(&mut proc, 0x2000));
        assert_eq!(proc.num_malloc, 1);
        assert_eq!(proc.malloc_dir[0].va_start, 0x2010);
        assert!(!do_better_free(&mut proc, 0x2000), "already freed");
    }
}
