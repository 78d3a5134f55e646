//! Physical page frame allocator: an intrusive freelist guarded by a
//! spinlock, with `alloc_page`/`free_page` for one page at a time and
//! `alloc_two_page` for callers (the ELF loader's two-page segment case,
//! see `elf::load_segment`) that need two physically adjacent pages.
//!
//! `mem_start`/`mem_end` are set once at boot and read-only after, so
//! plain atomics (rather than raw pointer writes through a shared
//! reference) are enough for both.

use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::memlayout::PHYSTOP;
use crate::riscv::PGSIZE;
use crate::spinlock::Spinlock;
use crate::string::memset;
use crate::PGROUNDUP;

extern "C" {
    // First address past the kernel image; defined by the linker script.
    static mut _end: u8;
}

struct Node {
    next: *mut Node,
}

pub struct PageAllocator {
    lock: Spinlock,
    freelist: AtomicPtr<Node>,
    mem_start: AtomicUsize,
    mem_end: AtomicUsize,
}

unsafe impl Sync for PageAllocator {}

pub static PMM: PageAllocator = PageAllocator::empty();

impl PageAllocator {
    const fn empty() -> Self {
        Self {
            lock: Spinlock::init_lock("pmm"),
            freelist: AtomicPtr::new(core::ptr::null_mut()),
            mem_start: AtomicUsize::new(0),
            mem_end: AtomicUsize::new(0),
        }
    }

    /// Builds the freelist over `[kernel_end, PHYSTOP)`, mirroring
    /// `pmm_init`/`create_freepage_list`.
    pub fn init(&self) {
        let kernel_end = PGROUNDUP!(unsafe { (&_end) as *const u8 as usize });
        self.free_range(kernel_end, PHYSTOP);
    }

    fn free_range(&self, start: usize, end: usize) {
        self.mem_start.store(start, Ordering::Relaxed);
        self.mem_end.store(end, Ordering::Relaxed);

        let mut p = start;
        while p + PGSIZE <= end {
            self.free_page_raw(p);
            p += PGSIZE;
        }
    }

    fn free_page_raw(&self, pa: usize) {
        let (start, end) = (
            self.mem_start.load(Ordering::Relaxed),
            self.mem_end.load(Ordering::Relaxed),
        );
        if pa % PGSIZE != 0 || pa < start || pa >= end {
            panic!("free_page: {:#x} out of range", pa);
        }
        memset(pa as *mut u8, 1, PGSIZE); // junk, to catch dangling refs

        let node = pa as *mut Node;
        self.lock.acquire();
        unsafe {
            (*node).next = self.freelist.load(Ordering::Relaxed);
        }
        self.freelist.store(node, Ordering::Relaxed);
        self.lock.release();
    }

    /// Returns a physical page to the allocator. Must have come from
    /// `alloc_page`/`alloc_two_page`.
    pub fn free_page(&self, pa: usize) {
        self.free_page_raw(pa);
    }

    /// Allocates one page, or `None` if the freelist is exhausted.
    pub fn alloc_page(&self) -> Option<usize> {
        self.lock.acquire();
        let node = self.freelist.load(Ordering::Relaxed);
        let result = if !node.is_null() {
            let next = unsafe { (*node).next };
            self.freelist.store(next, Ordering::Relaxed);
            Some(node as usize)
        } else {
            None
        };
        self.lock.release();
        if let Some(pa) = result {
            memset(pa as *mut u8, 5, PGSIZE); // junk
        }
        result
    }

    /// Allocates two physically adjacent pages (lower address first),
    /// scanning the freelist for a descending-adjacent pair exactly as
    /// the source allocator does. Used by the ELF loader when a segment
    /// needs exactly two pages, so both halves sit in one contiguous
    /// mapping.
    pub fn alloc_two_page(&self) -> Option<usize> {
        self.lock.acquire();
        let mut n = self.freelist.load(Ordering::Relaxed);
        if n.is_null() {
            self.lock.release();
            return None;
        }
        let result = unsafe {
            loop {
                let next = (*n).next;
                if next.is_null() {
                    break None;
                }
                let next_next = (*next).next;
                if next_next.is_null() {
                    break None;
                }
                if (next as usize) - PGSIZE == next_next as usize {
                    let low = next_next as usize;
                    (*n).next = (*next_next).next;
                    break Some(low);
                }
                n = next;
            }
        };
        self.lock.release();
        if let Some(low) = result {
            memset(low as *mut u8, 5, 2 * PGSIZE);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_allocator(pages: usize) -> (PageAllocator, Vec<u8>) {
        // Host-side test harness: back the arena with a boxed, page-aligned
        // buffer instead of real physical memory.
        let layout_len = (pages + 2) * PGSIZE;
        let mut buf = vec![0u8; layout_len];
        let base = buf.as_mut_ptr() as usize;
        let aligned = PGROUNDUP!(base);
        let alloc = PageAllocator::empty();
        alloc.free_range(aligned, aligned + pages * PGSIZE);
        (alloc, buf)
    }

    #[test]
    fn alloc_then_free_round_trips() {
        let (alloc, _buf) = fresh_allocator(4);
        let a = alloc.alloc_page().expect("page available");
        let b = alloc.alloc_page().expect("page available");
        assert_ne!(a, b);
        alloc.free_page(a);
        let c = alloc.alloc_page().expect("page available");
        assert_eq!(c, a, "LIFO freelist should hand back the just-freed page");
        let _ = b;
    }

    #[test]
    fn exhausted_allocator_returns_none() {
        let (alloc, _buf) = fresh_allocator(1);
        assert!(alloc.alloc_page().is_some());
        assert!(alloc.alloc_page().is_none());
    }

    #[test]
    fn alloc_two_page_returns_adjacent_pages() {
        let (alloc, _buf) = fresh_allocator(4);
        let lo = alloc
            .alloc_two_page()
            .expect("two adjacent pages available");
        assert_eq!(lo % PGSIZE, 0);
    }
}
