//! SV39 virtual memory: kernel direct map, per-process page tables,
//! copy-on-write fork, and lazy stack growth.
//!
//! `uvmcopy_cow`'s copy-on-write sharing and `cow_fault` exist because
//! the heap segment is meant to be shared read-only until written,
//! rather than deep-copied eagerly on every fork the way CODE/DATA
//! segments are; `proc::lifecycle::fork` drives the per-segment choice
//! through these primitives.

use crate::pmm::PMM;
use crate::printf;
use crate::riscv::{
    prot_to_type, sfence_vma, w_satp, Pte, PteFlags, MAXVA, PGSIZE, PTE_SIZE, PTE_U, PTE_V, PTE_W,
    PROT_COW, PROT_EXEC, PROT_READ, PROT_WRITE,
};
use crate::string::{memcpy, memset};
use crate::{MAKE_SATP, PA2PTE, PGROUNDDOWN, PGROUNDUP, PTE2PA, PX};
use crate::memlayout::{KERNBASE, PHYSTOP, TRAMPOLINE, UART0};

pub static mut KERNEL_PAGETABLE: Option<&'static mut crate::riscv::PageTable> = None;

extern "C" {
    static etext: u8; // end of kernel code, from the linker script
    static trampoline: u8; // trap entry/exit trampoline page
}

fn alloc_zeroed_page() -> Option<*mut crate::riscv::PageTable> {
    let pa = PMM.alloc_page()?;
    memset(pa as *mut u8, 0, PGSIZE);
    Some(pa as *mut crate::riscv::PageTable)
}

fn kvmmake() -> &'static mut crate::riscv::PageTable {
    let kpgtbl = unsafe {
        alloc_zeroed_page()
            .expect("failed to alloc root page table")
            .as_mut()
            .unwrap()
    };

    kvmmap(kpgtbl, UART0, UART0, PGSIZE, PROT_READ | PROT_WRITE);

    let etext_addr = unsafe { (&etext) as *const u8 as usize };
    kvmmap(kpgtbl, KERNBASE, KERNBASE, etext_addr - KERNBASE, PROT_READ | PROT_EXEC);
    kvmmap(kpgtbl, etext_addr, etext_addr, PHYSTOP - etext_addr, PROT_READ | PROT_WRITE);

    let trampoline_addr = unsafe { (&trampoline) as *const u8 as usize };
    kvmmap(kpgtbl, TRAMPOLINE, trampoline_addr, PGSIZE, PROT_READ | PROT_EXEC);

    crate::proc::map_kernel_stacks(kpgtbl);

    kpgtbl
}

pub fn kvminit() {
    unsafe {
        KERNEL_PAGETABLE = Some(kvmmake());
    }
}

pub fn kvmmap(kpgtbl: &mut crate::riscv::PageTable, va: usize, pa: usize, sz: usize, prot: usize) {
    let perm = prot_to_type(prot, false);
    if mappages(kpgtbl, va, pa, sz, perm).is_err() {
        panic!("kvmmap: out of memory");
    }
}

#[derive(Debug)]
pub struct OutOfMemory;

/// Creates PTEs mapping `[va, va+size)` to `[pa, pa+size)`. `perm` is raw
/// PTE permission bits (see `prot_to_type`); `V` is added automatically.
pub fn mappages(
    pagetable: &mut crate::riscv::PageTable,
    va: usize,
    mut pa: usize,
    size: usize,
    perm: usize,
) -> Result<(), OutOfMemory> {
    if size == 0 {
        panic!("mappages: zero size");
    }

    let mut a = PGROUNDDOWN!(va);
    let last = PGROUNDDOWN!(va + size - 1);

    loop {
        let pte = walk(pagetable, a, true).ok_or(OutOfMemory)?;
        if pte.is_valid() {
            printf!("mappages: remap at {:#x}, pte {:#x}\n", a, pte.0);
            panic!("mappages: remap");
        }
        *pte = Pte(PA2PTE!(pa) | perm | PTE_V);
        if a == last {
            break;
        }
        a += PGSIZE;
        pa += PGSIZE;
    }
    Ok(())
}

/// Removes `npages` mappings starting at `va` (page-aligned). Frees the
/// backing physical pages when `do_free` and the page isn't shared
/// (i.e. not `COW`) -- a COW page is only freed by whichever sibling
/// unmaps it last; see `proc::lifecycle::free_process`'s documented
/// non-reclamation for why that last-owner tracking is itself skipped
/// here rather than solved.
pub fn uvmunmap(pagetable: &mut crate::riscv::PageTable, va: usize, npages: usize, do_free: bool) {
    if va % PGSIZE != 0 {
        panic!("uvmunmap: not aligned");
    }

    for a in (va..va + npages * PGSIZE).step_by(PGSIZE) {
        match walk(pagetable, a, false) {
            None => continue, // unmapped lazily-never-touched stack/heap page
            Some(pte) => {
                if !pte.is_valid() {
                    continue;
                }
                if !pte.is_leaf() {
                    panic!("uvmunmap: not a leaf");
                }
                if do_free {
                    PMM.free_page(pte.pa());
                }
                *pte = Pte(0);
            }
        }
    }
}

/// Walks (and optionally extends) the three-level page table, returning
/// the leaf PTE slot for `va`.
fn walk(
    pagetable: &mut crate::riscv::PageTable,
    va: usize,
    alloc: bool,
) -> Option<&mut Pte> {
    if va >= MAXVA {
        panic!("walk: va out of range");
    }

    let mut curr: *mut crate::riscv::PageTable = pagetable;
    for level in (1..3).rev() {
        let pte = unsafe { &mut (*curr).0[PX!(level, va)] };
        if pte.is_valid() {
            curr = pte.pa() as *mut crate::riscv::PageTable;
        } else {
            if !alloc {
                return None;
            }
            let next = alloc_zeroed_page()?;
            *pte = Pte(PA2PTE!(next as usize) | PTE_V);
            curr = next;
        }
    }

    Some(unsafe { &mut (*curr).0[PX!(0, va)] })
}

/// Translates `va` to its physical address, honoring `V`/`U`. Returns
/// `None` if unmapped, kernel-only, or not a leaf.
pub fn walkaddr(pagetable: &mut crate::riscv::PageTable, va: usize) -> Option<usize> {
    if va >= MAXVA {
        return None;
    }
    let pte = walk(pagetable, va, false)?;
    if !pte.is_valid() || !pte.is_leaf() || pte.flags() & PTE_U == 0 {
        return None;
    }
    Some(pte.pa())
}

pub fn kvminithart() {
    sfence_vma();
    let addr = unsafe { (*core::ptr::addr_of!(KERNEL_PAGETABLE)).as_ref().unwrap() as *const _ as usize };
    w_satp(MAKE_SATP!(addr));
    sfence_vma();
}

pub fn uvmcreate() -> Option<&'static mut crate::riscv::PageTable> {
    unsafe { alloc_zeroed_page()?.as_mut() }
}

/// Loads the first process's tiny bootstrap image at VA 0.
pub fn uvmfirst(pagetable: &mut crate::riscv::PageTable, src: &[u8]) {
    if src.len() >= PGSIZE {
        panic!("uvmfirst: image larger than one page");
    }
    let mem = PMM.alloc_page().expect("uvmfirst: out of memory");
    memset(mem as *mut u8, 0, PGSIZE);
    mappages(
        pagetable,
        0,
        mem,
        PGSIZE,
        prot_to_type(PROT_READ | PROT_WRITE | PROT_EXEC, true),
    )
    .expect("uvmfirst: mappages");
    memcpy(mem as *mut u8, src.as_ptr(), src.len());
}

/// Extends a process's user memory (heap growth, stack growth) from
/// `old_size` to `new_size`, both byte counts. Newly-mapped pages are
/// zeroed.
pub fn uvmalloc(
    pagetable: &mut crate::riscv::PageTable,
    old_size: usize,
    new_size: usize,
    prot: usize,
) -> Result<usize, OutOfMemory> {
    if new_size <= old_size {
        return Ok(old_size);
    }
    let perm = prot_to_type(prot, true);
    let mut a = PGROUNDUP!(old_size);
    while a < new_size {
        let pa = PMM.alloc_page().ok_or(OutOfMemory)?;
        memset(pa as *mut u8, 0, PGSIZE);
        if mappages(pagetable, a, pa, PGSIZE, perm).is_err() {
            PMM.free_page(pa);
            return Err(OutOfMemory);
        }
        a += PGSIZE;
    }
    Ok(new_size)
}

/// Shrinks user memory from `old_size` to `new_size`, freeing pages.
pub fn uvmdealloc(pagetable: &mut crate::riscv::PageTable, old_size: usize, new_size: usize) -> usize {
    if new_size >= old_size {
        return old_size;
    }
    let npages = (PGROUNDUP!(old_size) - PGROUNDUP!(new_size)) / PGSIZE;
    if npages > 0 {
        uvmunmap(pagetable, PGROUNDUP!(new_size), npages, true);
    }
    new_size
}

fn freewalk(pagetable: &mut crate::riscv::PageTable) {
    for pte in &mut pagetable.0 {
        if pte.is_valid() && !pte.is_leaf() {
            let child = unsafe { (pte.pa() as *mut crate::riscv::PageTable).as_mut().unwrap() };
            freewalk(child);
            *pte = Pte(0);
        } else if pte.is_valid() {
            panic!("freewalk: leaf mapping still present");
        }
    }
    PMM.free_page(pagetable as *mut _ as usize);
}

pub fn uvmfree(pagetable: &mut crate::riscv::PageTable, sz: usize) {
    if sz > 0 {
        uvmunmap(pagetable, 0, PGROUNDUP!(sz) / PGSIZE, true);
    }
    freewalk(pagetable);
}

/// Shares `[0, sz)` of `old`'s user memory into `new`'s page table
/// copy-on-write: both page tables point at the same physical pages,
/// writable bits are cleared and `COW` is set on both copies. A later
/// store fault into either address space triggers `cow_fault`, which
/// privatizes just that page. This is the mechanism `proc::lifecycle::fork`
/// uses for the heap segment instead of an eager deep copy.
pub fn uvmcopy_cow(
    old: &mut crate::riscv::PageTable,
    new: &mut crate::riscv::PageTable,
    sz: usize,
) -> Result<(), OutOfMemory> {
    let mut i = 0;
    while i < sz {
        let pte = walk(old, i, false).expect("uvmcopy_cow: page should be mapped");
        let pa = pte.pa();
        let mut flags = pte.flags();
        if flags & PTE_W != 0 {
            flags = (flags & !PTE_W) | crate::riscv::PTE_COW;
            *pte = Pte(PA2PTE!(pa) | flags);
        }
        if mappages(new, i, pa, PGSIZE, flags).is_err() {
            uvmunmap(new, 0, i / PGSIZE, false);
            return Err(OutOfMemory);
        }
        i += PGSIZE;
    }
    Ok(())
}

/// Deep-copies `[0, sz)` verbatim (used for the CODE/DATA segments,
/// which this kernel's fork shares read-only without COW bookkeeping
/// since they're never written after exec).
pub fn uvmcopy_eager(
    old: &mut crate::riscv::PageTable,
    new: &mut crate::riscv::PageTable,
    sz: usize,
) -> Result<(), OutOfMemory> {
    let mut i = 0;
    while i < sz {
        let pte = walk(old, i, false).expect("uvmcopy_eager: page should be mapped");
        let src_pa = pte.pa();
        let flags = pte.flags();
        let dst_pa = PMM.alloc_page().ok_or(OutOfMemory)?;
        memcpy(dst_pa as *mut u8, src_pa as *const u8, PGSIZE);
        if mappages(new, i, dst_pa, PGSIZE, flags).is_err() {
            PMM.free_page(dst_pa);
            uvmunmap(new, 0, i / PGSIZE, true);
            return Err(OutOfMemory);
        }
        i += PGSIZE;
    }
    Ok(())
}

/// Shares one arbitrary-`va` page copy-on-write between two page tables
/// the same way `uvmcopy_cow` does across a contiguous range, but for a
/// single scattered page -- `proc::lifecycle::do_fork` uses this to
/// share the naive heap's individually-mapped pages instead of a
/// `[0, sz)` range.
pub fn share_page_cow(
    old: &mut crate::riscv::PageTable,
    new: &mut crate::riscv::PageTable,
    va: usize,
) -> Result<(), OutOfMemory> {
    let pte = walk(old, va, false).expect("share_page_cow: page should be mapped");
    let pa = pte.pa();
    let mut flags = pte.flags();
    if flags & PTE_W != 0 {
        flags = (flags & !PTE_W) | crate::riscv::PTE_COW;
        *pte = Pte(PA2PTE!(pa) | flags);
    }
    mappages(new, va, pa, PGSIZE, flags)
}

/// Handles a store page fault into a `COW` page: if `va`'s page is still
/// shared, allocate a private copy and remap it writable; if the kernel
/// was the last owner the page is simply made writable again. Returns
/// `false` if `va` isn't a COW fault the kernel can service (segfault).
pub fn cow_fault(pagetable: &mut crate::riscv::PageTable, va: usize) -> bool {
    let va = PGROUNDDOWN!(va);
    let pte = match walk(pagetable, va, false) {
        Some(p) if p.is_valid() && p.is_cow() => p,
        _ => return false,
    };
    let old_pa = pte.pa();
    let flags = (pte.flags() & !crate::riscv::PTE_COW) | PTE_W;

    let new_pa = match PMM.alloc_page() {
        Some(p) => p,
        None => return false,
    };
    memcpy(new_pa as *mut u8, old_pa as *const u8, PGSIZE);
    *pte = Pte(PA2PTE!(new_pa) | flags);
    PMM.free_page(old_pa); // drop this process's reference to the shared page
    true
}

/// Copies `len` bytes from kernel memory `src` to user virtual address
/// `dst_va`, crossing page boundaries as needed.
pub fn copyout(pagetable: &mut crate::riscv::PageTable, dst_va: usize, src: &[u8]) -> bool {
    let mut remaining = src.len();
    let mut va = dst_va;
    let mut off = 0usize;
    while remaining > 0 {
        let page_base = PGROUNDDOWN!(va);
        let pa = match walkaddr(pagetable, page_base) {
            Some(pa) => pa,
            None => return false,
        };
        let page_off = va - page_base;
        let n = core::cmp::min(PGSIZE - page_off, remaining);
        let dst_ptr = (pa + page_off) as *mut u8;
        memcpy(dst_ptr, src[off..off + n].as_ptr(), n);
        remaining -= n;
        off += n;
        va = page_base + PGSIZE;
    }
    true
}

/// Copies `dst.len()` bytes from user virtual address `src_va` into
/// kernel memory `dst`.
pub fn copyin(pagetable: &mut crate::riscv::PageTable, dst: &mut [u8], src_va: usize) -> bool {
    let mut remaining = dst.len();
    let mut va = src_va;
    let mut off = 0usize;
    while remaining > 0 {
        let page_base = PGROUNDDOWN!(va);
        let pa = match walkaddr(pagetable, page_base) {
            Some(pa) => pa,
            None => return false,
        };
        let page_off = va - page_base;
        let n = core::cmp::min(PGSIZE - page_off, remaining);
        let src_ptr = (pa + page_off) as *const u8;
        memcpy(dst[off..off + n].as_mut_ptr(), src_ptr, n);
        remaining -= n;
        off += n;
        va = page_base + PGSIZE;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_root() -> Box<crate::riscv::PageTable> {
        Box::new(crate::riscv::PageTable(
            [crate::riscv::Pte::empty(); crate::riscv::PTES_PER_PAGE],
        ))
    }

    #[test]
    fn prot_to_type_sets_user_and_requested_bits() {
        let t = prot_to_type(PROT_READ | PROT_WRITE, true);
        assert_ne!(t & PTE_U, 0);
        assert_ne!(t & crate::riscv::PTE_R, 0);
        assert_ne!(t & crate::riscv::PTE_W, 0);
        assert_eq!(t & crate::riscv::PTE_X, 0);
    }

    #[test]
    fn prot_to_type_cow_without_write() {
        let t = prot_to_type(PROT_READ | PROT_COW, true);
        assert_ne!(t & crate::riscv::PTE_COW, 0);
        assert_eq!(t & crate::riscv::PTE_W, 0);
    }

    #[test]
    fn empty_page_table_entries_start_invalid() {
        let pt = new_root();
        for pte in &pt.0 {
            assert!(!pte.is_valid());
        }
    }
}
