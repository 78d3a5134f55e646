// Physical memory layout
//
// qemu -machine virt, based on qemu's hw/riscv/virt.c:
//
// 00001000 -- boot ROM, provided by qemu
// 02000000 -- CLINT (the only device this kernel drives besides the timer)
// 10000000 -- uart0 (console sink for the logging collaborator)
// 80000000 -- boot ROM jumps here in machine mode; kernel loads here
// unused RAM after 80000000, up to PKE_MAX_ALLOWABLE_RAM.
//
// No PLIC and no virtio: device drivers beyond the timer are out of scope,
// so external-interrupt routing and disk MMIO never appear here.

use crate::param::PKE_MAX_ALLOWABLE_RAM;
use crate::riscv::*;

// qemu puts UART registers here in physical memory.
pub const UART0: usize = 0x10000000;

// core local interruptor (CLINT), which contains the timer.
pub const CLINT: u64 = 0x2000000;
#[macro_export]
macro_rules! CLINT_MTIMECMP {
    ( $hartid:expr ) => {
        $crate::memlayout::CLINT + 0x4000 + 8 * ($hartid)
    };
}
pub const CLINT_MTIME: u64 = CLINT + 0xBFF8; // cycles since boot.

// the kernel expects there to be RAM
// for use by the kernel and user pages
// from physical address DRAM_BASE to PHYSTOP.
pub const KERNBASE: usize = 0x80000000;
pub const PHYSTOP: usize = KERNBASE + PKE_MAX_ALLOWABLE_RAM;

// map the trampoline page to the highest address,
// in both user and kernel space.
pub const TRAMPOLINE: usize = MAXVA - PGSIZE;

// map kernel stacks beneath the trampoline,
// each surrounded by invalid guard pages.
// --------
// In our rust approach, it's quite easy to exhaust the one-page kernel stack,
// because we would intentionally or not to use the rust core lib to simplify
// the code.
// However once the sp register exceeds the process stack boundary
// and point to an illegal virtual address, then the risc-v will trap into an
// exception, with scause = 0xf (Store/AMO page fault) and store the illegal
// address into the stval.
// Therefore, we extend the kernel stack to two-pages, and still, with one guard
// page. Then each process will hold three pages in total for their kernel stack.
#[macro_export]
macro_rules! KSTACK {
    ( $p:expr ) => {
        $crate::memlayout::TRAMPOLINE - (($p) + 1) * 3 * $crate::riscv::PGSIZE
    };
}

// User memory layout.
// Address zero first:
//   text
//   original data and bss
//   fixed-size stack
//   expandable heap
//   ...
//   TRAPFRAME (p->trapframe, used by the trampoline)
//   TRAMPOLINE (the same page as in the kernel)
pub const TRAPFRAME: usize = TRAMPOLINE - PGSIZE;

// One guard page below the trapframe, then the (single-page, fixed-size)
// user stack grows down from here.
pub const USER_STACK_TOP: usize = TRAPFRAME - PGSIZE;

// Base of the user heap, both the naive page-granular allocator and the
// byte-granular better-malloc directories. Chosen well clear of where a
// small ELF image loads (near address zero) with plenty of headroom
// before the stack.
pub const USER_FREE_ADDRESS_START: usize = 0x0020_0000;
