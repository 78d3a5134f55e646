//! Hand-written assembly glue the Rust code can't express: the boot
//! entry point, the trap trampoline (`uservec`/`userret`), and the
//! kernel-mode trap vector.
//!
//! These mirror the shape every RISC-V teaching kernel in this lineage
//! uses -- a scratch trapframe reachable without clobbering any
//! register, a fixed high virtual address shared by every page table so
//! the `satp` switch doesn't yank the rug out from under the program
//! counter -- rather than any one kernel's literal `.S` file.

use core::arch::global_asm;

global_asm!(
    r#"
.section .text.entry
.global _entry
_entry:
        # sp = stack0 + (hartid + 1) * 4096
        la sp, stack0
        li a0, 4096
        csrr a1, mhartid
        addi a1, a1, 1
        mul a0, a0, a1
        add sp, sp, a0
        call start
spin:
        wfi
        j spin
"#
);

// Trap trampoline: mapped at the same virtual address (TRAMPOLINE) in
// every page table, kernel and user alike, so switching `satp` never
// invalidates the instruction stream mid-sequence. `uservec` saves the
// interrupted user registers into the process's trapframe (whose user
// virtual address is passed in via `sscratch`, set by `usertrapret`)
// then jumps to the Rust trap handler named in the trapframe's
// `kernel_trap` field. `userret` is the mirror image, called by Rust
// code with the trapframe and the target `satp` already prepared.
global_asm!(
    r#"
.section trampsec
.global trampoline
trampoline:
.global uservec
uservec:
        # swap a0 and sscratch so a0 points at the trapframe
        csrrw a0, sscratch, a0
        sd ra,   0(a0)
        sd sp,   8(a0)
        sd gp,   16(a0)
        sd tp,   24(a0)
        sd t0,   32(a0)
        sd t1,   40(a0)
        sd t2,   48(a0)
        sd s0,   56(a0)
        sd s1,   64(a0)
        sd a1,   80(a0)
        sd a2,   88(a0)
        sd a3,   96(a0)
        sd a4,   104(a0)
        sd a5,   112(a0)
        sd a6,   120(a0)
        sd a7,   128(a0)
        sd s2,   136(a0)
        sd s3,   144(a0)
        sd s4,   152(a0)
        sd s5,   160(a0)
        sd s6,   168(a0)
        sd s7,   176(a0)
        sd s8,   184(a0)
        sd s9,   192(a0)
        sd s10,  200(a0)
        sd s11,  208(a0)
        sd t3,   216(a0)
        sd t4,   224(a0)
        sd t5,   232(a0)
        sd t6,   240(a0)

        # the real a0 (syscall arg / old sscratch) was stashed by csrrw;
        # pull it back out and save it too.
        csrr t0, sscratch
        sd t0, 72(a0)

        ld sp,  248(a0)   # kernel_sp
        ld tp,  24(a0)    # keep hart id live across the switch
        ld t1,  256(a0)   # kernel_trap
        ld t0,  272(a0)   # kernel_satp

        csrw sscratch, a0

        sfence.vma zero, zero
        csrw satp, t0
        sfence.vma zero, zero

        jr t1

.global userret
userret:
        # a0 = trapframe user VA, a1 = user satp
        sfence.vma zero, zero
        csrw satp, a1
        sfence.vma zero, zero

        csrw sscratch, a0

        ld ra,   0(a0)
        ld gp,   16(a0)
        ld t0,   32(a0)
        ld t1,   40(a0)
        ld t2,   48(a0)
        ld s0,   56(a0)
        ld s1,   64(a0)
        ld a1,   80(a0)
        ld a2,   88(a0)
        ld a3,   96(a0)
        ld a4,   104(a0)
        ld a5,   112(a0)
        ld a6,   120(a0)
        ld a7,   128(a0)
        ld s2,   136(a0)
        ld s3,   144(a0)
        ld s4,   152(a0)
        ld s5,   160(a0)
        ld s6,   168(a0)
        ld s7,   176(a0)
        ld s8,   184(a0)
        ld s9,   192(a0)
        ld s10,  200(a0)
        ld s11,  208(a0)
        ld t3,   216(a0)
        ld t4,   224(a0)
        ld t5,   232(a0)
        ld t6,   240(a0)
        ld tp,   24(a0)
        ld sp,   8(a0)
        ld a0,   72(a0)

        sret
"#
);

// Traps taken while already in the kernel (a bug in this design -- there
// is no kernel-mode preemption and the kernel never touches unmapped
// memory on purpose) land here instead of silently corrupting state.
global_asm!(
    r#"
.section .text
.global kernelvec
.align 4
kernelvec:
        call kerneltrap_panic
        j kernelvec
"#
);

// M-mode timer trap handler. The CLINT only raises timer interrupts in
// M-mode, so this acks the CLINT (reprograms mtimecmp for the next
// tick), then sets sip.SSIP to forward the tick into S-mode, where
// `usertrap` picks it up as `SCAUSE_SOFTWARE_INTERRUPT`. `mscratch`
// points at this hart's 5-word scratch area: [0..2] register spill
// space, [3] this hart's mtimecmp address, [4] the tick interval.
global_asm!(
    r#"
.section .text
.global timervec
.align 4
timervec:
        csrrw a0, mscratch, a0
        sd a1, 0(a0)
        sd a2, 8(a0)
        sd a3, 16(a0)

        ld a1, 24(a0)
        ld a2, 32(a0)
        ld a3, 0(a1)
        add a3, a3, a2
        sd a3, 0(a1)

        li a1, 2
        csrw sip, a1

        ld a3, 16(a0)
        ld a2, 8(a0)
        ld a1, 0(a0)
        csrrw a0, mscratch, a0

        mret
"#
);
