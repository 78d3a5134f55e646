//! Trap dispatch: every synchronous exception or timer interrupt taken
//! from user mode lands in [`usertrap`], which multiplexes on `scause`
//! the way a single-trap-at-a-time kernel can -- there's no nested
//! kernel preemption here, so a trap runs to completion (ending in a
//! syscall return, a scheduling decision, or a panic) before the hart
//! does anything else.

use crate::memlayout::TRAPFRAME;
use crate::proc::sched;
use crate::proc::{self, Pid};
use crate::riscv::{
    r_satp, r_scause, r_sip, r_sstatus, r_stval, r_tp, w_sepc, w_sip, w_sstatus, w_stvec, PGSIZE,
    SCAUSE_LOAD_PAGE_FAULT, SCAUSE_SOFTWARE_INTERRUPT, SCAUSE_STORE_PAGE_FAULT,
    SCAUSE_TIMER_INTERRUPT, SCAUSE_USER_ECALL, SIP_SSIP, SSTATUS_SPIE, SSTATUS_SPP,
};
use crate::MAKE_SATP;

extern "C" {
    static trampoline: u8;
    static uservec: u8;
    static userret: u8;
    static kernelvec: u8;
}

/// Physical (kernel-VA) address of the trampoline page, needed by
/// `proc::lifecycle` to map it into every fresh process's page table at
/// the fixed `TRAMPOLINE` virtual address.
pub fn trampoline_pa() -> usize {
    (unsafe { &trampoline }) as *const u8 as usize
}

fn trampoline_addr() -> usize {
    trampoline_pa()
}

fn trampoline_uservec() -> usize {
    TRAMPOLINE + (unsafe { &uservec }) as *const u8 as usize - trampoline_addr()
}

fn trampoline_userret() -> usize {
    TRAMPOLINE + (unsafe { &userret }) as *const u8 as usize - trampoline_addr()
}

/// Installs the kernel-mode trap vector. Called once per hart at boot,
/// before the first process is scheduled.
pub fn trapinithart() {
    w_stvec((unsafe { &kernelvec }) as *const u8 as usize);
}

/// Traps taken while the hart is already executing kernel code. This
/// design never expects one: the kernel doesn't touch unmapped memory
/// and runs with interrupts off outside of user-mode execution.
#[no_mangle]
extern "C" fn kerneltrap_panic() -> ! {
    panic!(
        "kerneltrap: unexpected trap, scause={:#x} stval={:#x}",
        r_scause(),
        r_stval()
    );
}

/// Entry point the trampoline's `uservec` jumps to after saving the
/// interrupted user registers into the current process's trapframe.
#[no_mangle]
extern "C" fn usertrap() -> ! {
    let hart = r_tp();
    w_stvec((unsafe { &kernelvec }) as *const u8 as usize);

    let pid = proc::current_pid(hart).expect("usertrap: no current process");
    let scause = r_scause();

    if scause == SCAUSE_USER_ECALL {
        proc::pool(hart).with_lock(|procs| {
            let tf = procs[pid.0 as usize].trapframe();
            tf.epc += 4; // resume after the ecall
        });
        crate::syscall::dispatch(hart, pid);
        switch_to(hart, proc::current_pid(hart).unwrap_or(pid))
    } else if scause == SCAUSE_TIMER_INTERRUPT || scause == SCAUSE_SOFTWARE_INTERRUPT {
        if scause == SCAUSE_SOFTWARE_INTERRUPT {
            w_sip(r_sip() & !SIP_SSIP);
        }
        sched::tick(hart)
    } else if scause == SCAUSE_STORE_PAGE_FAULT || scause == SCAUSE_LOAD_PAGE_FAULT {
        if handle_page_fault(hart, pid, scause) {
            switch_to(hart, proc::current_pid(hart).unwrap_or(pid))
        } else {
            // Unsatisfiable page fault outside CoW/stack growth: process-fatal,
            // not kernel-fatal -- zombie the offender and move on, the same
            // path exec's ELF-load failure takes.
            ::log::warn!(
                "usertrap: unhandled page fault, scause={:#x} stval={:#x} pid={}, zombieing process",
                scause,
                r_stval(),
                pid.0
            );
            proc::pool(hart).with_state(|mut state| {
                proc::lifecycle::free_process(&mut state, pid);
            });
            sched::schedule(hart)
        }
    } else {
        panic!(
            "usertrap: unexpected scause={:#x} stval={:#x} pid={}",
            scause,
            r_stval(),
            pid.0
        );
    }
}

/// Tries the CoW and lazy-stack-growth handlers in turn. Returns whether
/// either claimed the fault; an unclaimed fault is process-fatal, handled
/// by the caller.
fn handle_page_fault(hart: usize, pid: Pid, scause: usize) -> bool {
    let stval = r_stval();
    proc::pool(hart).with_lock(|procs| {
        let p = &mut procs[pid.0 as usize];
        let pagetable = p.pagetable();

        if scause == SCAUSE_STORE_PAGE_FAULT && crate::vm::cow_fault(pagetable, stval) {
            return true;
        }

        // Lazy stack growth: a store fault just below the mapped stack
        // page, within one page, grows the stack by one page.
        let stack = p.mapped_info[crate::proc::STACK_SEGMENT_INDEX];
        if stval < stack.va && stack.va - stval <= PGSIZE {
            if let Some(pa) = crate::pmm::PMM.alloc_page() {
                let new_va = stack.va - PGSIZE;
                if crate::vm::mappages(
                    pagetable,
                    new_va,
                    pa,
                    PGSIZE,
                    crate::riscv::prot_to_type(
                        crate::riscv::PROT_READ | crate::riscv::PROT_WRITE,
                        true,
                    ),
                )
                .is_ok()
                {
                    p.mapped_info[crate::proc::STACK_SEGMENT_INDEX].va = new_va;
                    p.mapped_info[crate::proc::STACK_SEGMENT_INDEX].npages += 1;
                    return true;
                }
                crate::pmm::PMM.free_page(pa);
            }
        }
        false
    })
}

/// Installs `pid` as the hart's current process and transfers control to
/// it in user mode via the trampoline's `userret`. Never returns.
pub fn switch_to(hart: usize, pid: Pid) -> ! {
    proc::set_current(hart, Some(pid));

    w_stvec(trampoline_uservec());

    let (epc, pagetable_pa) = proc::pool(hart).with_lock(|procs| {
        let p = &mut procs[pid.0 as usize];
        let tf = p.trapframe();
        tf.kernel_sp = (p.kstack + PGSIZE) as u64;
        tf.kernel_satp = r_satp() as u64;
        tf.kernel_trap = usertrap as usize as u64;
        tf.tp = hart as u64;
        (tf.epc, p.pagetable)
    });

    let mut x = r_sstatus();
    x &= !SSTATUS_SPP;
    x |= SSTATUS_SPIE;
    w_sstatus(x);
    w_sepc(epc as usize);

    let satp = MAKE_SATP!(pagetable_pa);

    // SAFETY: `userret` is mapped at `trampoline_userret()` in both the
    // currently-active kernel page table and the user page table we're
    // about to switch to, so jumping through it survives the `satp`
    // write inside.
    unsafe {
        let userret_fn: extern "C" fn(usize, usize) = core::mem::transmute(trampoline_userret());
        userret_fn(TRAPFRAME, satp);
    }
    unreachable!("userret does not return")
}
