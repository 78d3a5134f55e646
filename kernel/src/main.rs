#![cfg_attr(not(test), no_std)]
#![no_main]
#![feature(panic_info_message)]
#![feature(strict_provenance)]
#![feature(const_mut_refs)]

mod asm;
mod console;
mod elf;
mod error;
mod log;
mod memlayout;
mod param;
mod pmm;
mod printf;
mod proc;
mod riscv;
mod sem;
mod spinlock;
mod start;
mod string;
mod syscall;
mod trap;
mod uart;
mod vfs;
mod vm;

use core::sync::atomic::{AtomicBool, Ordering};

use crate::riscv::{r_sie, r_tp, w_sie, SIE_SSIE, SIE_STIE};

#[no_mangle]
extern "C" fn eh_personality() {}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    printf!("Aborting: \n");
    if let Some(p) = info.location() {
        printf!(
            "line {}, file {}: {}\n",
            p.line(),
            p.file(),
            info.message().unwrap()
        );
    } else {
        printf!("no information available.\n");
    }
    abort();
}

#[no_mangle]
extern "C" fn abort() -> ! {
    loop {
        unsafe { core::arch::asm!("wfi") }
    }
}

/// QEMU `virt` machine's SiFive test-finisher MMIO device: writing 0x5555
/// to this address powers the machine off cleanly. There's no SBI or
/// host layer in this design to delegate shutdown to, so `sched::schedule`
/// calls straight into the device when a hart runs out of work.
const TEST_FINISHER: usize = 0x10_0000;
const FINISHER_PASS: u32 = 0x5555;

pub fn sbi_shutdown() -> ! {
    unsafe {
        (TEST_FINISHER as *mut u32).write_volatile(FINISHER_PASS);
    }
    loop {
        unsafe { core::arch::asm!("wfi") }
    }
}

static STARTED: AtomicBool = AtomicBool::new(false);

/// Tiny hand-assembled RISC-V program for the very first process: loads
/// the `exit` syscall number into `a0`, traps in, then spins (in case
/// `exit` is ever reached again after a reschedule race). Stands in for
/// a real `init` binary, which this design has no on-disk toolchain
/// output to embed.
const INIT_CODE: [u8; 12] = {
    let addi_a0_2: u32 = 0x0020_0513; // addi a0, zero, 2  (2 == SYS_EXIT)
    let ecall: u32 = 0x0000_0073;
    let self_jump: u32 = 0x0000_006f; // jal x0, 0
    let mut bytes = [0u8; 12];
    let mut i = 0;
    let words = [addi_a0_2, ecall, self_jump];
    while i < 3 {
        let w = words[i].to_le_bytes();
        bytes[i * 4] = w[0];
        bytes[i * 4 + 1] = w[1];
        bytes[i * 4 + 2] = w[2];
        bytes[i * 4 + 3] = w[3];
        i += 1;
    }
    bytes
};

fn userinit(hart: usize) {
    proc::init_proc_pool(hart);
    proc::pool(hart).with_state(|mut state| {
        let pid =
            proc::lifecycle::alloc_process(hart, state.procs).expect("userinit: pool exhausted");
        {
            let p = &mut state.procs[pid.0 as usize];
            vm::uvmfirst(p.pagetable(), &INIT_CODE);
            let idx = p.total_mapped_region;
            p.mapped_info[idx] = proc::MappedRegion {
                va: 0,
                npages: 1,
                seg_type: proc::SegmentType::Code,
            };
            p.total_mapped_region += 1;
            p.trapframe().epc = 0;
        }
        sched::insert_to_ready_queue(&mut state, pid);
    });
}

use crate::proc::sched;

#[no_mangle]
pub extern "C" fn kmain() {
    let hart = r_tp();

    if hart == 0 {
        console::CONSOLE.init();
        log::init(::log::LevelFilter::Info);
        printf!("\nkernel is booting...\n\n");

        pmm::PMM.init();
        ::log::info!("physical memory initialized");

        vm::kvminit();
        ::log::info!("kernel page table built");

        vm::kvminithart();
        ::log::info!("paging enabled");

        trap::trapinithart();
        ::log::info!("trap vector installed");

        userinit(hart);
        ::log::info!("first process queued");

        core::sync::atomic::fence(Ordering::SeqCst);
        STARTED.store(true, Ordering::Relaxed);
        printf!("\nboot complete\n");
    } else {
        while !STARTED.load(Ordering::Relaxed) {}
        core::sync::atomic::fence(Ordering::SeqCst);

        vm::kvminithart();
        trap::trapinithart();
        proc::init_proc_pool(hart);
    }

    w_sie(r_sie() | SIE_STIE | SIE_SSIE);
    sched::schedule(hart)
}
