#![no_std]
#![no_main]
#![feature(fn_align)]

use core::{
    hint,
    sync::atomic::{AtomicBool, Ordering},
};

pub(crate) use moss_params as param;

mod console;
mod cpu;
mod error;
mod file;
mod fs;
mod interrupt;
mod memory;
mod proc;
mod start;
mod sync;
mod syscall;

// start() jumps here in supervisor mode on all harts.
extern "C" fn main() -> ! {
    static STARTED: AtomicBool = AtomicBool::new(false);

    if cpu::id() == 0 {
        console::init();
        println!();
        println!("moss kernel is booting");
        println!();
        memory::page::init(); // physical frame allocator
        memory::vm_kernel::init(); // create kernel page table
        memory::vm_kernel::init_hart(); // turn on paging
        proc::init(); // process table
        interrupt::trap::init_hart(); // install kernel trap vector
        interrupt::plic::init(); // set up interrupt controller
        interrupt::plic::init_hart(); // ask PLIC for device interrupts
        fs::block_io::init(); // buffer cache
        fs::virtio_disk::init(); // emulated hard disk
        proc::user_init(); // first user process

        STARTED.store(true, Ordering::Release);
    } else {
        while !STARTED.load(Ordering::Acquire) {
            hint::spin_loop();
        }
        println!("hart {} starting", cpu::id());
        memory::vm_kernel::init_hart(); // turn on paging
        interrupt::trap::init_hart(); // install kernel trap vector
        interrupt::plic::init_hart(); // ask PLIC for device interrupts
    }

    proc::scheduler::schedule();
}
