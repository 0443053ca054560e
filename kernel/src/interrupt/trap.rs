use core::mem;

use riscv::{
    interrupt::{
        Trap,
        supervisor::{Exception, Interrupt},
    },
    register::{
        satp, scause, sepc,
        sstatus::{self, SPP},
        stval,
        stvec::{self, Stvec, TrapMode},
    },
};

use super::{kernel_vec, plic, timer, trampoline};
use crate::{
    console::uart,
    cpu, fs, interrupt,
    memory::{
        PAGE_SIZE,
        layout::{UART0_IRQ, VIRTIO0_IRQ},
    },
    println,
    proc::{self, Proc},
    syscall,
};

fn write_stvec(addr: usize) {
    let mut stvec = Stvec::from_bits(0);
    stvec.set_address(addr);
    stvec.set_trap_mode(TrapMode::Direct);
    unsafe {
        stvec::write(stvec);
    }
}

/// Installs the supervisor trap vector.
pub fn init_hart() {
    write_stvec(kernel_vec::kernel_vec as usize);
}

/// Handles an interrupt, exception, or system call from user space.
///
/// Called from the trampoline.
extern "C" fn trap_user() {
    assert_eq!(sstatus::read().spp(), SPP::User, "trap not from user mode");

    // now in the kernel: send traps to trap_kernel().
    write_stvec(kernel_vec::kernel_vec as usize);

    let p = Proc::current();
    let private = unsafe { p.private_mut() };

    // save the user program counter.
    private.trapframe_mut().epc = sepc::read() as u64;

    let scause: Trap<Interrupt, Exception> = scause::read().cause().try_into().unwrap();
    let mut which_dev = IntrKind::NotRecognized;
    match scause {
        Trap::Exception(Exception::UserEnvCall) => {
            // system call
            if p.shared().lock().killed() {
                proc::exit(p, -1);
            }

            // sepc points to the ecall instruction, but we want to
            // return to the next instruction.
            private.trapframe_mut().epc += 4;

            // an interrupt would clobber sepc, scause, and sstatus, so
            // enable only now that we're done with those registers.
            interrupt::enable();

            syscall::dispatch(p, private);
        }
        Trap::Exception(e) => {
            let shared = p.shared().lock();
            println!(
                "usertrap: exception {e:?} pid={} name={}",
                shared.pid(),
                shared.name()
            );
            println!(
                "          sepc={:#x} stval={:#x}",
                sepc::read(),
                stval::read()
            );
            drop(shared);
            p.shared().lock().kill();
        }
        Trap::Interrupt(int) => {
            which_dev = handle_dev_interrupt(int);
            if which_dev == IntrKind::NotRecognized {
                let shared = p.shared().lock();
                println!(
                    "usertrap: unexpected interrupt {int:?} pid={} name={}",
                    shared.pid(),
                    shared.name()
                );
                drop(shared);
                p.shared().lock().kill();
            }
        }
    }

    if p.shared().lock().killed() {
        proc::exit(p, -1);
    }

    // give up the CPU if this was a timer interrupt.
    if which_dev == IntrKind::Timer {
        proc::yield_(p);
    }

    trap_user_ret(p)
}

/// Returns to user space.
pub fn trap_user_ret(p: &Proc) -> ! {
    let private = unsafe { p.private_mut() };

    // we're about to switch the destination of traps from
    // trap_kernel() to trap_user(), so turn off interrupts until we're
    // back in user space where trap_user() is correct.
    interrupt::disable();

    // send syscalls, interrupts, and exceptions to user_vec in the
    // trampoline.
    write_stvec(trampoline::user_vec_addr().addr());

    // set up trapframe values that user_vec will need when the process
    // next traps into the kernel.
    let kstack = private.kstack();
    let tf = private.trapframe_mut();
    tf.kernel_satp = satp::read().bits() as u64;
    tf.kernel_sp = (kstack.addr() + PAGE_SIZE) as u64;
    tf.kernel_trap = trap_user as usize as u64;
    tf.kernel_hartid = cpu::id() as u64;

    // set up the registers the trampoline's sret will use to get to
    // user space: previous privilege User, interrupts on in user mode,
    // and the saved user pc.
    unsafe {
        sstatus::set_spp(SPP::User);
        sstatus::set_spie();
        sepc::write(private.trapframe().epc as usize);
    }

    // tell the trampoline the user page table to switch to.
    let satp = private.pagetable().satp();

    // jump to user_ret in the trampoline at the top of memory, which
    // switches page tables, restores user registers, and srets.
    let user_ret = trampoline::user_ret_addr();
    unsafe {
        let f: extern "C" fn(usize) -> ! = mem::transmute(user_ret.addr());
        f(satp)
    }
}

/// Interrupts and exceptions from kernel code come here via
/// kernel_vec, on the current kernel stack.
pub extern "C" fn trap_kernel() {
    let sepc = sepc::read();
    let sstatus = sstatus::read();
    let scause: Trap<Interrupt, Exception> = scause::read().cause().try_into().unwrap();

    assert_eq!(sstatus.spp(), SPP::Supervisor, "trap not from supervisor");
    assert!(!interrupt::is_enabled());

    let which_dev = match scause {
        Trap::Exception(e) => {
            println!("kerneltrap: exception {e:?}");
            println!("            sepc={sepc:#x} stval={:#x}", stval::read());
            panic!("unexpected trap from kernel");
        }
        Trap::Interrupt(int) => {
            let kind = handle_dev_interrupt(int);
            if kind == IntrKind::NotRecognized {
                println!("kerneltrap: interrupt {int:?}");
                println!("            sepc={sepc:#x} stval={:#x}", stval::read());
                panic!("unexpected interrupt from kernel");
            }
            kind
        }
    };

    if which_dev == IntrKind::Timer {
        // give up the CPU if a process was running.
        if let Some(p) = Proc::try_current() {
            proc::yield_(p);
        }
    }

    // yield_() may have caused traps on other processes, so restore the
    // trap registers for kernel_vec's sret.
    unsafe {
        sepc::write(sepc);
        sstatus::write(sstatus);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IntrKind {
    Timer,
    Other,
    NotRecognized,
}

/// Checks what kind of interrupt arrived and dispatches it.
fn handle_dev_interrupt(int: Interrupt) -> IntrKind {
    match int {
        Interrupt::SupervisorSoft => IntrKind::NotRecognized,
        Interrupt::SupervisorTimer => {
            timer::handle_interrupt();
            IntrKind::Timer
        }
        Interrupt::SupervisorExternal => {
            // a device interrupt, via the PLIC.
            let irq = plic::claim();

            if irq == UART0_IRQ {
                uart::handle_interrupt();
            } else if irq == VIRTIO0_IRQ {
                fs::virtio_disk::handle_interrupt();
            } else if irq > 0 {
                println!("unexpected interrupt irq={irq}");
            }

            // the PLIC allows each device at most one outstanding
            // interrupt; tell it this one is handled.
            if irq > 0 {
                plic::complete(irq);
            }
            IntrKind::Other
        }
    }
}
