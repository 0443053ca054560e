//! System call dispatch and argument fetching.
//!
//! The call number arrives in a7, arguments in a0..a5, and the result
//! goes back in a0: non-negative on success, usize::MAX (-1) on
//! failure.

use crate::{
    error::KernelError,
    memory::VirtAddr,
    println,
    proc::{Proc, ProcPrivateData},
};

mod file;
mod proc;

pub const SYS_FORK: usize = 1;
pub const SYS_EXIT: usize = 2;
pub const SYS_WAIT: usize = 3;
pub const SYS_PIPE: usize = 4;
pub const SYS_READ: usize = 5;
pub const SYS_KILL: usize = 6;
pub const SYS_EXEC: usize = 7;
pub const SYS_FSTAT: usize = 8;
pub const SYS_CHDIR: usize = 9;
pub const SYS_DUP: usize = 10;
pub const SYS_GETPID: usize = 11;
pub const SYS_SBRK: usize = 12;
pub const SYS_SLEEP: usize = 13;
pub const SYS_UPTIME: usize = 14;
pub const SYS_OPEN: usize = 15;
pub const SYS_WRITE: usize = 16;
pub const SYS_MKNOD: usize = 17;
pub const SYS_UNLINK: usize = 18;
pub const SYS_LINK: usize = 19;
pub const SYS_MKDIR: usize = 20;
pub const SYS_CLOSE: usize = 21;

/// Fetches a usize at `addr` from the current process's memory.
fn fetch_addr(private: &ProcPrivateData, addr: VirtAddr) -> Result<usize, KernelError> {
    private.pagetable().copy_in::<usize>(addr)
}

/// Fetches the NUL-terminated string at `addr`; returns its length.
fn fetch_str(
    private: &ProcPrivateData,
    addr: VirtAddr,
    buf: &mut [u8],
) -> Result<usize, KernelError> {
    private.pagetable().copy_in_str(buf, addr)
}

fn arg_raw(private: &ProcPrivateData, n: usize) -> usize {
    let tf = private.trapframe();
    let v = match n {
        0 => tf.a0,
        1 => tf.a1,
        2 => tf.a2,
        3 => tf.a3,
        4 => tf.a4,
        5 => tf.a5,
        _ => panic!("bad syscall argument index"),
    };
    v as usize
}

/// Fetches the nth word-sized system call argument.
fn arg_int(private: &ProcPrivateData, n: usize) -> usize {
    arg_raw(private, n)
}

/// Fetches the nth argument as a user virtual address.
///
/// The address is range-checked here; whether it is mapped is checked
/// by the eventual copy.
fn arg_addr(private: &ProcPrivateData, n: usize) -> Result<VirtAddr, KernelError> {
    VirtAddr::new(arg_int(private, n))
}

/// Fetches the nth argument as a NUL-terminated string, copied into
/// `buf`.
fn arg_str<'a>(
    private: &ProcPrivateData,
    n: usize,
    buf: &'a mut [u8],
) -> Result<&'a [u8], KernelError> {
    let addr = arg_addr(private, n)?;
    let len = fetch_str(private, addr, buf)?;
    Ok(&buf[..len])
}

/// Decodes and runs one system call, storing the result in a0.
pub fn dispatch(p: &'static Proc, private: &mut ProcPrivateData) {
    let n = private.trapframe().a7 as usize;

    let res = match n {
        SYS_FORK => self::proc::fork(p, private),
        SYS_EXIT => self::proc::exit(p, private),
        SYS_WAIT => self::proc::wait(p, private),
        SYS_PIPE => self::file::pipe(p, private),
        SYS_READ => self::file::read(p, private),
        SYS_KILL => self::proc::kill(p, private),
        SYS_EXEC => self::file::exec(p, private),
        SYS_FSTAT => self::file::fstat(p, private),
        SYS_CHDIR => self::file::chdir(p, private),
        SYS_DUP => self::file::dup(p, private),
        SYS_GETPID => self::proc::getpid(p, private),
        SYS_SBRK => self::proc::sbrk(p, private),
        SYS_SLEEP => self::proc::sleep(p, private),
        SYS_UPTIME => self::proc::uptime(p, private),
        SYS_OPEN => self::file::open(p, private),
        SYS_WRITE => self::file::write(p, private),
        SYS_MKNOD => self::file::mknod(p, private),
        SYS_UNLINK => self::file::unlink(p, private),
        SYS_LINK => self::file::link(p, private),
        SYS_MKDIR => self::file::mkdir(p, private),
        SYS_CLOSE => self::file::close(p, private),
        _ => {
            let shared = p.shared().lock();
            println!("{} {}: unknown sys call {n}", shared.pid(), shared.name());
            drop(shared);
            private.trapframe_mut().a0 = u64::MAX;
            return;
        }
    };

    private.trapframe_mut().a0 = match res {
        Ok(val) => val as u64,
        Err(_) => u64::MAX,
    };
}
