//! Process-related system calls.

use crate::{
    error::KernelError,
    interrupt::timer,
    proc::{self, Proc, ProcId, ProcPrivateData},
};

use super::{arg_addr, arg_int};

pub fn fork(p: &'static Proc, private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    proc::fork(p, private).map(|pid| pid.get() as usize)
}

pub fn exit(p: &'static Proc, private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    let status = arg_int(private, 0) as i32;
    proc::exit(p, status)
}

pub fn wait(p: &'static Proc, private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    let addr = arg_addr(private, 0)?;
    proc::wait(p, private, addr).map(|pid| pid.get() as usize)
}

pub fn kill(_p: &'static Proc, private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    let pid = arg_int(private, 0) as i32;
    proc::kill(ProcId::new(pid)).map(|()| 0)
}

pub fn getpid(p: &'static Proc, _private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    Ok(p.shared().lock().pid().get() as usize)
}

pub fn sbrk(_p: &'static Proc, private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    let n = arg_int(private, 0) as isize;
    let old_size = private.size();
    proc::grow(private, n)?;
    Ok(old_size)
}

pub fn sleep(_p: &'static Proc, private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    let n = arg_int(private, 0) as u64;

    let mut ticks = timer::TICKS.lock();
    let start = *ticks;
    while (*ticks).wrapping_sub(start) < n {
        if proc::current_killed() {
            return Err(KernelError::ProcessKilled);
        }
        ticks = timer::TICKS_UPDATED.wait(ticks);
    }
    Ok(0)
}

pub fn uptime(_p: &'static Proc, _private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    Ok(*timer::TICKS.lock() as usize)
}
