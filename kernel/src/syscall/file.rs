//! File-related system calls.

use arrayvec::ArrayVec;
use bitflags::bitflags;
use moss_fs_types::{T_DEVICE, T_DIR, T_FILE};

use crate::{
    error::KernelError,
    file::File,
    fs::{self, log::Tx},
    memory::{PAGE_SIZE, VirtAddr, page},
    param::{MAX_ARG, MAX_PATH, NDEV},
    proc::{Proc, ProcPrivateData, exec},
};

use super::{arg_addr, arg_int, arg_str, fetch_addr, fetch_str};

bitflags! {
    /// open(2) mode flags. Read-only is the absence of all of them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const WRONLY = 0x001;
        const RDWR = 0x002;
        const CREATE = 0x200;
        const TRUNC = 0x400;
    }
}

pub fn dup(_p: &'static Proc, private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    let fd = arg_int(private, 0);
    let f = private.ofile(fd)?.dup();
    match private.add_ofile(f) {
        Ok(fd) => Ok(fd),
        Err(f) => {
            f.close();
            Err(KernelError::TooManyOpenFiles)
        }
    }
}

pub fn read(_p: &'static Proc, private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    let addr = arg_addr(private, 1)?;
    let n = arg_int(private, 2);
    let f = private.ofile(arg_int(private, 0))?;
    f.read(private, addr, n)
}

pub fn write(_p: &'static Proc, private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    let addr = arg_addr(private, 1)?;
    let n = arg_int(private, 2);
    let f = private.ofile(arg_int(private, 0))?;
    f.write(private, addr, n)
}

pub fn close(_p: &'static Proc, private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    let fd = arg_int(private, 0);
    private.take_ofile(fd)?.close();
    Ok(0)
}

pub fn fstat(_p: &'static Proc, private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    let addr = arg_addr(private, 1)?;
    let f = private.ofile(arg_int(private, 0))?;
    f.stat(private, addr)?;
    Ok(0)
}

/// Creates the path `new` as a link to the same inode as `old`.
pub fn link(_p: &'static Proc, private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    let mut old_buf = [0; MAX_PATH];
    let mut new_buf = [0; MAX_PATH];
    let old = arg_str(private, 0, &mut old_buf)?;
    let new = arg_str(private, 1, &mut new_buf)?;

    let tx = fs::log::begin_tx();
    let res = fs::ops::link(&tx, private, old, new);
    tx.end();
    res.map(|()| 0)
}

pub fn unlink(_p: &'static Proc, private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    let mut path_buf = [0; MAX_PATH];
    let path = arg_str(private, 0, &mut path_buf)?;

    let tx = fs::log::begin_tx();
    let res = fs::ops::unlink(&tx, private, path);
    tx.end();
    res.map(|()| 0)
}

pub fn open(_p: &'static Proc, private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    let mut path_buf = [0; MAX_PATH];
    let path = arg_str(private, 0, &mut path_buf)?;
    let flags = OpenFlags::from_bits_retain(arg_int(private, 1) as u32);

    let tx = fs::log::begin_tx();
    let res = open_impl(&tx, private, path, flags);
    tx.end();
    res
}

fn open_impl(
    tx: &Tx,
    private: &mut ProcPrivateData,
    path: &[u8],
    flags: OpenFlags,
) -> Result<usize, KernelError> {
    let ip = if flags.contains(OpenFlags::CREATE) {
        fs::ops::create(tx, private, path, T_FILE, 0, 0)?
    } else {
        fs::path::resolve(tx, private, path)?
    };

    let mut lip = ip.lock(tx);

    // directories open read-only; device majors must be in range.
    if lip.ty() == T_DIR && !flags.is_empty() {
        drop(lip);
        ip.put(tx);
        return Err(KernelError::IsADirectory);
    }
    if lip.ty() == T_DEVICE && !usize::try_from(lip.major()).is_ok_and(|m| m < NDEV) {
        drop(lip);
        ip.put(tx);
        return Err(KernelError::NoDevice);
    }

    // reserve the descriptor up front, so nothing fails after the
    // file object takes over the inode reference.
    if !private.has_free_ofile() {
        drop(lip);
        ip.put(tx);
        return Err(KernelError::TooManyOpenFiles);
    }

    if flags.contains(OpenFlags::TRUNC) && lip.ty() == T_FILE {
        lip.truncate(tx);
    }

    let ty = lip.ty();
    let major = lip.major();
    drop(lip);

    let readable = !flags.contains(OpenFlags::WRONLY);
    let writable = flags.contains(OpenFlags::WRONLY) || flags.contains(OpenFlags::RDWR);
    let file = if ty == T_DEVICE {
        File::new_device(major, ip, readable, writable)
    } else {
        File::new_inode(ip, readable, writable)
    };

    match file {
        Ok(f) => Ok(private.add_ofile(f).ok().expect("descriptor was reserved")),
        Err((ip, e)) => {
            ip.put(tx);
            Err(e)
        }
    }
}

pub fn mkdir(_p: &'static Proc, private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    let mut path_buf = [0; MAX_PATH];
    let path = arg_str(private, 0, &mut path_buf)?;

    let tx = fs::log::begin_tx();
    let res = fs::ops::create(&tx, private, path, T_DIR, 0, 0);
    let res = res.map(|ip| {
        ip.put(&tx);
        0
    });
    tx.end();
    res
}

pub fn mknod(_p: &'static Proc, private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    let mut path_buf = [0; MAX_PATH];
    let path = arg_str(private, 0, &mut path_buf)?;
    let major = arg_int(private, 1) as i16;
    let minor = arg_int(private, 2) as i16;

    let tx = fs::log::begin_tx();
    let res = fs::ops::create(&tx, private, path, T_DEVICE, major, minor);
    let res = res.map(|ip| {
        ip.put(&tx);
        0
    });
    tx.end();
    res
}

pub fn chdir(_p: &'static Proc, private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    let mut path_buf = [0; MAX_PATH];
    let path = arg_str(private, 0, &mut path_buf)?;

    let tx = fs::log::begin_tx();
    let res = (|| {
        let ip = fs::path::resolve(&tx, private, path)?;
        let lip = ip.lock(&tx);
        if lip.ty() != T_DIR {
            drop(lip);
            ip.put(&tx);
            return Err(KernelError::NotADirectory);
        }
        drop(lip);
        let old = private.replace_cwd(ip);
        old.put(&tx);
        Ok(0)
    })();
    tx.end();
    res
}

pub fn exec(p: &'static Proc, private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    let mut path_buf = [0; MAX_PATH];
    let path = arg_str(private, 0, &mut path_buf)?;
    let uargv = arg_addr(private, 1)?;

    // copy each argument string into its own frame.
    let mut argv = ArrayVec::<_, MAX_ARG>::new();
    let res = (|| {
        for i in 0.. {
            let uarg = fetch_addr(private, uargv.byte_add(i * size_of::<usize>())?)?;
            if uarg == 0 {
                break;
            }
            if argv.is_full() {
                return Err(KernelError::ArgumentListTooLong);
            }
            let frame = page::alloc_frame()?;
            argv.push(frame);
            let buf =
                unsafe { core::slice::from_raw_parts_mut(frame.as_ptr(), PAGE_SIZE) };
            fetch_str(private, VirtAddr::new(uarg)?, buf)?;
        }
        Ok(())
    })();

    let res = res.and_then(|()| exec::exec(p, private, path, &argv));

    for frame in &argv {
        unsafe {
            page::free_frame(*frame);
        }
    }
    res
}

pub fn pipe(_p: &'static Proc, private: &mut ProcPrivateData) -> Result<usize, KernelError> {
    let fd_array = arg_addr(private, 0)?;

    let (rf, wf) = File::new_pipe()?;

    let rfd = match private.add_ofile(rf) {
        Ok(fd) => fd,
        Err(rf) => {
            rf.close();
            wf.close();
            return Err(KernelError::TooManyOpenFiles);
        }
    };
    let wfd = match private.add_ofile(wf) {
        Ok(fd) => fd,
        Err(wf) => {
            wf.close();
            private.take_ofile(rfd).unwrap().close();
            return Err(KernelError::TooManyOpenFiles);
        }
    };

    let fds = [rfd as i32, wfd as i32];
    if private.pagetable().copy_out(fd_array, &fds).is_err() {
        private.take_ofile(rfd).unwrap().close();
        private.take_ofile(wfd).unwrap().close();
        return Err(KernelError::InaccessibleMemory(fd_array));
    }

    Ok(0)
}
