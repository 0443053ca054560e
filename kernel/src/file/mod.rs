//! Open files: a system-wide table of reference-counted file objects,
//! each a pipe, an inode, or a device.

use core::{
    cell::UnsafeCell,
    mem,
    sync::atomic::{AtomicUsize, Ordering},
};

use moss_fs_types::BLOCK_SIZE;

use crate::{
    error::KernelError,
    fs::{Inode, log},
    memory::VirtAddr,
    param::{MAX_OP_BLOCKS, NFILE},
    proc::ProcPrivateData,
    sync::SpinLock,
};

mod device;
mod pipe;

pub use self::device::{Device, register_device};

/// Serializes reference-count and payload transitions in the file
/// table.
static FTABLE: SpinLock<()> = SpinLock::new(());

static FILES: [FileSlot; NFILE] = [const { FileSlot::new() }; NFILE];

struct FileSlot {
    /// Guarded by FTABLE; while > 0 the slot's payload is immutable.
    refcnt: UnsafeCell<u32>,
    data: UnsafeCell<FileData>,
}

unsafe impl Sync for FileSlot {}

impl FileSlot {
    const fn new() -> Self {
        Self {
            refcnt: UnsafeCell::new(0),
            data: UnsafeCell::new(FileData {
                readable: false,
                writable: false,
                kind: FileKind::None,
            }),
        }
    }
}

struct FileData {
    readable: bool,
    writable: bool,
    kind: FileKind,
}

enum FileKind {
    None,
    Pipe(pipe::Pipe),
    Inode(InodeFile),
    Device(DeviceFile),
}

/// A counted handle on one open file.
///
/// [`File::dup`] takes another reference; [`File::close`] releases
/// one, freeing the payload at zero.
pub struct File {
    slot: &'static FileSlot,
}

unsafe impl Send for File {}
unsafe impl Sync for File {}

/// Claims a free table slot for `data`.
fn alloc(data: FileData) -> Result<File, (FileData, KernelError)> {
    let guard = FTABLE.lock();
    for slot in &FILES {
        let refcnt = unsafe { &mut *slot.refcnt.get() };
        if *refcnt == 0 {
            *refcnt = 1;
            unsafe {
                *slot.data.get() = data;
            }
            drop(guard);
            return Ok(File { slot });
        }
    }
    Err((data, KernelError::TooManyOpenFilesSystem))
}

impl File {
    /// Creates both ends of a new pipe: (read end, write end).
    pub fn new_pipe() -> Result<(File, File), KernelError> {
        pipe::new_pair()
    }

    /// Wraps an inode reference as an open regular file.
    ///
    /// On failure the reference comes back to the caller for putting.
    pub fn new_inode(ip: Inode, readable: bool, writable: bool) -> Result<File, (Inode, KernelError)> {
        alloc(FileData {
            readable,
            writable,
            kind: FileKind::Inode(InodeFile {
                ip,
                off: AtomicUsize::new(0),
            }),
        })
        .map_err(|(data, e)| {
            let FileKind::Inode(f) = data.kind else {
                unreachable!()
            };
            (f.ip, e)
        })
    }

    /// Wraps a device inode as an open device file.
    pub fn new_device(
        major: i16,
        ip: Inode,
        readable: bool,
        writable: bool,
    ) -> Result<File, (Inode, KernelError)> {
        alloc(FileData {
            readable,
            writable,
            kind: FileKind::Device(DeviceFile { major, ip }),
        })
        .map_err(|(data, e)| {
            let FileKind::Device(f) = data.kind else {
                unreachable!()
            };
            (f.ip, e)
        })
    }

    fn data(&self) -> &FileData {
        // the payload is immutable while refcnt > 0.
        unsafe { &*self.slot.data.get() }
    }

    /// Takes another reference to the same open file.
    pub fn dup(&self) -> File {
        let guard = FTABLE.lock();
        unsafe {
            *self.slot.refcnt.get() += 1;
        }
        drop(guard);
        File { slot: self.slot }
    }

    /// Releases one reference; the last close releases the payload
    /// (inside a transaction when it holds an inode).
    pub fn close(self) {
        let guard = FTABLE.lock();
        let refcnt = unsafe { &mut *self.slot.refcnt.get() };
        assert!(*refcnt > 0);
        *refcnt -= 1;
        if *refcnt > 0 {
            return;
        }
        let data = unsafe {
            mem::replace(
                &mut *self.slot.data.get(),
                FileData {
                    readable: false,
                    writable: false,
                    kind: FileKind::None,
                },
            )
        };
        drop(guard);

        match data.kind {
            FileKind::None => {}
            FileKind::Pipe(p) => p.close(data.writable),
            FileKind::Inode(InodeFile { ip, .. }) | FileKind::Device(DeviceFile { ip, .. }) => {
                let tx = log::begin_tx();
                ip.put(&tx);
                tx.end();
            }
        }
    }

    /// Copies the file's metadata to user memory at `addr`.
    pub fn stat(&self, private: &ProcPrivateData, addr: VirtAddr) -> Result<(), KernelError> {
        let ip = match &self.data().kind {
            FileKind::Inode(f) => &f.ip,
            FileKind::Device(f) => &f.ip,
            _ => return Err(KernelError::BadFileDescriptor),
        };

        let tx = log::begin_tx();
        let lip = ip.lock(&tx);
        let st = lip.stat();
        drop(lip);
        tx.end();

        private.pagetable().copy_out(addr, &st)
    }

    /// Reads from the file into user memory at `addr`.
    pub fn read(
        &self,
        private: &ProcPrivateData,
        addr: VirtAddr,
        n: usize,
    ) -> Result<usize, KernelError> {
        let data = self.data();
        if !data.readable {
            return Err(KernelError::FileNotReadable);
        }

        match &data.kind {
            FileKind::Pipe(p) => p.read(private, addr, n),
            FileKind::Inode(f) => f.read(private, addr, n),
            FileKind::Device(f) => f.read(private, addr, n),
            FileKind::None => unreachable!(),
        }
    }

    /// Writes from user memory at `addr` to the file.
    pub fn write(
        &self,
        private: &ProcPrivateData,
        addr: VirtAddr,
        n: usize,
    ) -> Result<usize, KernelError> {
        let data = self.data();
        if !data.writable {
            return Err(KernelError::FileNotWritable);
        }

        match &data.kind {
            FileKind::Pipe(p) => p.write(private, addr, n),
            FileKind::Inode(f) => f.write(private, addr, n),
            FileKind::Device(f) => f.write(private, addr, n),
            FileKind::None => unreachable!(),
        }
    }
}

/// A regular file: an inode plus the read/write offset.
struct InodeFile {
    ip: Inode,
    off: AtomicUsize,
}

impl InodeFile {
    fn read(
        &self,
        private: &ProcPrivateData,
        addr: VirtAddr,
        n: usize,
    ) -> Result<usize, KernelError> {
        let tx = log::begin_tx();
        let mut lip = self.ip.lock(&tx);
        let res = lip.read_user(&tx, private.pagetable(), addr, self.off.load(Ordering::Relaxed), n);
        if let Ok(read) = res {
            self.off.fetch_add(read, Ordering::Relaxed);
        }
        drop(lip);
        tx.end();
        res
    }

    fn write(
        &self,
        private: &ProcPrivateData,
        addr: VirtAddr,
        n: usize,
    ) -> Result<usize, KernelError> {
        // write a few blocks at a time, so one transaction stays under
        // the per-operation log limit: an inode, an indirect block, a
        // bitmap block, and two blocks of slop for unaligned writes.
        let max = ((MAX_OP_BLOCKS - 1 - 1 - 2) / 2) * BLOCK_SIZE;

        let mut done = 0;
        while done < n {
            let chunk = usize::min(n - done, max);

            let tx = log::begin_tx();
            let mut lip = self.ip.lock(&tx);
            let res = lip.write_user(
                &tx,
                private.pagetable(),
                addr.byte_add(done)?,
                self.off.load(Ordering::Relaxed),
                chunk,
            );
            if let Ok(written) = res {
                self.off.fetch_add(written, Ordering::Relaxed);
            }
            drop(lip);
            tx.end();

            match res {
                Ok(written) if written == chunk => done += chunk,
                Ok(_) => return Err(KernelError::FileTooLarge),
                Err(e) => return Err(e),
            }
        }
        Ok(n)
    }
}

/// A device file: its major number picks the handlers.
struct DeviceFile {
    major: i16,
    ip: Inode,
}

impl DeviceFile {
    fn read(
        &self,
        private: &ProcPrivateData,
        addr: VirtAddr,
        n: usize,
    ) -> Result<usize, KernelError> {
        let dev = device::get(self.major).ok_or(KernelError::NoDevice)?;
        (dev.read)(private, true, addr.addr(), n)
    }

    fn write(
        &self,
        private: &ProcPrivateData,
        addr: VirtAddr,
        n: usize,
    ) -> Result<usize, KernelError> {
        let dev = device::get(self.major).ok_or(KernelError::NoDevice)?;
        (dev.write)(private, true, addr.addr(), n)
    }
}
