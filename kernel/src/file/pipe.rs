//! Pipes: a fixed-capacity byte ring in a single frame, shared by a
//! read end and a write end.

use core::ptr::{self, NonNull};

use crate::{
    error::KernelError,
    memory::{PAGE_SIZE, VirtAddr, page},
    proc::{self, ProcPrivateData},
    sync::SpinLock,
};

use super::{File, FileData, FileKind, alloc};

const PIPE_SIZE: usize = 512;

struct PipeData {
    data: [u8; PIPE_SIZE],
    /// Number of bytes read.
    nread: usize,
    /// Number of bytes written.
    nwrite: usize,
    /// Read end is still open.
    readopen: bool,
    /// Write end is still open.
    writeopen: bool,
}

/// One end's handle on the shared ring; the frame holding it is freed
/// when both ends have closed.
pub(super) struct Pipe {
    inner: NonNull<SpinLock<PipeData>>,
}

unsafe impl Send for Pipe {}
unsafe impl Sync for Pipe {}

const _: () = assert!(size_of::<SpinLock<PipeData>>() <= PAGE_SIZE);

/// Readers sleep on the read counter's address, writers on the write
/// counter's.
fn read_chan(pipe: &PipeData) -> usize {
    ptr::from_ref(&pipe.nread).addr()
}

fn write_chan(pipe: &PipeData) -> usize {
    ptr::from_ref(&pipe.nwrite).addr()
}

/// Creates a pipe and both of its file ends: (read, write).
pub(super) fn new_pair() -> Result<(File, File), KernelError> {
    let frame = page::alloc_frame()?;
    let inner: NonNull<SpinLock<PipeData>> = frame.cast();
    unsafe {
        inner.as_ptr().write(SpinLock::new(PipeData {
            data: [0; PIPE_SIZE],
            nread: 0,
            nwrite: 0,
            readopen: true,
            writeopen: true,
        }));
    }

    let read_end = match alloc(FileData {
        readable: true,
        writable: false,
        kind: FileKind::Pipe(Pipe { inner }),
    }) {
        Ok(f) => f,
        Err((_, e)) => {
            unsafe { page::free_frame(frame) };
            return Err(e);
        }
    };

    let write_end = match alloc(FileData {
        readable: false,
        writable: true,
        kind: FileKind::Pipe(Pipe { inner }),
    }) {
        Ok(f) => f,
        Err((_, e)) => {
            // closing the read end leaves the write side open; close
            // that by hand, which frees the frame.
            read_end.close();
            Pipe { inner }.close(true);
            return Err(e);
        }
    };

    Ok((read_end, write_end))
}

impl Pipe {
    /// Closes one end; the peer is woken so it can observe EOF or
    /// broken-pipe. The last close frees the ring.
    pub(super) fn close(self, writable: bool) {
        let lock = unsafe { self.inner.as_ref() };
        let mut pipe = lock.lock();
        if writable {
            pipe.writeopen = false;
            proc::wakeup(read_chan(&pipe));
        } else {
            pipe.readopen = false;
            proc::wakeup(write_chan(&pipe));
        }
        let both_closed = !pipe.readopen && !pipe.writeopen;
        drop(pipe);

        if both_closed {
            unsafe {
                page::free_frame(self.inner.cast());
            }
        }
    }

    pub(super) fn write(
        &self,
        private: &ProcPrivateData,
        addr: VirtAddr,
        n: usize,
    ) -> Result<usize, KernelError> {
        let lock = unsafe { self.inner.as_ref() };
        let mut pipe = lock.lock();

        let mut i = 0;
        while i < n {
            if !pipe.readopen {
                return Err(KernelError::BrokenPipe);
            }
            if proc::current_killed() {
                return Err(KernelError::ProcessKilled);
            }
            if pipe.nwrite == pipe.nread + PIPE_SIZE {
                // ring is full; let readers drain it.
                proc::wakeup(read_chan(&pipe));
                pipe = proc::sleep(write_chan(&pipe), pipe);
                continue;
            }

            let Ok(byte) = private.pagetable().copy_in::<u8>(addr.byte_add(i)?) else {
                break;
            };
            let idx = pipe.nwrite % PIPE_SIZE;
            pipe.data[idx] = byte;
            pipe.nwrite += 1;
            i += 1;
        }
        proc::wakeup(read_chan(&pipe));
        Ok(i)
    }

    pub(super) fn read(
        &self,
        private: &ProcPrivateData,
        addr: VirtAddr,
        n: usize,
    ) -> Result<usize, KernelError> {
        let lock = unsafe { self.inner.as_ref() };
        let mut pipe = lock.lock();

        // sleep while the ring is empty and a writer remains.
        while pipe.nread == pipe.nwrite && pipe.writeopen {
            if proc::current_killed() {
                return Err(KernelError::ProcessKilled);
            }
            pipe = proc::sleep(read_chan(&pipe), pipe);
        }

        let mut i = 0;
        while i < n {
            if pipe.nread == pipe.nwrite {
                break;
            }
            let byte = pipe.data[pipe.nread % PIPE_SIZE];
            pipe.nread += 1;
            if private
                .pagetable()
                .copy_out_bytes(addr.byte_add(i)?, &[byte])
                .is_err()
            {
                break;
            }
            i += 1;
        }
        proc::wakeup(write_chan(&pipe));
        Ok(i)
    }
}
