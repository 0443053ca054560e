//! Inodes.
//!
//! An inode describes a single unnamed file: its type, size, link
//! count, and the list of blocks holding its content. Inodes are laid
//! out sequentially on disk at `sb.inode_start`.
//!
//! The kernel keeps a table of in-use inodes in memory to synchronize
//! access by multiple processes. The table is a content-addressed
//! cache: at most one entry per (device, inode number).
//!
//! An inode goes through several states:
//!
//! * Allocation: an inode is allocated on disk iff its type is
//!   non-zero. [`alloc`] allocates, [`Inode::put`] frees once the link
//!   and reference counts are both zero.
//! * Referencing: a table entry is free if its reference count is
//!   zero; [`Inode::get`] finds or creates an entry and takes a
//!   reference, [`Inode::put`] drops one.
//! * Validity: the entry mirrors the disk inode only after the first
//!   [`Inode::lock`] reads it in.
//! * Locking: examining or changing an inode's fields or content
//!   requires holding its sleep lock, i.e. a [`LockedInode`].
//!
//! A typical sequence:
//!
//! ```text
//! let ip = Inode::get(dev, ino);
//! let lip = ip.lock(&tx);
//! ... use lip ...
//! drop(lip);
//! ip.put(&tx);
//! ```
//!
//! Locking is separate from getting so that system calls can keep a
//! long-term reference to an inode (as an open file does) and lock it
//! only for short stretches; that separation also avoids deadlock
//! during path lookup.

use core::sync::atomic::{AtomicBool, Ordering};

use dataview::{Pod, PodMethods};
use moss_fs_types::{
    BLOCK_SIZE, BlockNo, IndirectBlock, InodeBlock, InodeNo, MAX_FILE, NDIRECT, NINDIRECT,
};

use crate::{
    error::KernelError,
    fs::{DeviceNo, block_io::BlockRef, log::Tx, stat::Stat, super_block},
    memory::{VirtAddr, vm_user::UserPageTable},
    param::NINODE,
    println,
    sync::{SleepLock, SleepLockGuard, SpinLock},
};

/// In-memory mirror of one disk inode, valid once first locked.
pub(in crate::fs) struct InodeData {
    pub(in crate::fs) ty: i16,
    pub(in crate::fs) major: i16,
    pub(in crate::fs) minor: i16,
    pub(in crate::fs) nlink: i16,
    pub(in crate::fs) size: u32,
    addrs: [Option<BlockNo>; NDIRECT + 1],
}

impl InodeData {
    const fn empty() -> Self {
        Self {
            ty: 0,
            major: 0,
            minor: 0,
            nlink: 0,
            size: 0,
            addrs: [None; NDIRECT + 1],
        }
    }
}

struct Slot {
    data: SleepLock<InodeData>,
    /// Set once the disk copy has been read in; cleared when the slot
    /// is recycled for a different inode.
    valid: AtomicBool,
}

static SLOTS: [Slot; NINODE] = [const {
    Slot {
        data: SleepLock::new(InodeData::empty()),
        valid: AtomicBool::new(false),
    }
}; NINODE];

/// Table-entry identity and reference counts, under one spinlock.
struct Ident {
    dev: DeviceNo,
    ino: InodeNo,
    refcnt: u32,
}

static IDENT: SpinLock<[Ident; NINODE]> = SpinLock::new(
    [const {
        Ident {
            dev: DeviceNo::ROOT,
            ino: InodeNo::new(0),
            refcnt: 0,
        }
    }; NINODE],
);

/// A counted reference to an in-memory inode.
///
/// References are moved explicitly: [`Inode::dup`] takes another,
/// [`Inode::put`] releases one. Losing an `Inode` without `put` leaks
/// a table entry.
#[must_use]
pub struct Inode {
    dev: DeviceNo,
    ino: InodeNo,
    slot: usize,
}

impl Inode {
    /// Finds or creates the table entry for (`dev`, `ino`) and takes a
    /// reference. Performs no disk I/O.
    ///
    /// # Panics
    ///
    /// Panics if the table is full; that is an over-subscribed
    /// configuration.
    pub fn get(dev: DeviceNo, ino: InodeNo) -> Inode {
        let mut ident = IDENT.lock();

        let mut empty = None;
        for (i, entry) in ident.iter_mut().enumerate() {
            if entry.refcnt > 0 && entry.dev == dev && entry.ino == ino {
                entry.refcnt += 1;
                return Inode { dev, ino, slot: i };
            }
            if empty.is_none() && entry.refcnt == 0 {
                empty = Some(i);
            }
        }

        let i = empty.expect("inode table exhausted");
        ident[i] = Ident {
            dev,
            ino,
            refcnt: 1,
        };
        // nobody holds the slot (refcnt was 0), so the stale cached
        // copy can be dismissed without its lock.
        SLOTS[i].valid.store(false, Ordering::Release);
        Inode { dev, ino, slot: i }
    }

    /// Takes another reference to the same inode.
    pub fn dup(&self) -> Inode {
        let mut ident = IDENT.lock();
        ident[self.slot].refcnt += 1;
        Inode {
            dev: self.dev,
            ino: self.ino,
            slot: self.slot,
        }
    }

    pub fn dev(&self) -> DeviceNo {
        self.dev
    }

    pub fn ino(&self) -> InodeNo {
        self.ino
    }

    /// Locks the inode, reading it from disk if this is its first lock.
    ///
    /// # Panics
    ///
    /// Panics if the on-disk inode is unallocated; looking up a name
    /// can only yield allocated inodes, so a free one here means the
    /// disk is corrupt.
    pub fn lock<'a>(&'a self, tx: &Tx) -> LockedInode<'a> {
        let slot = &SLOTS[self.slot];
        let mut data = slot.data.lock();

        if !slot.valid.load(Ordering::Acquire) {
            let sb = super_block();
            let br = tx.read_block(self.dev, sb.inode_block(self.ino));
            let dip = br.data::<InodeBlock>().inode(self.ino);
            data.ty = dip.ty;
            data.major = dip.major;
            data.minor = dip.minor;
            data.nlink = dip.nlink;
            data.size = dip.size;
            dip.read_addrs(&mut data.addrs);
            drop(br);
            slot.valid.store(true, Ordering::Release);
            assert_ne!(data.ty, 0, "inode with no type");
        }

        LockedInode { inode: self, data }
    }

    /// Releases one reference.
    ///
    /// If this was the last reference and the inode has no links, the
    /// inode and its content are freed on disk; that is why every
    /// `put` happens inside a transaction.
    pub fn put(self, tx: &Tx) {
        let ident = IDENT.lock();
        let slot = &SLOTS[self.slot];

        if ident[self.slot].refcnt == 1 && slot.valid.load(Ordering::Acquire) {
            // refcnt == 1 means no one else holds the inode locked, so
            // this lock acquisition won't block (or deadlock).
            drop(ident);
            let data = slot.data.lock();

            if data.nlink == 0 {
                // no links and no other references: truncate and free.
                let mut lip = LockedInode { inode: &self, data };
                lip.truncate(tx);
                lip.data.ty = 0;
                lip.update(tx);
                drop(lip);
                slot.valid.store(false, Ordering::Release);
            } else {
                drop(data);
            }

            IDENT.lock()[self.slot].refcnt -= 1;
            return;
        }

        let mut ident = ident;
        ident[self.slot].refcnt -= 1;
    }
}

/// An inode with its sleep lock held; grants access to fields and
/// content.
pub struct LockedInode<'a> {
    inode: &'a Inode,
    pub(in crate::fs) data: SleepLockGuard<'a, InodeData>,
}

impl LockedInode<'_> {
    pub fn dev(&self) -> DeviceNo {
        self.inode.dev
    }

    pub fn ino(&self) -> InodeNo {
        self.inode.ino
    }

    pub fn ty(&self) -> i16 {
        self.data.ty
    }

    pub fn size(&self) -> u32 {
        self.data.size
    }

    pub fn nlink(&self) -> i16 {
        self.data.nlink
    }

    pub fn major(&self) -> i16 {
        self.data.major
    }

    pub fn stat(&self) -> Stat {
        Stat::new(
            self.inode.dev.value(),
            self.inode.ino.value(),
            self.data.ty,
            self.data.nlink,
            self.data.size.into(),
        )
    }

    /// Copies the in-memory inode to its disk slot, through the log.
    ///
    /// Must be called after every change to a field that lives on
    /// disk.
    pub fn update(&mut self, tx: &Tx) {
        let sb = super_block();
        let mut br = tx.read_block(self.inode.dev, sb.inode_block(self.inode.ino));
        let dip = br.data_mut::<InodeBlock>().inode_mut(self.inode.ino);
        dip.ty = self.data.ty;
        dip.major = self.data.major;
        dip.minor = self.data.minor;
        dip.nlink = self.data.nlink;
        dip.size = self.data.size;
        dip.write_addrs(&self.data.addrs);
        tx.write(&mut br);
    }

    /// Discards the inode's contents, freeing all its blocks.
    pub fn truncate(&mut self, tx: &Tx) {
        let dev = self.inode.dev;
        for addr in &mut self.data.addrs[..NDIRECT] {
            if let Some(bn) = addr.take() {
                super::block_free(tx, dev, bn);
            }
        }

        if let Some(ind_bn) = self.data.addrs[NDIRECT].take() {
            let mut br = tx.read_block(dev, ind_bn);
            for bn in br.data_mut::<IndirectBlock>().drain() {
                super::block_free(tx, dev, bn);
            }
            drop(br);
            super::block_free(tx, dev, ind_bn);
        }

        self.data.size = 0;
        self.update(tx);
    }

    /// Returns the disk block holding file block `fbn`, allocating it
    /// (and the indirect block) as needed.
    ///
    /// # Panics
    ///
    /// Panics on an index past the maximum file size; content loops
    /// bound their offsets first.
    fn block_of(&mut self, tx: &Tx, fbn: usize) -> Result<BlockNo, KernelError> {
        let dev = self.inode.dev;

        if fbn < NDIRECT {
            if let Some(bn) = self.data.addrs[fbn] {
                return Ok(bn);
            }
            let bn = super::block_alloc(tx, dev)?;
            self.data.addrs[fbn] = Some(bn);
            return Ok(bn);
        }

        let idx = fbn - NDIRECT;
        assert!(idx < NINDIRECT, "file block index out of range");

        // load the indirect block, allocating if necessary.
        let ind_bn = match self.data.addrs[NDIRECT] {
            Some(bn) => bn,
            None => {
                let bn = super::block_alloc(tx, dev)?;
                self.data.addrs[NDIRECT] = Some(bn);
                bn
            }
        };

        let mut br = tx.read_block(dev, ind_bn);
        if let Some(bn) = br.data::<IndirectBlock>().get(idx) {
            return Ok(bn);
        }
        let bn = super::block_alloc(tx, dev)?;
        br.data_mut::<IndirectBlock>().set(idx, bn);
        tx.write(&mut br);
        Ok(bn)
    }

    /// Runs `f` over each cached block covering `[off, off + n)`.
    ///
    /// `f` gets the buffer, the in-block range start, the chunk
    /// length, and the running byte count.
    fn for_each_block<F>(
        &mut self,
        tx: &Tx,
        off: usize,
        n: usize,
        mut f: F,
    ) -> Result<usize, KernelError>
    where
        F: FnMut(&mut BlockRef, usize, usize, usize) -> Result<(), KernelError>,
    {
        let mut tot = 0;
        while tot < n {
            let o = off + tot;
            let bn = self.block_of(tx, o / BLOCK_SIZE)?;
            let mut br = tx.read_block(self.inode.dev, bn);
            let boff = o % BLOCK_SIZE;
            let m = usize::min(n - tot, BLOCK_SIZE - boff);
            f(&mut br, boff, m, tot)?;
            tot += m;
        }
        Ok(tot)
    }

    fn read_len(&self, off: usize, n: usize) -> usize {
        let size = self.data.size as usize;
        if off > size || off.checked_add(n).is_none() {
            return 0;
        }
        usize::min(n, size - off)
    }

    /// Reads up to `dst.len()` bytes at `off` into kernel memory;
    /// returns the byte count, truncated at the file size.
    pub fn read_kernel(
        &mut self,
        tx: &Tx,
        dst: &mut [u8],
        off: usize,
    ) -> Result<usize, KernelError> {
        let n = self.read_len(off, dst.len());
        self.for_each_block(tx, off, n, |br, boff, m, done| {
            dst[done..done + m].copy_from_slice(&br.bytes()[boff..boff + m]);
            Ok(())
        })
    }

    /// Reads a value of type `T` at `off`.
    ///
    /// # Panics
    ///
    /// Panics if the read crosses the file size; callers pass offsets
    /// they know to be in bounds.
    pub fn read_value<T: Pod>(&mut self, tx: &Tx, off: usize) -> Result<T, KernelError> {
        let mut val = T::zeroed();
        let n = self.read_kernel(tx, val.as_bytes_mut(), off)?;
        assert_eq!(n, size_of::<T>(), "short inode read");
        Ok(val)
    }

    /// Reads up to `n` bytes at `off` into user memory at `dst`.
    pub fn read_user(
        &mut self,
        tx: &Tx,
        pt: &UserPageTable,
        dst: VirtAddr,
        off: usize,
        n: usize,
    ) -> Result<usize, KernelError> {
        let n = self.read_len(off, n);
        self.for_each_block(tx, off, n, |br, boff, m, done| {
            pt.copy_out_bytes(dst.byte_add(done)?, &br.bytes()[boff..boff + m])
        })
    }

    fn check_write(&self, off: usize, n: usize) -> Result<(), KernelError> {
        let size = self.data.size as usize;
        if off > size || off.checked_add(n).is_none() {
            return Err(KernelError::FileTooLarge);
        }
        if off + n > MAX_FILE * BLOCK_SIZE {
            return Err(KernelError::FileTooLarge);
        }
        Ok(())
    }

    fn finish_write(&mut self, tx: &Tx, off: usize, written: usize) {
        if off + written > self.data.size as usize {
            self.data.size = (off + written) as u32;
        }
        // write the inode back even if the size is unchanged: the
        // write may have filled in block addresses via block_of().
        self.update(tx);
    }

    /// Writes `src` at `off`, extending the file as needed.
    pub fn write_kernel(&mut self, tx: &Tx, src: &[u8], off: usize) -> Result<usize, KernelError> {
        self.check_write(off, src.len())?;
        let written = self.for_each_block(tx, off, src.len(), |br, boff, m, done| {
            br.bytes_mut()[boff..boff + m].copy_from_slice(&src[done..done + m]);
            tx.write(br);
            Ok(())
        })?;
        self.finish_write(tx, off, written);
        Ok(written)
    }

    /// Writes a value of type `T` at `off`.
    pub fn write_value<T: Pod>(&mut self, tx: &Tx, off: usize, val: &T) -> Result<(), KernelError> {
        let n = self.write_kernel(tx, val.as_bytes(), off)?;
        assert_eq!(n, size_of::<T>(), "short inode write");
        Ok(())
    }

    /// Writes `n` bytes from user memory at `src` to the file at
    /// `off`.
    pub fn write_user(
        &mut self,
        tx: &Tx,
        pt: &UserPageTable,
        src: VirtAddr,
        off: usize,
        n: usize,
    ) -> Result<usize, KernelError> {
        self.check_write(off, n)?;
        let written = self.for_each_block(tx, off, n, |br, boff, m, done| {
            pt.copy_in_bytes(&mut br.bytes_mut()[boff..boff + m], src.byte_add(done)?)?;
            tx.write(br);
            Ok(())
        })?;
        self.finish_write(tx, off, written);
        Ok(written)
    }
}

/// Allocates a free on-disk inode on device `dev`, marking it with
/// type `ty`.
///
/// Returns an unlocked but referenced inode.
pub fn alloc(tx: &Tx, dev: DeviceNo, ty: i16) -> Result<Inode, KernelError> {
    let sb = super_block();

    for ino in 1..sb.ninodes {
        let ino = InodeNo::new(ino);
        let mut br = tx.read_block(dev, sb.inode_block(ino));
        let dip = br.data_mut::<InodeBlock>().inode_mut(ino);
        if dip.is_free() {
            dip.allocate(ty);
            tx.write(&mut br);
            drop(br);
            return Ok(Inode::get(dev, ino));
        }
    }
    println!("out of inodes");
    Err(KernelError::OutOfInodes)
}
