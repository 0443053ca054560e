//! File system implementation. Five layers:
//!
//! * Blocks: the buffer cache and the on-disk block allocator.
//! * Log: crash recovery for multi-step updates.
//! * Inodes: file allocation, reading, writing, metadata.
//! * Directories: inodes whose content is a list of other inodes.
//! * Names: hierarchical paths like /usr/rtm/notes, for convenience.
//!
//! This module holds the superblock and the block allocator; the
//! higher-level system call implementations live in syscall/file.rs.

use core::fmt;

use moss_fs_types::{BITS_PER_BLOCK, BitmapBlock, BlockNo, InodeNo, SuperBlock};
use once_init::OnceInit;

use crate::{error::KernelError, param::ROOT_DEV, println};

use self::log::Tx;

pub mod block_io;
pub mod directory;
pub mod inode;
pub mod log;
pub mod ops;
pub mod path;
pub mod stat;
pub mod virtio;
pub mod virtio_disk;

pub use self::inode::{Inode, LockedInode};

/// The root directory's inode number.
pub const ROOT_INO: InodeNo = InodeNo::ROOT;

/// A disk device number (not a device-file major number).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct DeviceNo(u32);

impl fmt::Display for DeviceNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl DeviceNo {
    /// The file system root disk.
    pub const ROOT: Self = Self(ROOT_DEV);

    pub const fn value(&self) -> u32 {
        self.0
    }
}

// there should be one superblock per disk device, but we run with only
// one device.
static SUPER_BLOCK: OnceInit<SuperBlock> = OnceInit::new();

pub(in crate::fs) fn super_block() -> &'static SuperBlock {
    SUPER_BLOCK.get()
}

/// Initializes the file system: reads the superblock and runs log
/// recovery.
///
/// Must run in process context (it sleeps on disk I/O), so it is
/// called from the first process rather than from main().
pub fn init(dev: DeviceNo) {
    let mut br = block_io::get(dev, SuperBlock::SUPER_BLOCK_NO);
    let Ok(()) = br.read();
    let sb: &SuperBlock = br.data();
    assert_eq!(sb.magic, SuperBlock::MAGIC, "invalid file system magic");
    SUPER_BLOCK.init(sb.clone());
    drop(br);

    log::init(dev, SUPER_BLOCK.get());
}

/// Zeroes a block through the log.
fn block_zero(tx: &Tx, dev: DeviceNo, block_no: BlockNo) {
    let mut br = tx.get_block(dev, block_no);
    br.zeroed();
    tx.write(&mut br);
}

/// Allocates a zeroed disk block.
pub(in crate::fs) fn block_alloc(tx: &Tx, dev: DeviceNo) -> Result<BlockNo, KernelError> {
    let sb = super_block();
    let size = sb.size as usize;
    for bn0 in (0..size).step_by(BITS_PER_BLOCK) {
        let mut br = tx.read_block(dev, sb.bitmap_block(bn0));
        let found = (0..BITS_PER_BLOCK)
            .take_while(|bi| bn0 + bi < size)
            .find(|bi| !br.data::<BitmapBlock>().bit(*bi));
        let Some(bi) = found else {
            continue;
        };

        // mark the block in use.
        br.data_mut::<BitmapBlock>().set_bit(bi);
        tx.write(&mut br);
        drop(br);

        let bn = BlockNo::new((bn0 + bi) as u32);
        block_zero(tx, dev, bn);
        return Ok(bn);
    }
    println!("out of blocks");
    Err(KernelError::OutOfDataBlocks)
}

/// Frees a disk block.
pub(in crate::fs) fn block_free(tx: &Tx, dev: DeviceNo, bn: BlockNo) {
    let sb = super_block();
    let mut br = tx.read_block(dev, sb.bitmap_block(bn.as_index()));
    let bi = bn.as_index() % BITS_PER_BLOCK;
    assert!(br.data::<BitmapBlock>().bit(bi), "freeing free block");
    br.data_mut::<BitmapBlock>().clear_bit(bi);
    tx.write(&mut br);
}
