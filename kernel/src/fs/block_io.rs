//! The disk block cache: the generic LRU cache instantiated over the
//! virtio disk, with a spinlock for cache state and a sleep lock per
//! buffer.

use core::convert::Infallible;

use block_cache::{BlockCache, BlockData, BlockDevice, BlockSlot, CacheState};
use moss_fs_types::{BLOCK_SIZE, BlockNo};
use once_init::OnceInit;

use crate::{
    fs::{DeviceNo, virtio_disk},
    param::NBUF,
    sync::{SleepLock, SpinLock},
};

pub struct VirtioDiskDevice;

impl BlockDevice<BLOCK_SIZE> for VirtioDiskDevice {
    type Error = Infallible;

    fn read(&self, index: usize, data: &mut [u8; BLOCK_SIZE]) -> Result<(), Infallible> {
        virtio_disk::read(index, data);
        Ok(())
    }

    fn write(&self, index: usize, data: &[u8; BLOCK_SIZE]) -> Result<(), Infallible> {
        virtio_disk::write(index, data);
        Ok(())
    }
}

type CacheMutex = SpinLock<CacheState<NBUF>>;
type BlockMutex = SleepLock<BlockData<BLOCK_SIZE>>;

pub type BlockRef =
    block_cache::BlockRef<'static, VirtioDiskDevice, CacheMutex, BlockMutex, BLOCK_SIZE, NBUF>;

/// Buffer storage; referenced by the cache, kept out of it so the
/// cache struct itself stays small.
static SLOTS: [BlockSlot<BlockMutex>; NBUF] =
    [const { BlockSlot::new(SleepLock::new(BlockData::new())) }; NBUF];

static CACHE: OnceInit<BlockCache<VirtioDiskDevice, CacheMutex, BlockMutex, BLOCK_SIZE, NBUF>> =
    OnceInit::new();

pub fn init() {
    CACHE.init(BlockCache::new(VirtioDiskDevice, &SLOTS));
}

/// Returns a locked, pinned buffer for the given block.
///
/// The buffer's contents are not read from disk until
/// [`BlockRef::read`].
pub fn get(dev: DeviceNo, block_no: BlockNo) -> BlockRef {
    assert_eq!(dev, DeviceNo::ROOT, "unknown device {}", dev.value());
    CACHE.get().get(block_no.as_index())
}
