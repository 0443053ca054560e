//! Bounded LRU cache of disk blocks.
//!
//! The cache holds cached copies of disk blocks in a fixed set of
//! buffer slots and synchronizes access to each disk block: one cache
//! lock guards buffer identity, reference counts, and recency order,
//! while a per-buffer lock guards the block contents. Holding a
//! [`BlockRef`] pins the buffer in the cache and holds its content
//! lock, so only one user at a time can inspect or change a given
//! block's bytes.
//!
//! The crate is generic over the lock implementations so the kernel can
//! supply a spinlock for the cache state and a sleep lock for buffer
//! contents, while tests run on `std` mutexes.

#![cfg_attr(not(test), no_std)]

use core::{
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

use dataview::{Pod, PodMethods as _};

/// A mutex abstraction, the seam between this crate and its users.
pub trait Lock {
    type Data;
    type Guard<'a>: Deref<Target = Self::Data> + DerefMut
    where
        Self: 'a;

    fn new(data: Self::Data) -> Self;
    fn lock(&self) -> Self::Guard<'_>;
}

/// A device addressed in `BLOCK_SIZE`-byte blocks.
pub trait BlockDevice<const BLOCK_SIZE: usize> {
    type Error;

    fn read(&self, index: usize, data: &mut [u8; BLOCK_SIZE]) -> Result<(), Self::Error>;
    fn write(&self, index: usize, data: &[u8; BLOCK_SIZE]) -> Result<(), Self::Error>;
}

/// Contents of one buffer, guarded by the buffer's own lock.
pub struct BlockData<const BLOCK_SIZE: usize>([u8; BLOCK_SIZE]);

impl<const BLOCK_SIZE: usize> BlockData<BLOCK_SIZE> {
    #[must_use]
    pub const fn new() -> Self {
        Self([0; BLOCK_SIZE])
    }
}

impl<const BLOCK_SIZE: usize> Default for BlockData<BLOCK_SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

/// One buffer slot: the content lock plus the valid latch.
///
/// `valid` flips to `true` only after a successful device read (or a
/// whole-block overwrite) and is reset when the slot is recycled for a
/// different block. It may be read and written without holding the
/// content lock.
pub struct BlockSlot<DataLock> {
    valid: AtomicBool,
    data: DataLock,
}

impl<DataLock> BlockSlot<DataLock> {
    #[must_use]
    pub const fn new(data: DataLock) -> Self {
        Self {
            valid: AtomicBool::new(false),
            data,
        }
    }
}

const NONE: usize = usize::MAX;

struct SlotMeta {
    /// Block index held by this slot; `NONE` if never assigned.
    index: usize,
    /// While > 0 the slot's identity is immutable and the slot will not
    /// be recycled.
    refcnt: u32,
    prev: usize,
    next: usize,
}

/// Identity, reference counts, and recency order of all slots.
///
/// Guarded by the cache lock. The recency list links every slot from
/// most recently used (`head`) to least recently used (`tail`).
pub struct CacheState<const N: usize> {
    slots: [SlotMeta; N],
    head: usize,
    tail: usize,
}

impl<const N: usize> CacheState<N> {
    fn new() -> Self {
        const { assert!(N > 0) };
        let mut slots = [const {
            SlotMeta {
                index: NONE,
                refcnt: 0,
                prev: NONE,
                next: NONE,
            }
        }; N];
        for (i, slot) in slots.iter_mut().enumerate() {
            slot.prev = if i == 0 { NONE } else { i - 1 };
            slot.next = if i == N - 1 { NONE } else { i + 1 };
        }
        Self {
            slots,
            head: 0,
            tail: N - 1,
        }
    }

    fn unlink(&mut self, i: usize) {
        let SlotMeta { prev, next, .. } = self.slots[i];
        match prev {
            NONE => self.head = next,
            p => self.slots[p].next = next,
        }
        match next {
            NONE => self.tail = prev,
            n => self.slots[n].prev = prev,
        }
    }

    fn push_front(&mut self, i: usize) {
        self.slots[i].prev = NONE;
        self.slots[i].next = self.head;
        match self.head {
            NONE => self.tail = i,
            h => self.slots[h].prev = i,
        }
        self.head = i;
    }

    /// Walks from the least recently used slot toward the most recently
    /// used one, returning the first unreferenced slot.
    fn recyclable(&self) -> Option<usize> {
        let mut i = self.tail;
        while i != NONE {
            if self.slots[i].refcnt == 0 {
                return Some(i);
            }
            i = self.slots[i].prev;
        }
        None
    }
}

/// The block cache itself.
///
/// Buffer storage is borrowed for `'static` so the (large) block data
/// can live outside this struct, typically in a `static`.
pub struct BlockCache<Device, CacheLock, DataLock: 'static, const BLOCK_SIZE: usize, const N: usize>
{
    device: Device,
    state: CacheLock,
    slots: &'static [BlockSlot<DataLock>; N],
}

impl<Device, CacheLock, DataLock, const BLOCK_SIZE: usize, const N: usize>
    BlockCache<Device, CacheLock, DataLock, BLOCK_SIZE, N>
where
    Device: BlockDevice<BLOCK_SIZE>,
    CacheLock: Lock<Data = CacheState<N>>,
    DataLock: Lock<Data = BlockData<BLOCK_SIZE>> + 'static,
{
    pub fn new(device: Device, slots: &'static [BlockSlot<DataLock>; N]) -> Self {
        Self {
            device,
            state: CacheLock::new(CacheState::new()),
            slots,
        }
    }

    /// Returns a locked reference to the buffer holding block `index`,
    /// or `None` if every buffer is referenced.
    ///
    /// A hit on a cached identity (valid or not) pins that slot;
    /// otherwise the least recently used unreferenced slot is
    /// reassigned, with its valid latch cleared.
    pub fn try_get(
        &self,
        index: usize,
    ) -> Option<BlockRef<'_, Device, CacheLock, DataLock, BLOCK_SIZE, N>> {
        let mut state = self.state.lock();

        // Is the block already cached?
        let slot = match state.slots.iter().position(|s| s.index == index) {
            Some(i) => {
                state.slots[i].refcnt += 1;
                i
            }
            None => {
                let i = state.recyclable()?;
                state.slots[i].index = index;
                state.slots[i].refcnt = 1;
                self.slots[i].valid.store(false, Ordering::Release);
                i
            }
        };
        drop(state);

        // The slot cannot be recycled while refcnt > 0, so locking its
        // contents outside the cache lock is sound (and mandatory:
        // the content lock may block).
        let slots: &'static [BlockSlot<DataLock>; N] = self.slots;
        let data = slots[slot].data.lock();
        Some(BlockRef {
            cache: self,
            slot,
            index,
            data: Some(data),
        })
    }

    /// Like [`BlockCache::try_get`], but treats exhaustion as fatal.
    ///
    /// # Panics
    ///
    /// Panics if every buffer is referenced; that is an over-subscribed
    /// configuration, not a runtime condition to recover from.
    pub fn get(&self, index: usize) -> BlockRef<'_, Device, CacheLock, DataLock, BLOCK_SIZE, N> {
        self.try_get(index).expect("block cache exhausted")
    }
}

/// A pinned, content-locked reference to one cached block.
pub struct BlockRef<'a, Device, CacheLock, DataLock: 'static, const BLOCK_SIZE: usize, const N: usize>
where
    CacheLock: Lock<Data = CacheState<N>>,
    DataLock: Lock<Data = BlockData<BLOCK_SIZE>>,
{
    cache: &'a BlockCache<Device, CacheLock, DataLock, BLOCK_SIZE, N>,
    slot: usize,
    index: usize,
    data: Option<DataLock::Guard<'static>>,
}

impl<Device, CacheLock, DataLock, const BLOCK_SIZE: usize, const N: usize>
    BlockRef<'_, Device, CacheLock, DataLock, BLOCK_SIZE, N>
where
    Device: BlockDevice<BLOCK_SIZE>,
    CacheLock: Lock<Data = CacheState<N>>,
    DataLock: Lock<Data = BlockData<BLOCK_SIZE>> + 'static,
{
    /// The block index this buffer holds.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    fn valid(&self) -> &AtomicBool {
        &self.cache.slots[self.slot].valid
    }

    /// Fills the buffer from the device if it does not already hold the
    /// block's data.
    pub fn read(&mut self) -> Result<(), Device::Error> {
        if !self.valid().load(Ordering::Acquire) {
            let cache = self.cache;
            let index = self.index;
            let data = self.data.as_mut().unwrap();
            cache.device.read(index, &mut data.0)?;
            self.valid().store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Writes the buffer through to the device.
    ///
    /// # Panics
    ///
    /// Panics if the buffer holds no valid data.
    pub fn write(&mut self) -> Result<(), Device::Error> {
        assert!(self.valid().load(Ordering::Acquire), "writing invalid buffer");
        self.cache.device.write(self.index, &self.data.as_ref().unwrap().0)
    }

    /// Overwrites the whole buffer, making it valid without a read.
    pub fn set_data(&mut self, src: &[u8; BLOCK_SIZE]) {
        self.data.as_mut().unwrap().0.copy_from_slice(src);
        self.valid().store(true, Ordering::Release);
    }

    /// Zero-fills the buffer, making it valid without a read.
    pub fn zeroed(&mut self) {
        self.data.as_mut().unwrap().0.fill(0);
        self.valid().store(true, Ordering::Release);
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8; BLOCK_SIZE] {
        assert!(self.valid().load(Ordering::Acquire), "reading invalid buffer");
        &self.data.as_ref().unwrap().0
    }

    #[must_use]
    pub fn bytes_mut(&mut self) -> &mut [u8; BLOCK_SIZE] {
        assert!(self.valid().load(Ordering::Acquire), "reading invalid buffer");
        &mut self.data.as_mut().unwrap().0
    }

    /// Views the block contents as a POD value.
    #[must_use]
    pub fn data<T: Pod>(&self) -> &T {
        self.bytes().as_data_view().get(0)
    }

    /// Views the block contents as a mutable POD value.
    #[must_use]
    pub fn data_mut<T: Pod>(&mut self) -> &mut T {
        self.bytes_mut().as_data_view_mut().get_mut(0)
    }

    /// Raises the buffer's reference count so it survives this
    /// reference being dropped.
    pub fn pin(&self) {
        let mut state = self.cache.state.lock();
        let meta = &mut state.slots[self.slot];
        meta.refcnt = meta.refcnt.checked_add(1).unwrap();
    }

    /// Reverts one [`BlockRef::pin`].
    ///
    /// # Safety
    ///
    /// The buffer must have been pinned; otherwise its contents may be
    /// recycled out from under a holder.
    pub unsafe fn unpin(&self) {
        let mut state = self.cache.state.lock();
        let meta = &mut state.slots[self.slot];
        assert!(meta.refcnt > 1, "unpinning unpinned buffer");
        meta.refcnt -= 1;
    }
}

impl<Device, CacheLock, DataLock, const BLOCK_SIZE: usize, const N: usize> Drop
    for BlockRef<'_, Device, CacheLock, DataLock, BLOCK_SIZE, N>
where
    CacheLock: Lock<Data = CacheState<N>>,
    DataLock: Lock<Data = BlockData<BLOCK_SIZE>> + 'static,
{
    fn drop(&mut self) {
        // Release the content lock before taking the cache lock.
        drop(self.data.take());

        let mut state = self.cache.state.lock();
        let meta = &mut state.slots[self.slot];
        assert!(meta.refcnt > 0);
        meta.refcnt -= 1;
        if meta.refcnt == 0 {
            // No one is waiting for it; it is now the most recently used.
            state.unlink(self.slot);
            state.push_front(self.slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::{
        convert::Infallible,
        sync::{Arc, Mutex, MutexGuard},
    };

    const BLOCK_SIZE: usize = 512;
    const N: usize = 5;

    struct StdLock<T>(Mutex<T>);

    impl<T> Lock for StdLock<T> {
        type Data = T;
        type Guard<'a>
            = MutexGuard<'a, T>
        where
            T: 'a;

        fn new(data: T) -> Self {
            Self(Mutex::new(data))
        }

        fn lock(&self) -> Self::Guard<'_> {
            self.0.lock().unwrap()
        }
    }

    #[derive(Clone, Default)]
    struct MockDevice {
        blocks: Arc<Mutex<Vec<MockBlock>>>,
    }

    #[derive(Clone)]
    struct MockBlock {
        data: [u8; BLOCK_SIZE],
        reads: usize,
        writes: usize,
    }

    impl MockDevice {
        fn new(size: usize) -> Self {
            Self {
                blocks: Arc::new(Mutex::new(vec![
                    MockBlock {
                        data: [0; BLOCK_SIZE],
                        reads: 0,
                        writes: 0,
                    };
                    size
                ])),
            }
        }

        fn reads(&self, index: usize) -> usize {
            self.blocks.lock().unwrap()[index].reads
        }

        fn writes(&self, index: usize) -> usize {
            self.blocks.lock().unwrap()[index].writes
        }
    }

    impl BlockDevice<BLOCK_SIZE> for MockDevice {
        type Error = Infallible;

        fn read(&self, index: usize, data: &mut [u8; BLOCK_SIZE]) -> Result<(), Infallible> {
            let mut blocks = self.blocks.lock().unwrap();
            blocks[index].reads += 1;
            data.copy_from_slice(&blocks[index].data);
            Ok(())
        }

        fn write(&self, index: usize, data: &[u8; BLOCK_SIZE]) -> Result<(), Infallible> {
            let mut blocks = self.blocks.lock().unwrap();
            blocks[index].writes += 1;
            blocks[index].data.copy_from_slice(data);
            Ok(())
        }
    }

    type Cache = BlockCache<MockDevice, StdLock<CacheState<N>>, StdLock<BlockData<BLOCK_SIZE>>, BLOCK_SIZE, N>;

    fn new_cache(device: MockDevice) -> Cache {
        let slots = Box::leak(Box::new(core::array::from_fn(|_| {
            BlockSlot::new(StdLock::new(BlockData::new()))
        })));
        BlockCache::new(device, slots)
    }

    #[test]
    fn get_does_not_touch_device() {
        let device = MockDevice::new(10);
        let cache = new_cache(device.clone());

        let buf = cache.get(0);
        assert_eq!(buf.index(), 0);
        assert_eq!(device.reads(0), 0);
        assert_eq!(device.writes(0), 0);
    }

    #[test]
    fn read_fills_once_and_write_persists() {
        let device = MockDevice::new(10);
        let cache = new_cache(device.clone());

        {
            let mut buf = cache.get(3);
            buf.read().unwrap();
            buf.bytes_mut().fill(0xaa);
            buf.write().unwrap();
        }
        {
            let mut buf = cache.get(3);
            buf.read().unwrap();
            assert_eq!(buf.bytes(), &[0xaa; BLOCK_SIZE]);
        }

        // second read() was a cache hit
        assert_eq!(device.reads(3), 1);
        assert_eq!(device.writes(3), 1);
    }

    #[test]
    fn lru_eviction_order() {
        let device = MockDevice::new(10);
        let cache = new_cache(device.clone());

        for i in 0..10 {
            cache.get(i).read().unwrap();
        }
        // cache now holds 9 8 7 6 5 (most to least recent)
        for i in 0..10 {
            assert_eq!(device.reads(i), 1);
        }

        // 0 is not cached; the LRU slot (5) is recycled
        cache.get(0).read().unwrap();
        assert_eq!(device.reads(0), 2);
        // cache: 0 9 8 7 6

        // 8 is still cached
        cache.get(8).read().unwrap();
        assert_eq!(device.reads(8), 1);
        // cache: 8 0 9 7 6

        // 3 is not cached; 6 is now the LRU
        cache.get(3).read().unwrap();
        assert_eq!(device.reads(3), 2);
        // cache: 3 8 0 9 7

        for (i, n) in [(3, 2), (8, 1), (0, 2), (9, 1), (7, 1)] {
            cache.get(i).read().unwrap();
            assert_eq!(device.reads(i), n);
        }
    }

    #[test]
    fn pinned_buffer_survives_pressure() {
        let device = MockDevice::new(10);
        let cache = new_cache(device.clone());

        for i in 0..10 {
            cache.get(i).read().unwrap();
        }
        // pin block 5 (the current LRU)
        {
            let mut buf = cache.get(5);
            buf.read().unwrap();
            buf.pin();
        }

        for i in 0..10 {
            cache.get(i).read().unwrap();
        }
        for i in 0..10 {
            let expect = if i == 5 { 1 } else { 2 };
            assert_eq!(device.reads(i), expect, "block {i}");
        }

        let buf = cache.get(5);
        unsafe { buf.unpin() };
    }

    #[test]
    fn recycle_clears_valid() {
        let device = MockDevice::new(10);
        let cache = new_cache(device.clone());

        cache.get(0).read().unwrap();
        // push 0 out of the cache
        for i in 1..=N {
            cache.get(i).read().unwrap();
        }
        // 0 must be re-read from the device
        cache.get(0).read().unwrap();
        assert_eq!(device.reads(0), 2);
    }

    #[test]
    fn exhaustion_returns_none() {
        let device = MockDevice::new(10);
        let cache = new_cache(device);

        let held: Vec<_> = (0..N).map(|i| cache.get(i)).collect();
        assert!(cache.try_get(N).is_none());
        drop(held);
        assert!(cache.try_get(N).is_some());
    }

    #[test]
    #[should_panic(expected = "block cache exhausted")]
    fn exhaustion_panics_on_get() {
        let device = MockDevice::new(10);
        let cache = new_cache(device);

        let _held: Vec<_> = (0..N).map(|i| cache.get(i)).collect();
        let _ = cache.get(N);
    }
}
