use core::ptr::{self, NonNull};

use bitflags::bitflags;

use crate::{
    error::KernelError,
    memory::{PAGE_SHIFT, PAGE_SIZE, PhysAddr, VirtAddr, page},
};

bitflags! {
    /// Sv39 page table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PtEntryFlags: usize {
        /// Entry is valid.
        const V = 1 << 0;
        /// Page is readable.
        const R = 1 << 1;
        /// Page is writable.
        const W = 1 << 2;
        /// Page is executable.
        const X = 1 << 3;
        /// Page is accessible in user mode.
        const U = 1 << 4;
        /// Global mapping.
        const G = 1 << 5;
        /// Page has been accessed.
        const A = 1 << 6;
        /// Page has been written.
        const D = 1 << 7;

        const RW = Self::R.bits() | Self::W.bits();
        const RX = Self::R.bits() | Self::X.bits();
        const RWX = Self::RW.bits() | Self::X.bits();
        const UR = Self::U.bits() | Self::R.bits();
        const UW = Self::U.bits() | Self::W.bits();
        const URW = Self::U.bits() | Self::RW.bits();
        const URWX = Self::U.bits() | Self::RWX.bits();
    }
}

/// One node of the three-level Sv39 page table tree.
///
/// Every node is exactly one frame of 512 entries. Leaves exist only at
/// level 0; a non-leaf entry carries no permission bits.
#[repr(transparent)]
pub struct PageTable([PtEntry; 512]);

impl PageTable {
    /// Allocates a new zeroed page table node.
    pub fn try_allocate() -> Result<NonNull<PageTable>, KernelError> {
        Ok(page::alloc_zeroed_frame()?.cast())
    }

    /// Returns the page-table index of `va` at `level`.
    ///
    /// An Sv39 virtual address is split into five fields:
    /// ```text
    ///     39..=63 -- must be zero.
    ///     30..=38 -- 9 bits of level-2 index.
    ///     21..=29 -- 9 bits of level-1 index.
    ///     12..=20 -- 9 bits of level-0 index.
    ///      0..=11 -- 12 bits of byte offset within the page.
    /// ```
    fn entry_index(level: usize, va: VirtAddr) -> usize {
        assert!(level <= 2);
        (va.addr() >> (PAGE_SHIFT + 9 * level)) & 0x1ff
    }

    /// Physical page number of the frame holding this node, as satp
    /// wants it.
    pub fn phys_page_num(&self) -> usize {
        ptr::from_ref(self).addr() >> PAGE_SHIFT
    }

    /// Installs a leaf mapping `va -> pa` with permissions `perm | V`.
    ///
    /// `va` must be page-aligned.
    ///
    /// # Panics
    ///
    /// Panics if `va` is already mapped; a double map is a kernel bug.
    pub fn map_page(
        &mut self,
        va: VirtAddr,
        pa: PhysAddr,
        perm: PtEntryFlags,
    ) -> Result<(), KernelError> {
        assert!(va.is_page_aligned(), "va={va:#x}");
        assert!(perm.intersects(PtEntryFlags::RWX), "perm={perm:?}");

        self.update_leaf(va, true, |pte| {
            assert!(!pte.is_valid(), "remap of mapped address: va={va:#x}");
            pte.set_phys_addr(pa, perm | PtEntryFlags::V);
        })
    }

    /// Installs leaf mappings for `npages` pages starting at `va`.
    pub fn map_pages(
        &mut self,
        va: VirtAddr,
        npages: usize,
        pa: PhysAddr,
        perm: PtEntryFlags,
    ) -> Result<(), KernelError> {
        assert_ne!(npages, 0);
        for i in 0..npages {
            self.map_page(va.byte_add(i * PAGE_SIZE)?, pa.byte_add(i * PAGE_SIZE), perm)?;
        }
        Ok(())
    }

    /// Removes the leaf mapping at `va`, returning the physical frame
    /// it referenced.
    ///
    /// # Panics
    ///
    /// Panics if `va` is unaligned or not a valid leaf.
    pub fn unmap_page(&mut self, va: VirtAddr) -> PhysAddr {
        assert!(va.is_page_aligned(), "va={va:#x}");

        self.update_leaf(va, false, |pte| {
            assert!(pte.is_valid(), "unmap of unmapped address: va={va:#x}");
            assert!(pte.is_leaf(), "unmap of non-leaf: va={va:#x}");
            let pa = pte.phys_addr();
            pte.clear();
            pa
        })
        .expect("interior nodes of a mapped page exist")
    }

    /// Returns the leaf entry for `va`, without allocating.
    pub fn find_leaf(&self, va: VirtAddr) -> Result<&PtEntry, KernelError> {
        assert!(va < VirtAddr::MAX);

        let mut pt = self;
        for level in (1..=2).rev() {
            let index = Self::entry_index(level, va);
            pt = pt.0[index]
                .as_page_table()
                .ok_or(KernelError::AddressNotMapped(va))?;
        }

        let pte = &pt.0[Self::entry_index(0, va)];
        if !pte.is_leaf() {
            return Err(KernelError::AddressNotMapped(va));
        }
        Ok(pte)
    }

    /// Walks to the level-0 entry for `va` and applies `f` to it.
    ///
    /// With `insert`, missing interior nodes are allocated (zeroed);
    /// without it the walk fails on a missing node. The updated entry
    /// must end up invalid or a leaf.
    pub fn update_leaf<T, F>(
        &mut self,
        va: VirtAddr,
        insert: bool,
        f: F,
    ) -> Result<T, KernelError>
    where
        F: FnOnce(&mut PtEntry) -> T,
    {
        assert!(va < VirtAddr::MAX);

        let mut pt = self;
        for level in (1..=2).rev() {
            let index = Self::entry_index(level, va);
            if !pt.0[index].is_valid() {
                if !insert {
                    return Err(KernelError::AddressNotMapped(va));
                }
                let node = Self::try_allocate()?;
                pt.0[index].set_page_table(node);
            }
            pt = pt.0[index].as_page_table_mut().unwrap();
        }

        let pte = &mut pt.0[Self::entry_index(0, va)];
        let res = f(pte);
        // a level-0 entry must be invalid or a leaf.
        assert!(!pte.is_non_leaf());
        Ok(res)
    }

    /// Translates `va`, requiring a valid leaf carrying `flags`.
    pub fn resolve(&self, va: VirtAddr, flags: PtEntryFlags) -> Result<PhysAddr, KernelError> {
        let pte = self.find_leaf(va)?;
        if !pte.flags().contains(flags) {
            return Err(KernelError::InaccessibleMemory(va));
        }
        Ok(pte.phys_addr())
    }

    /// Returns the page mapped at page-aligned `va`.
    pub fn fetch_page(
        &self,
        va: VirtAddr,
        flags: PtEntryFlags,
    ) -> Result<&[u8; PAGE_SIZE], KernelError> {
        let pa = self.resolve(va, flags)?;
        Ok(unsafe { pa.as_ptr::<[u8; PAGE_SIZE]>().as_ref() })
    }

    /// Recursively frees interior page-table nodes.
    ///
    /// # Panics
    ///
    /// Panics if any leaf mapping remains; callers unmap first.
    pub fn free_descendants(&mut self) {
        for pte in &mut self.0 {
            assert!(!pte.is_leaf(), "leaf survived address-space teardown");
            if let Some(mut node) = pte.take_page_table() {
                unsafe {
                    node.as_mut().free_descendants();
                    page::free_frame(node.cast());
                }
            }
        }
    }

    /// Frees the whole tree rooted at `root`, interior nodes included.
    ///
    /// # Safety
    ///
    /// `root` must have come from [`PageTable::try_allocate`] and must
    /// not be in use by any hart.
    pub unsafe fn free(mut root: NonNull<PageTable>) {
        unsafe {
            root.as_mut().free_descendants();
            page::free_frame(root.cast());
        }
    }
}

/// One Sv39 page table entry.
#[repr(transparent)]
pub struct PtEntry(usize);

impl PtEntry {
    const FLAGS_MASK: usize = 0x3ff;

    fn new(ppn: usize, flags: PtEntryFlags) -> Self {
        Self((ppn << 10) | (flags.bits() & Self::FLAGS_MASK))
    }

    /// Physical page number this entry references.
    fn phys_page_num(&self) -> usize {
        self.0 >> 10
    }

    /// Physical address this entry references.
    pub fn phys_addr(&self) -> PhysAddr {
        PhysAddr::new(self.phys_page_num() << PAGE_SHIFT)
    }

    pub fn set_phys_addr(&mut self, pa: PhysAddr, flags: PtEntryFlags) {
        assert!(!self.is_valid());
        assert!(flags.contains(PtEntryFlags::V));
        *self = Self::new(pa.addr() >> PAGE_SHIFT, flags);
    }

    fn as_page_table(&self) -> Option<&PageTable> {
        self.is_non_leaf()
            .then(|| unsafe { self.phys_addr().as_ptr::<PageTable>().as_ref() })
    }

    fn as_page_table_mut(&mut self) -> Option<&mut PageTable> {
        self.is_non_leaf()
            .then(|| unsafe { self.phys_addr().as_ptr::<PageTable>().as_mut() })
    }

    fn set_page_table(&mut self, pt: NonNull<PageTable>) {
        assert!(!self.is_valid());
        *self = Self::new(pt.addr().get() >> PAGE_SHIFT, PtEntryFlags::V);
    }

    fn take_page_table(&mut self) -> Option<NonNull<PageTable>> {
        self.is_non_leaf().then(|| {
            let pt = self.phys_addr().as_ptr();
            self.clear();
            pt
        })
    }

    pub fn is_valid(&self) -> bool {
        self.flags().contains(PtEntryFlags::V)
    }

    /// A valid entry with any permission bit is a leaf.
    pub fn is_leaf(&self) -> bool {
        self.is_valid() && self.flags().intersects(PtEntryFlags::RWX)
    }

    pub fn is_non_leaf(&self) -> bool {
        self.is_valid() && !self.is_leaf()
    }

    pub fn flags(&self) -> PtEntryFlags {
        PtEntryFlags::from_bits_retain(self.0 & Self::FLAGS_MASK)
    }

    pub fn set_flags(&mut self, flags: PtEntryFlags) {
        self.0 = (self.0 & !Self::FLAGS_MASK) | flags.bits();
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}
