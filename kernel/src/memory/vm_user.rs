//! Per-process user address spaces.
//!
//! A user address space runs from virtual 0 up to `size`, with the
//! trap-frame page and the shared trampoline page mapped near the top
//! of the virtual range (both supervisor-only).

use core::ptr::NonNull;

use dataview::{Pod, PodMethods as _};

use crate::{
    error::KernelError,
    interrupt::trampoline,
    memory::{
        PAGE_SIZE, PageRound as _, PhysAddr, VirtAddr,
        layout::{TRAMPOLINE, TRAPFRAME},
        page,
        page_table::{PageTable, PtEntryFlags},
    },
};

pub struct UserPageTable {
    root: NonNull<PageTable>,
    /// User memory size in bytes.
    size: usize,
}

unsafe impl Send for UserPageTable {}

impl UserPageTable {
    /// Creates an address space with no user memory, but with the
    /// trampoline and the given trap-frame page mapped.
    pub fn new(trapframe: PhysAddr) -> Result<Self, KernelError> {
        let mut root = PageTable::try_allocate()?;
        let pt = unsafe { root.as_mut() };

        if let Err(e) = pt.map_page(
            TRAMPOLINE,
            PhysAddr::new(trampoline::trampoline as usize),
            PtEntryFlags::RX,
        ) {
            unsafe { PageTable::free(root) };
            return Err(e);
        }

        if let Err(e) = pt.map_page(TRAPFRAME, trapframe, PtEntryFlags::RW) {
            pt.unmap_page(TRAMPOLINE);
            unsafe { PageTable::free(root) };
            return Err(e);
        }

        Ok(Self { root, size: 0 })
    }

    /// User memory size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The value to load into satp to run on this address space.
    pub fn satp(&self) -> usize {
        // mode Sv39
        (8 << 60) | unsafe { self.root.as_ref() }.phys_page_num()
    }

    fn pt(&self) -> &PageTable {
        unsafe { self.root.as_ref() }
    }

    fn pt_mut(&mut self) -> &mut PageTable {
        unsafe { self.root.as_mut() }
    }

    /// Loads the user initcode into address 0, for the very first
    /// process. `src` must be smaller than a page.
    pub fn map_first(&mut self, src: &[u8]) -> Result<(), KernelError> {
        assert!(src.len() < PAGE_SIZE, "initcode larger than a page");
        assert_eq!(self.size, 0);

        let mem = page::alloc_zeroed_frame()?;
        self.pt_mut()
            .map_page(VirtAddr::MIN, PhysAddr::from_ptr(mem), PtEntryFlags::URWX)?;
        unsafe {
            mem.as_ptr().copy_from_nonoverlapping(src.as_ptr(), src.len());
        }
        self.size = PAGE_SIZE;
        Ok(())
    }

    /// Allocates zeroed frames and PTEs to grow the space to
    /// `new_size`, which need not be page-aligned. New pages carry
    /// `U | R | xperm`.
    ///
    /// On failure the space is restored to its old size.
    pub fn grow_to(&mut self, new_size: usize, xperm: PtEntryFlags) -> Result<(), KernelError> {
        if new_size <= self.size {
            return Ok(());
        }
        VirtAddr::new(new_size)?;

        let old_size = self.size;
        let mut va = self.size.page_roundup();
        while va < new_size {
            // track how far we got, for the unwind path.
            self.size = va;

            let mem = match page::alloc_zeroed_frame() {
                Ok(mem) => mem,
                Err(e) => {
                    self.shrink_to(old_size);
                    return Err(e);
                }
            };
            if let Err(e) = self.pt_mut().map_page(
                VirtAddr::new(va).unwrap(),
                PhysAddr::from_ptr(mem),
                xperm | PtEntryFlags::UR,
            ) {
                unsafe { page::free_frame(mem) };
                self.shrink_to(old_size);
                return Err(e);
            }
            va += PAGE_SIZE;
        }

        self.size = new_size;
        Ok(())
    }

    /// Frees user pages to shrink the space to `new_size` (which need
    /// not be page-aligned, nor smaller than the current size).
    pub fn shrink_to(&mut self, new_size: usize) {
        if new_size >= self.size {
            return;
        }

        let keep = new_size.page_roundup();
        let mut va = keep;
        while va < self.size.page_roundup() {
            let pa = self.pt_mut().unmap_page(VirtAddr::new(va).unwrap());
            unsafe { page::free_frame(pa.as_ptr()) };
            va += PAGE_SIZE;
        }

        self.size = new_size;
    }

    /// Copies this address space's memory into `target`, page by page,
    /// with identical permissions.
    ///
    /// On failure `target` is emptied.
    pub fn try_clone_into(&self, target: &mut Self) -> Result<(), KernelError> {
        target.shrink_to(0);

        let res = (|| {
            let mut va = 0;
            while va < self.size {
                target.size = va;

                let pte = self.pt().find_leaf(VirtAddr::new(va).unwrap())?;
                let src = pte.phys_addr();
                let flags = pte.flags();

                let dst = page::alloc_frame()?;
                unsafe {
                    dst.as_ptr()
                        .copy_from_nonoverlapping(src.as_ptr().as_ptr(), PAGE_SIZE);
                }
                if let Err(e) = target.pt_mut().map_page(
                    VirtAddr::new(va).unwrap(),
                    PhysAddr::from_ptr(dst),
                    flags,
                ) {
                    unsafe { page::free_frame(dst) };
                    return Err(e);
                }
                va += PAGE_SIZE;
            }
            target.size = self.size;
            Ok(())
        })();

        if res.is_err() {
            target.shrink_to(0);
        }
        res
    }

    /// Clears the user bit on the page at `va`.
    ///
    /// Used by exec to turn the page below the stack into an
    /// inaccessible guard.
    pub fn forbid_user_access(&mut self, va: VirtAddr) -> Result<(), KernelError> {
        self.pt_mut().update_leaf(va, false, |pte| {
            let mut flags = pte.flags();
            flags.remove(PtEntryFlags::U);
            pte.set_flags(flags);
        })
    }

    /// Translates `va`, requiring a leaf with `flags`.
    pub fn resolve(&self, va: VirtAddr, flags: PtEntryFlags) -> Result<PhysAddr, KernelError> {
        self.pt().resolve(va, flags)
    }

    /// Copies `src` into user memory at `dst`.
    ///
    /// Fails without copying anything past an unmapped or
    /// user-inaccessible page.
    pub fn copy_out_bytes(&self, dst: VirtAddr, mut src: &[u8]) -> Result<(), KernelError> {
        let mut va = dst;
        while !src.is_empty() {
            let va0 = va.page_rounddown();
            let offset = va.addr() - va0.addr();
            let n = usize::min(src.len(), PAGE_SIZE - offset);

            let pa = self.resolve(va0, PtEntryFlags::UW)?;
            unsafe {
                pa.byte_add(offset)
                    .as_ptr::<u8>()
                    .as_ptr()
                    .copy_from_nonoverlapping(src.as_ptr(), n);
            }

            src = &src[n..];
            va = va.byte_add(n)?;
        }
        Ok(())
    }

    pub fn copy_out<T: Pod>(&self, dst: VirtAddr, src: &T) -> Result<(), KernelError> {
        self.copy_out_bytes(dst, src.as_bytes())
    }

    /// Copies user memory at `src` into `dst`.
    pub fn copy_in_bytes(&self, mut dst: &mut [u8], src: VirtAddr) -> Result<(), KernelError> {
        let mut va = src;
        while !dst.is_empty() {
            let va0 = va.page_rounddown();
            let offset = va.addr() - va0.addr();
            let n = usize::min(dst.len(), PAGE_SIZE - offset);

            let pa = self.resolve(va0, PtEntryFlags::UR)?;
            unsafe {
                pa.byte_add(offset)
                    .as_ptr::<u8>()
                    .as_ptr()
                    .copy_to_nonoverlapping(dst.as_mut_ptr(), n);
            }

            dst = &mut dst[n..];
            va = va.byte_add(n)?;
        }
        Ok(())
    }

    pub fn copy_in<T: Pod>(&self, src: VirtAddr) -> Result<T, KernelError> {
        let mut val = T::zeroed();
        self.copy_in_bytes(val.as_bytes_mut(), src)?;
        Ok(val)
    }

    /// Copies a NUL-terminated string from user memory at `src` into
    /// `dst`, including the NUL.
    ///
    /// Returns the string length, or an error if no NUL appears within
    /// `dst.len()` bytes.
    pub fn copy_in_str(&self, dst: &mut [u8], src: VirtAddr) -> Result<usize, KernelError> {
        let mut copied = 0;
        let mut va = src;
        while copied < dst.len() {
            let va0 = va.page_rounddown();
            let offset = va.addr() - va0.addr();
            let n = usize::min(dst.len() - copied, PAGE_SIZE - offset);

            let page = self.pt().fetch_page(va0, PtEntryFlags::UR)?;
            let chunk = &page[offset..offset + n];
            for (i, &b) in chunk.iter().enumerate() {
                dst[copied + i] = b;
                if b == 0 {
                    return Ok(copied + i);
                }
            }

            copied += n;
            va = va.byte_add(n)?;
        }
        Err(KernelError::UnterminatedString(src))
    }
}

impl Drop for UserPageTable {
    fn drop(&mut self) {
        let pt = unsafe { self.root.as_mut() };
        pt.unmap_page(TRAMPOLINE);
        pt.unmap_page(TRAPFRAME);

        let mut va = 0;
        while va < self.size.page_roundup() {
            let pa = pt.unmap_page(VirtAddr::new(va).unwrap());
            unsafe { page::free_frame(pa.as_ptr()) };
            va += PAGE_SIZE;
        }

        unsafe { PageTable::free(self.root) };
    }
}
