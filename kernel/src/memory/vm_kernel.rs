//! The kernel address space: a direct map of devices and RAM, plus the
//! trampoline and the per-process kernel stacks near the top.

use core::ptr::NonNull;

use once_init::OnceInit;
use riscv::{asm, register::satp};

use crate::{
    interrupt::trampoline,
    memory::{
        PAGE_SIZE, PageRound as _, PhysAddr, VirtAddr,
        layout::{KERNEL_BASE, PHYS_TOP, PLIC, PLIC_SIZE, TRAMPOLINE, UART0, VIRTIO0, text_end},
        page_table::{PageTable, PtEntryFlags},
    },
    proc,
};

struct KernelPageTable(NonNull<PageTable>);

unsafe impl Send for KernelPageTable {}
unsafe impl Sync for KernelPageTable {}

static KERNEL_PAGE_TABLE: OnceInit<KernelPageTable> = OnceInit::new();

fn ident_map(kpgtbl: &mut PageTable, addr: usize, size: usize, perm: PtEntryFlags) {
    let start = addr.page_rounddown();
    let end = (addr + size).page_roundup();
    kpgtbl
        .map_pages(
            VirtAddr::new(start).unwrap(),
            (end - start) / PAGE_SIZE,
            PhysAddr::new(start),
            perm,
        )
        .unwrap();
}

/// Builds the direct-map kernel page table.
pub fn init() {
    use PtEntryFlags as F;

    let mut root = PageTable::try_allocate().unwrap();
    let kpgtbl = unsafe { root.as_mut() };

    // uart registers
    ident_map(kpgtbl, UART0, PAGE_SIZE, F::RW);

    // virtio mmio disk interface
    ident_map(kpgtbl, VIRTIO0, PAGE_SIZE, F::RW);

    // PLIC
    ident_map(kpgtbl, PLIC, PLIC_SIZE, F::RW);

    // kernel text, executable and read-only.
    ident_map(kpgtbl, KERNEL_BASE, text_end() - KERNEL_BASE, F::RX);

    // kernel data and the physical RAM we'll make use of.
    ident_map(kpgtbl, text_end(), PHYS_TOP - text_end(), F::RW);

    // the trampoline, at the highest virtual address; it is the only
    // page shared with user address spaces.
    kpgtbl
        .map_page(
            TRAMPOLINE,
            PhysAddr::new(trampoline::trampoline as usize),
            F::RX,
        )
        .unwrap();

    // one kernel stack per process slot, each under a guard hole.
    proc::map_stacks(kpgtbl);

    KERNEL_PAGE_TABLE.init(KernelPageTable(root));
}

/// Switches this hart's page table register to the kernel page table
/// and enables paging.
pub fn init_hart() {
    // wait for any previous writes to page-table memory to finish.
    asm::sfence_vma_all();

    let ppn = unsafe { KERNEL_PAGE_TABLE.get().0.as_ref() }.phys_page_num();
    unsafe {
        satp::set(satp::Mode::Sv39, 0, ppn);
    }

    // flush stale entries from the TLB.
    asm::sfence_vma_all();
}
