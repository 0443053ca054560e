//! Physical memory layout.
//!
//! qemu -machine virt is set up like this, based on qemu's
//! [hw/riscv/virt.c]:
//!
//! ```text
//! 0x0000_1000 -- boot ROM, provided by qemu
//! 0x0200_0000 -- CLINT
//! 0x0c00_0000 -- PLIC
//! 0x1000_0000 -- UART0
//! 0x1000_1000 -- virtio disk
//! 0x8000_0000 -- boot ROM jumps here in machine mode;
//!                -kernel loads the kernel here
//! unused RAM after 0x8000_0000.
//! ```
//!
//! the kernel uses physical memory thus:
//!
//! ```text
//! 0x8000_0000    -- KERNEL_BASE, start of kernel text
//! _moss_text_end -- start of kernel data
//! _moss_kernel_end -- start of frame allocation area
//! PHYS_TOP       -- end of RAM used by the kernel
//! ```
//!
//! [hw/riscv/virt.c]: https://github.com/qemu/qemu/blob/v9.2.0/hw/riscv/virt.c

use crate::{
    memory::{PAGE_SIZE, VirtAddr},
    param::NPROC,
};

// qemu puts UART registers here in physical memory.
pub const UART0: usize = 0x1000_0000;
pub const UART0_IRQ: u32 = 10;

// virtio mmio interface.
pub const VIRTIO0: usize = 0x1000_1000;
pub const VIRTIO0_IRQ: u32 = 1;

// qemu puts the platform-level interrupt controller (PLIC) here.
pub const PLIC: usize = 0x0c00_0000;
pub const PLIC_SIZE: usize = 0x40_0000;

pub const fn plic_senable(hart: usize) -> usize {
    PLIC + 0x2080 + hart * 0x100
}
pub const fn plic_spriority(hart: usize) -> usize {
    PLIC + 0x20_1000 + hart * 0x2000
}
pub const fn plic_sclaim(hart: usize) -> usize {
    PLIC + 0x20_1004 + hart * 0x2000
}

/// Where the boot ROM jumps: start of kernel text.
pub const KERNEL_BASE: usize = 0x8000_0000;

/// The kernel assumes RAM from [`KERNEL_BASE`] up to here.
pub const PHYS_TOP: usize = KERNEL_BASE + 128 * 1024 * 1024;

unsafe extern "C" {
    /// First address after kernel text. Defined by kernel.ld.
    #[link_name = "_moss_text_end"]
    static TEXT_END_SYM: [u8; 0];

    /// First address after the kernel image. Defined by kernel.ld.
    #[link_name = "_moss_kernel_end"]
    static KERNEL_END_SYM: [u8; 0];
}

/// First address after kernel text.
pub fn text_end() -> usize {
    (&raw const TEXT_END_SYM).addr()
}

/// First address after the kernel image; frames start here.
pub fn kernel_end() -> usize {
    (&raw const KERNEL_END_SYM).addr()
}

// User memory layout, address zero first:
//
// ```text
//   text
//   original data and bss
//   expandable heap
//   ...
//   guard page
//   user stack
//   ...
//   TRAPFRAME (used by the trampoline)
//   TRAMPOLINE (the same page as in the kernel)
// ```

/// The trampoline page, at the top of both user and kernel space.
pub const TRAMPOLINE: VirtAddr = VirtAddr::MAX.byte_sub(PAGE_SIZE);

/// The per-process trap-frame page, just under the trampoline.
pub const TRAPFRAME: VirtAddr = TRAMPOLINE.byte_sub(PAGE_SIZE);

/// Kernel stack of process slot `p`; each stack has an unmapped guard
/// page below it.
pub const fn kstack(p: usize) -> VirtAddr {
    assert!(p < NPROC);
    TRAMPOLINE.byte_sub((1 + (p + 1) * 2) * PAGE_SIZE)
}
