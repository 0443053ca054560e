//! Physical frame allocation, for user pages, kernel stacks,
//! page-table nodes, and pipe buffers.

use core::ptr::NonNull;

use frame_alloc::FrameAllocator;
use once_init::OnceInit;

use crate::{
    error::KernelError,
    memory::{PAGE_SIZE, PageRound as _, layout},
    sync::SpinLock,
};

static FRAME_POOL: OnceInit<SpinLock<FrameAllocator<PAGE_SIZE>>> = OnceInit::new();

pub fn init() {
    let start = layout::kernel_end().page_roundup();
    let end = layout::PHYS_TOP.page_rounddown();

    let range = core::ptr::with_exposed_provenance_mut(start)..core::ptr::with_exposed_provenance_mut(end);
    FRAME_POOL.init(SpinLock::new(unsafe { FrameAllocator::new(range) }));
}

/// Allocates one junk-filled frame.
pub fn alloc_frame() -> Result<NonNull<u8>, KernelError> {
    FRAME_POOL
        .get()
        .lock()
        .alloc()
        .ok_or(KernelError::OutOfFrames)
}

/// Allocates one zeroed frame.
pub fn alloc_zeroed_frame() -> Result<NonNull<u8>, KernelError> {
    FRAME_POOL
        .get()
        .lock()
        .alloc_zeroed()
        .ok_or(KernelError::OutOfFrames)
}

/// Returns a frame to the pool.
///
/// # Safety
///
/// `frame` must have come from [`alloc_frame`] or
/// [`alloc_zeroed_frame`] and must not be used afterwards.
pub unsafe fn free_frame(frame: NonNull<u8>) {
    unsafe { FRAME_POOL.get().lock().free(frame) }
}
