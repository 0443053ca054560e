//! Virtio device definitions, for both the MMIO interface and the
//! virtqueue descriptors.
//!
//! The virtio spec:
//! <https://docs.oasis-open.org/virtio/virtio/v1.1/virtio-v1.1.pdf>

use core::sync::atomic::AtomicU16;

use bitflags::bitflags;

/// This many virtio descriptors. Must be a power of two.
pub const QUEUE_SIZE: usize = 8;

/// Virtio MMIO control registers, mapped starting at VIRTIO0.
///
/// From qemu's virtio_mmio.h.
#[repr(usize)]
pub enum MmioRegister {
    /// 0x74726976
    MagicValue = 0x000,
    /// version; should be 2
    Version = 0x004,
    /// device type; 1 is net, 2 is disk
    DeviceId = 0x008,
    /// 0x554d4551
    VendorId = 0x00c,
    DeviceFeatures = 0x010,
    DriverFeatures = 0x020,
    /// select queue, write-only
    QueueSel = 0x030,
    /// max size of current queue, read-only
    QueueNumMax = 0x034,
    /// size of current queue, write-only
    QueueNum = 0x038,
    /// ready bit
    QueueReady = 0x044,
    /// write-only
    QueueNotify = 0x050,
    /// read-only
    InterruptStatus = 0x060,
    /// write-only
    InterruptAck = 0x064,
    /// read/write
    Status = 0x070,
    /// physical address for descriptor table, write-only
    QueueDescLow = 0x080,
    QueueDescHigh = 0x084,
    /// physical address for available ring, write-only
    DriverDescLow = 0x090,
    DriverDescHigh = 0x094,
    /// physical address for used ring, write-only
    DeviceDescLow = 0x0a0,
    DeviceDescHigh = 0x0a4,
}

bitflags! {
    /// Status register bits, from qemu's virtio_config.h.
    #[derive(Debug, Clone, Copy)]
    pub struct ConfigStatus: u32 {
        const ACKNOWLEDGE = 1;
        const DRIVER = 2;
        const DRIVER_OK = 4;
        const FEATURES_OK = 8;
    }
}

bitflags! {
    /// Device feature bits.
    #[derive(Debug, Clone, Copy)]
    pub struct DeviceFeatures: u32 {
        /// Disk is read-only.
        const BLK_RO = 1 << 5;
        /// Supports scsi command passthrough.
        const BLK_SCSI = 1 << 7;
        /// Writeback mode available in config.
        const BLK_CONFIG_WCE = 1 << 11;
        /// Supports more than one virtqueue.
        const BLK_MQ = 1 << 12;
        const ANY_LAYOUT = 1 << 27;
        const RING_INDIRECT_DESC = 1 << 28;
        const RING_EVENT_IDX = 1 << 29;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy)]
    pub struct VirtqDescFlags: u16 {
        /// Chained with another descriptor.
        const NEXT = 1;
        /// Device writes (vs. reads).
        const WRITE = 2;
    }
}

/// A single descriptor, from the spec.
#[repr(C)]
pub struct VirtqDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: VirtqDescFlags,
    pub next: u16,
}

/// The (entire) avail ring, from the spec.
#[repr(C)]
pub struct VirtqAvail {
    /// Always zero.
    pub flags: u16,
    /// Driver will write ring[idx] next.
    pub idx: AtomicU16,
    /// Descriptor numbers of chain heads.
    pub ring: [u16; QUEUE_SIZE],
    pub unused: u16,
}

/// One entry in the "used" ring, with which the device tells the
/// driver about completed requests.
#[repr(C)]
pub struct VirtqUsedElem {
    /// Index of the start of the completed descriptor chain.
    pub id: u32,
    pub len: u32,
}

#[repr(C)]
pub struct VirtqUsed {
    /// Always zero.
    pub flags: u16,
    /// Device increments when it adds a ring[] entry.
    pub idx: AtomicU16,
    pub ring: [VirtqUsedElem; QUEUE_SIZE],
}

// These are specific to virtio block devices, described in section 5.2
// of the spec.

#[repr(u32)]
#[derive(Clone, Copy)]
pub enum VirtioBlkReqType {
    /// Read the disk.
    In = 0,
    /// Write the disk.
    Out = 1,
}

/// The first descriptor in a disk request, followed by the data block
/// and a one-byte status.
#[repr(C)]
pub struct VirtioBlkReq {
    pub ty: VirtioBlkReqType,
    pub reserved: u32,
    pub sector: u64,
}

/// Disk sector size; blocks are a multiple of this.
pub const SECTOR_SIZE: usize = 512;
