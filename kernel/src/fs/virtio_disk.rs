//! Driver for qemu's virtio disk device.
//!
//! Uses qemu's mmio interface to virtio. The device presents one
//! virtqueue; each disk transfer is a chain of three descriptors:
//! request header, data block, and a one-byte status.

use core::{
    ptr,
    sync::atomic::{AtomicBool, Ordering},
};

use moss_fs_types::BLOCK_SIZE;

use crate::{
    fs::virtio::{
        ConfigStatus, DeviceFeatures, MmioRegister, QUEUE_SIZE, SECTOR_SIZE, VirtioBlkReq,
        VirtioBlkReqType, VirtqAvail, VirtqDesc, VirtqDescFlags, VirtqUsed,
    },
    memory::{PAGE_SIZE, layout::VIRTIO0, page},
    proc,
    sync::SpinLock,
};

struct Disk {
    /// DMA descriptors, with which the driver tells the device where to
    /// read and write individual disk operations.
    ///
    /// Most commands consist of a chain of a couple of these.
    desc: *mut [VirtqDesc; QUEUE_SIZE],

    /// A ring in which the driver writes descriptor numbers that it
    /// would like the device to process (only chain heads).
    avail: *mut VirtqAvail,

    /// A ring in which the device writes descriptor numbers that it has
    /// finished processing (only chain heads).
    used: *mut VirtqUsed,

    /// Is a descriptor free?
    free: [bool; QUEUE_SIZE],
    /// We've looked this far in used.ring.
    used_idx: u16,

    /// Per-chain info about in-flight operations, for use when the
    /// completion interrupt arrives. Indexed by the chain's first
    /// descriptor index.
    info: [TrackInfo; QUEUE_SIZE],

    /// Disk request headers, one-for-one with descriptors.
    ops: [VirtioBlkReq; QUEUE_SIZE],
}

unsafe impl Send for Disk {}

struct TrackInfo {
    /// The in-flight buffer; doubles as the completion wait channel.
    data: *const u8,
    /// Device writes 0 here on success.
    status: u8,
    in_progress: AtomicBool,
}

fn reg_read(r: MmioRegister) -> u32 {
    unsafe { ptr::with_exposed_provenance::<u32>(VIRTIO0 + r as usize).read_volatile() }
}

fn reg_write(r: MmioRegister, value: u32) {
    unsafe { ptr::with_exposed_provenance_mut::<u32>(VIRTIO0 + r as usize).write_volatile(value) }
}

static DISK: SpinLock<Disk> = SpinLock::new(Disk {
    desc: ptr::null_mut(),
    avail: ptr::null_mut(),
    used: ptr::null_mut(),
    free: [false; QUEUE_SIZE],
    used_idx: 0,
    info: [const {
        TrackInfo {
            data: ptr::null(),
            status: 0,
            in_progress: AtomicBool::new(false),
        }
    }; QUEUE_SIZE],
    ops: [const {
        VirtioBlkReq {
            ty: VirtioBlkReqType::In,
            reserved: 0,
            sector: 0,
        }
    }; QUEUE_SIZE],
});

pub fn init() {
    assert_eq!(reg_read(MmioRegister::MagicValue), 0x7472_6976);
    assert_eq!(reg_read(MmioRegister::Version), 2);
    assert_eq!(reg_read(MmioRegister::DeviceId), 2);
    assert_eq!(reg_read(MmioRegister::VendorId), 0x554d_4551);

    let mut disk = DISK.lock();

    let mut status = ConfigStatus::empty();

    // reset device.
    reg_write(MmioRegister::Status, status.bits());

    status |= ConfigStatus::ACKNOWLEDGE;
    reg_write(MmioRegister::Status, status.bits());

    status |= ConfigStatus::DRIVER;
    reg_write(MmioRegister::Status, status.bits());

    // negotiate features.
    let mut features = DeviceFeatures::from_bits_retain(reg_read(MmioRegister::DeviceFeatures));
    features.remove(DeviceFeatures::BLK_RO);
    features.remove(DeviceFeatures::BLK_SCSI);
    features.remove(DeviceFeatures::BLK_CONFIG_WCE);
    features.remove(DeviceFeatures::BLK_MQ);
    features.remove(DeviceFeatures::ANY_LAYOUT);
    features.remove(DeviceFeatures::RING_EVENT_IDX);
    features.remove(DeviceFeatures::RING_INDIRECT_DESC);
    reg_write(MmioRegister::DriverFeatures, features.bits());

    // tell the device feature negotiation is complete.
    status |= ConfigStatus::FEATURES_OK;
    reg_write(MmioRegister::Status, status.bits());

    // re-read status to ensure FEATURES_OK is set.
    status = ConfigStatus::from_bits_retain(reg_read(MmioRegister::Status));
    assert!(status.contains(ConfigStatus::FEATURES_OK));

    // initialize queue 0.
    reg_write(MmioRegister::QueueSel, 0);
    assert_eq!(reg_read(MmioRegister::QueueReady), 0, "queue in use");

    let max = reg_read(MmioRegister::QueueNumMax);
    assert!(max != 0, "no virtio disk");
    assert!(max as usize >= QUEUE_SIZE, "queue too short");

    // allocate and zero queue memory.
    disk.desc = page::alloc_frame().unwrap().as_ptr().cast();
    disk.avail = page::alloc_frame().unwrap().as_ptr().cast();
    disk.used = page::alloc_frame().unwrap().as_ptr().cast();
    unsafe {
        disk.desc.cast::<u8>().write_bytes(0, PAGE_SIZE);
        disk.avail.cast::<u8>().write_bytes(0, PAGE_SIZE);
        disk.used.cast::<u8>().write_bytes(0, PAGE_SIZE);
    }

    reg_write(MmioRegister::QueueNum, QUEUE_SIZE as u32);

    // write physical addresses.
    fn low(p: usize) -> u32 {
        (p & 0xffff_ffff) as u32
    }
    fn high(p: usize) -> u32 {
        ((p >> 32) & 0xffff_ffff) as u32
    }

    reg_write(MmioRegister::QueueDescLow, low(disk.desc.addr()));
    reg_write(MmioRegister::QueueDescHigh, high(disk.desc.addr()));
    reg_write(MmioRegister::DriverDescLow, low(disk.avail.addr()));
    reg_write(MmioRegister::DriverDescHigh, high(disk.avail.addr()));
    reg_write(MmioRegister::DeviceDescLow, low(disk.used.addr()));
    reg_write(MmioRegister::DeviceDescHigh, high(disk.used.addr()));

    reg_write(MmioRegister::QueueReady, 1);

    // all descriptors start out unused.
    disk.free.fill(true);

    // tell the device we're completely ready.
    status |= ConfigStatus::DRIVER_OK;
    reg_write(MmioRegister::Status, status.bits());
}

/// Finds a free descriptor, marks it non-free, returns its index.
fn alloc_desc(disk: &mut Disk) -> Option<usize> {
    let idx = disk.free.iter().position(|&free| free)?;
    disk.free[idx] = false;
    Some(idx)
}

/// Marks a descriptor free.
fn free_desc(disk: &mut Disk, i: usize) {
    assert!(i < QUEUE_SIZE);
    assert!(!disk.free[i], "descriptor freed twice");
    unsafe {
        (*disk.desc)[i] = VirtqDesc {
            addr: 0,
            len: 0,
            flags: VirtqDescFlags::empty(),
            next: 0,
        };
    }
    disk.free[i] = true;
    proc::wakeup(ptr::from_ref(&disk.free[0]).addr());
}

/// Frees a chain of descriptors.
fn free_chain(disk: &mut Disk, mut i: usize) {
    loop {
        let desc = unsafe { &(*disk.desc)[i] };
        let flags = desc.flags;
        let next = desc.next;
        free_desc(disk, i);
        if !flags.contains(VirtqDescFlags::NEXT) {
            break;
        }
        i = next.into();
    }
}

/// Allocates the three descriptors a disk transfer uses (they need not
/// be contiguous).
fn alloc3_desc(disk: &mut Disk) -> Option<[usize; 3]> {
    let mut idx = [0; 3];
    for i in 0..3 {
        match alloc_desc(disk) {
            Some(x) => idx[i] = x,
            None => {
                for j in &idx[0..i] {
                    free_desc(disk, *j);
                }
                return None;
            }
        }
    }
    Some(idx)
}

fn read_or_write(block_no: usize, data: *const u8, write: bool) {
    let mut disk = DISK.lock();

    // allocate three descriptors.
    let idx = loop {
        if let Some(idx) = alloc3_desc(&mut disk) {
            break idx;
        }
        disk = proc::sleep(ptr::from_ref(&disk.free[0]).addr(), disk);
    };

    // format the three descriptors: section 5.2 says a legacy block
    // operation uses one for type/reserved/sector, one for the data,
    // and one for a 1-byte status result.

    let sector = (block_no * (BLOCK_SIZE / SECTOR_SIZE)) as u64;

    disk.ops[idx[0]] = VirtioBlkReq {
        ty: if write {
            VirtioBlkReqType::Out
        } else {
            VirtioBlkReqType::In
        },
        reserved: 0,
        sector,
    };
    let req_addr = ptr::from_ref(&disk.ops[idx[0]]).addr();

    unsafe {
        (*disk.desc)[idx[0]] = VirtqDesc {
            addr: req_addr as u64,
            len: size_of::<VirtioBlkReq>() as u32,
            flags: VirtqDescFlags::NEXT,
            next: idx[1] as u16,
        };

        (*disk.desc)[idx[1]] = VirtqDesc {
            addr: data.addr() as u64,
            len: BLOCK_SIZE as u32,
            flags: if write {
                VirtqDescFlags::NEXT // device reads the block
            } else {
                VirtqDescFlags::NEXT | VirtqDescFlags::WRITE // device writes the block
            },
            next: idx[2] as u16,
        };

        disk.info[idx[0]].status = 0xff; // device writes 0 on success
        (*disk.desc)[idx[2]] = VirtqDesc {
            addr: (&raw mut disk.info[idx[0]].status).addr() as u64,
            len: 1,
            flags: VirtqDescFlags::WRITE,
            next: 0,
        };
    }

    // record the buffer for handle_interrupt().
    disk.info[idx[0]].data = data;
    disk.info[idx[0]].in_progress.store(true, Ordering::Release);

    // tell the device the first index of our chain, and that another
    // avail ring entry is available.
    unsafe {
        let avail_idx = (*disk.avail).idx.load(Ordering::Relaxed) as usize;
        (*disk.avail).ring[avail_idx % QUEUE_SIZE] = idx[0] as u16;
        (*disk.avail).idx.fetch_add(1, Ordering::AcqRel);
    }

    reg_write(MmioRegister::QueueNotify, 0); // value is queue number

    // wait for handle_interrupt() to say the request has finished.
    while disk.info[idx[0]].in_progress.load(Ordering::Acquire) {
        disk = proc::sleep(data.addr(), disk);
    }

    assert_eq!(disk.info[idx[0]].status, 0, "disk transfer failed");
    disk.info[idx[0]].data = ptr::null();
    free_chain(&mut disk, idx[0]);
}

/// Reads one block synchronously.
pub fn read(block_no: usize, data: &mut [u8; BLOCK_SIZE]) {
    read_or_write(block_no, data.as_ptr(), false);
}

/// Writes one block synchronously.
pub fn write(block_no: usize, data: &[u8; BLOCK_SIZE]) {
    read_or_write(block_no, data.as_ptr(), true);
}

pub fn handle_interrupt() {
    let mut disk = DISK.lock();

    // the device won't raise another interrupt until we acknowledge
    // this one. the ack may race with the device adding new used-ring
    // entries; then we process the new completions now and have
    // nothing to do at the next interrupt, which is harmless.
    reg_write(
        MmioRegister::InterruptAck,
        reg_read(MmioRegister::InterruptStatus) & 0x3,
    );

    // the device increments used.idx when it adds an entry to the used
    // ring.
    unsafe {
        while disk.used_idx != (*disk.used).idx.load(Ordering::Acquire) {
            let id = (*disk.used).ring[disk.used_idx as usize % QUEUE_SIZE].id;

            let info = &disk.info[id as usize];
            info.in_progress.store(false, Ordering::Release); // disk is done with the buffer
            proc::wakeup(info.data.addr());

            disk.used_idx += 1;
        }
    }
}
