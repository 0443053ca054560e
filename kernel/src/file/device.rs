//! The device switch: read/write handlers keyed by major number.

use crate::{error::KernelError, param::NDEV, proc::ProcPrivateData, sync::SpinLock};

/// Handlers for one device major number.
///
/// `user` says whether the address is a user or kernel address.
#[derive(Clone, Copy)]
pub struct Device {
    pub read: fn(
        private: &ProcPrivateData,
        user: bool,
        dst: usize,
        n: usize,
    ) -> Result<usize, KernelError>,
    pub write: fn(
        private: &ProcPrivateData,
        user: bool,
        src: usize,
        n: usize,
    ) -> Result<usize, KernelError>,
}

static DEVICES: SpinLock<[Option<Device>; NDEV]> = SpinLock::new([None; NDEV]);

/// Installs the handlers for `major`. Called by drivers at boot.
pub fn register_device(major: i16, dev: Device) {
    let mut devices = DEVICES.lock();
    let slot = &mut devices[usize::try_from(major).expect("bad major number")];
    assert!(slot.is_none(), "device registered twice");
    *slot = Some(dev);
}

pub(super) fn get(major: i16) -> Option<Device> {
    let devices = DEVICES.lock();
    usize::try_from(major).ok().and_then(|m| devices.get(m).copied().flatten())
}
