use dataview::Pod;

pub use moss_fs_types::{T_DEVICE, T_DIR, T_FILE};

/// File metadata, as returned by fstat(2).
#[derive(Debug, Clone, Pod)]
#[repr(C)]
pub struct Stat {
    /// Device number of the containing file system.
    pub dev: u32,
    /// Inode number.
    pub ino: u32,
    /// Size of the file in bytes.
    pub size: u64,
    /// File type.
    pub ty: i16,
    /// Number of links to the file.
    pub nlink: i16,
    _pad: [u8; 4],
}

impl Stat {
    pub fn new(dev: u32, ino: u32, ty: i16, nlink: i16, size: u64) -> Self {
        Self {
            dev,
            ino,
            size,
            ty,
            nlink,
            _pad: [0; 4],
        }
    }
}
