//! Tunable constants shared by the kernel, mkfs, and the tests.

#![no_std]

/// Maximum number of processes.
pub const NPROC: usize = 64;
/// Maximum number of CPUs.
pub const NCPU: usize = 8;
/// Open files per process.
pub const NOFILE: usize = 16;
/// Open files per system.
pub const NFILE: usize = 100;
/// Maximum number of active i-nodes.
pub const NINODE: usize = 50;
/// Maximum major device number.
pub const NDEV: usize = 10;
/// Device number of the file system root disk.
pub const ROOT_DEV: u32 = 1;
/// Maximum number of exec arguments.
pub const MAX_ARG: usize = 32;
/// Maximum length of a path argument.
pub const MAX_PATH: usize = 128;

/// Maximum number of blocks any single FS operation may write.
pub const MAX_OP_BLOCKS: usize = 10;
/// Maximum data blocks in the on-disk log.
pub const LOG_SIZE: usize = MAX_OP_BLOCKS * 3;
/// Size of the disk block cache.
pub const NBUF: usize = MAX_OP_BLOCKS * 3;
/// Size of the file system image in blocks.
pub const FS_SIZE: usize = 2000;
/// Number of inodes in the file system image.
pub const NUM_FS_INODES: usize = 200;

/// Pages of user stack set up by exec (a guard page sits below them).
pub const USER_STACK_PAGES: usize = 1;
