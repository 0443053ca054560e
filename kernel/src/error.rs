use crate::memory::VirtAddr;

/// Every way a kernel operation can fail without halting.
///
/// Invariant violations (bad on-disk state, cache over-subscription,
/// remapping a mapped page) are not errors; they panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    #[error("out of physical frames")]
    OutOfFrames,
    #[error("no free process slot")]
    OutOfProcesses,
    #[error("no child process")]
    NoChildProcess,
    #[error("no such process")]
    ProcessNotFound,
    #[error("caller was killed")]
    ProcessKilled,
    #[error("virtual address too large: {0:#x}")]
    TooLargeVirtualAddress(usize),
    #[error("address not mapped: {0:#x}")]
    AddressNotMapped(VirtAddr),
    #[error("inaccessible user memory: {0:#x}")]
    InaccessibleMemory(VirtAddr),
    #[error("unterminated user string at {0:#x}")]
    UnterminatedString(VirtAddr),
    #[error("bad file descriptor")]
    BadFileDescriptor,
    #[error("file not readable")]
    FileNotReadable,
    #[error("file not writable")]
    FileNotWritable,
    #[error("too many open files in system")]
    TooManyOpenFilesSystem,
    #[error("too many open files")]
    TooManyOpenFiles,
    #[error("broken pipe")]
    BrokenPipe,
    #[error("no such device")]
    NoDevice,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("no such file or directory")]
    EntryNotFound,
    #[error("entry already exists")]
    AlreadyExists,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("invalid path")]
    InvalidPath,
    #[error("link across devices")]
    CrossDeviceLink,
    #[error("file too large")]
    FileTooLarge,
    #[error("out of data blocks")]
    OutOfDataBlocks,
    #[error("out of inodes")]
    OutOfInodes,
    #[error("argument list too long")]
    ArgumentListTooLong,
    #[error("invalid executable")]
    InvalidExecutable,
}
