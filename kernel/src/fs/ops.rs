//! Path-level file system operations: create, link, unlink.

use moss_fs_types::{DIR_SIZE, T_DEVICE, T_DIR, T_FILE};

use crate::{
    error::KernelError,
    fs::{Inode, directory, inode, log::Tx, path},
    proc::ProcPrivateData,
};

/// Creates `path` as an inode of type `ty`, linking it into its parent
/// directory.
///
/// For `T_DEVICE`, `major`/`minor` name the device; for other types
/// they are ignored and persisted as zero. Opening an existing file
/// with create is allowed when both are regular files (or the existing
/// one is a device).
///
/// Returns an unlocked, referenced inode.
pub fn create(
    tx: &Tx,
    private: &ProcPrivateData,
    path: &[u8],
    ty: i16,
    major: i16,
    minor: i16,
) -> Result<Inode, KernelError> {
    let mut name = [0; DIR_SIZE];
    let (dp, name) = path::resolve_parent(tx, private, path, &mut name)?;
    let mut ldp = dp.lock(tx);

    if let Ok((ip, _off)) = directory::lookup(&mut ldp, tx, name) {
        // the name already exists.
        drop(ldp);
        dp.put(tx);
        let lip = ip.lock(tx);
        if ty == T_FILE && (lip.ty() == T_FILE || lip.ty() == T_DEVICE) {
            drop(lip);
            return Ok(ip);
        }
        drop(lip);
        ip.put(tx);
        return Err(KernelError::AlreadyExists);
    }

    let ip = match inode::alloc(tx, dp.dev(), ty) {
        Ok(ip) => ip,
        Err(e) => {
            drop(ldp);
            dp.put(tx);
            return Err(e);
        }
    };

    let mut lip = ip.lock(tx);
    lip.data.major = if ty == T_DEVICE { major } else { 0 };
    lip.data.minor = if ty == T_DEVICE { minor } else { 0 };
    lip.data.nlink = 1;
    lip.update(tx);

    let res = (|| {
        if ty == T_DIR {
            // "." and ".." entries; the ".." back-reference is counted
            // in the parent's nlink below.
            directory::link(&mut lip, tx, b".", ip.ino())?;
            directory::link(&mut lip, tx, b"..", dp.ino())?;
        }

        directory::link(&mut ldp, tx, name, ip.ino())?;

        if ty == T_DIR {
            ldp.data.nlink += 1; // for ".."
            ldp.update(tx);
        }
        Ok(())
    })();

    if let Err(e) = res {
        // undo the allocation; put() will free the inode on disk.
        lip.data.nlink = 0;
        lip.update(tx);
        drop(lip);
        ip.put(tx);
        drop(ldp);
        dp.put(tx);
        return Err(e);
    }

    drop(lip);
    drop(ldp);
    dp.put(tx);
    Ok(ip)
}

/// Creates `new` as a second name for the inode `old` refers to.
///
/// Hard links to directories are refused.
pub fn link(
    tx: &Tx,
    private: &ProcPrivateData,
    old: &[u8],
    new: &[u8],
) -> Result<(), KernelError> {
    let ip = path::resolve(tx, private, old)?;

    let mut lip = ip.lock(tx);
    if lip.ty() == T_DIR {
        drop(lip);
        ip.put(tx);
        return Err(KernelError::IsADirectory);
    }
    lip.data.nlink += 1;
    lip.update(tx);
    drop(lip);

    let res = (|| {
        let mut name = [0; DIR_SIZE];
        let (dp, name) = path::resolve_parent(tx, private, new, &mut name)?;
        let mut ldp = dp.lock(tx);

        let res = if ldp.dev() != ip.dev() {
            Err(KernelError::CrossDeviceLink)
        } else {
            directory::link(&mut ldp, tx, name, ip.ino())
        };

        drop(ldp);
        dp.put(tx);
        res
    })();

    if res.is_err() {
        let mut lip = ip.lock(tx);
        lip.data.nlink -= 1;
        lip.update(tx);
        drop(lip);
    }

    ip.put(tx);
    res
}

/// Removes the directory entry `path`.
///
/// An unlinked but still-open file keeps its contents until the last
/// reference is put. Removing a directory requires it to be empty and
/// also drops the parent's nlink for the child's "..".
pub fn unlink(tx: &Tx, private: &ProcPrivateData, path: &[u8]) -> Result<(), KernelError> {
    let mut name = [0; DIR_SIZE];
    let (dp, name) = path::resolve_parent(tx, private, path, &mut name)?;
    let mut ldp = dp.lock(tx);

    let res = (|| {
        // cannot unlink "." or "..".
        if name == b"." || name == b".." {
            return Err(KernelError::InvalidPath);
        }

        let (ip, off) = directory::lookup(&mut ldp, tx, name)?;
        let mut lip = ip.lock(tx);
        assert!(lip.nlink() > 0, "unlink of unlinked inode");

        if lip.ty() == T_DIR && !directory::is_empty(&mut lip, tx) {
            drop(lip);
            ip.put(tx);
            return Err(KernelError::DirectoryNotEmpty);
        }

        directory::unlink_at(&mut ldp, tx, off)?;
        if lip.ty() == T_DIR {
            // the removed directory's ".." no longer references the
            // parent.
            ldp.data.nlink -= 1;
            ldp.update(tx);
        }

        lip.data.nlink -= 1;
        lip.update(tx);
        drop(lip);
        ip.put(tx);
        Ok(())
    })();

    drop(ldp);
    dp.put(tx);
    res
}
