//! Directory contents: an array of fixed-size entries, inode number
//! plus a short name. Entry 0 in the inode-number field marks a free
//! slot.

use dataview::PodMethods as _;
use moss_fs_types::{DirEntry, InodeNo, T_DIR};

use crate::{
    error::KernelError,
    fs::{Inode, LockedInode, log::Tx},
};

const ENTRY_SIZE: usize = size_of::<DirEntry>();

/// Looks up a name in the directory `ldp`.
///
/// On a hit, returns a reference to the entry's inode and the entry's
/// byte offset in the directory.
pub fn lookup(
    ldp: &mut LockedInode<'_>,
    tx: &Tx,
    name: &[u8],
) -> Result<(Inode, usize), KernelError> {
    assert_eq!(ldp.ty(), T_DIR, "lookup in non-directory");

    for off in (0..ldp.size() as usize).step_by(ENTRY_SIZE) {
        let de: DirEntry = ldp.read_value(tx, off)?;
        if de.inum().is_some() && de.is_same_name(name) {
            let ino = de.inum().unwrap();
            return Ok((Inode::get(ldp.dev(), ino), off));
        }
    }
    Err(KernelError::EntryNotFound)
}

/// Writes a new directory entry (`name`, `ino`) into the directory
/// `ldp`, reusing the first free slot or appending at the end.
pub fn link(
    ldp: &mut LockedInode<'_>,
    tx: &Tx,
    name: &[u8],
    ino: InodeNo,
) -> Result<(), KernelError> {
    assert_eq!(ldp.ty(), T_DIR, "link in non-directory");

    // the name must not already be present.
    if let Ok((ip, _off)) = lookup(ldp, tx, name) {
        ip.put(tx);
        return Err(KernelError::AlreadyExists);
    }

    // look for an empty slot.
    assert_eq!(ldp.size() as usize % ENTRY_SIZE, 0, "misaligned directory");
    let mut off = ldp.size() as usize;
    for o in (0..ldp.size() as usize).step_by(ENTRY_SIZE) {
        let de: DirEntry = ldp.read_value(tx, o)?;
        if de.inum().is_none() {
            off = o;
            break;
        }
    }

    let mut de = DirEntry::zeroed();
    de.set_name(name);
    de.set_inum(Some(ino));
    ldp.write_value(tx, off, &de)
}

/// Clears the directory entry at `off`.
pub fn unlink_at(ldp: &mut LockedInode<'_>, tx: &Tx, off: usize) -> Result<(), KernelError> {
    assert_eq!(ldp.ty(), T_DIR, "unlink in non-directory");
    ldp.write_value(tx, off, &DirEntry::zeroed())
}

/// Is the directory empty except for "." and ".."?
pub fn is_empty(ldp: &mut LockedInode<'_>, tx: &Tx) -> bool {
    assert_eq!(ldp.ty(), T_DIR, "emptiness check on non-directory");

    for off in (2 * ENTRY_SIZE..ldp.size() as usize).step_by(ENTRY_SIZE) {
        let de: DirEntry = ldp.read_value(tx, off).unwrap();
        if de.inum().is_some() {
            return false;
        }
    }
    true
}
