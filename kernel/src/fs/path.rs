//! Hierarchical path lookup.

use moss_fs_types::{DIR_SIZE, T_DIR};

use crate::{
    error::KernelError,
    fs::{DeviceNo, Inode, ROOT_INO, directory, log::Tx},
    proc::ProcPrivateData,
};

/// Splits the next path element off `path`.
///
/// Returns the element and the remainder, with leading slashes
/// stripped from both, or `None` if the path holds no more elements.
///
/// ```text
/// skip_elem(b"a/bb/c")   == Some((b"a", b"bb/c"))
/// skip_elem(b"///a//bb") == Some((b"a", b"bb"))
/// skip_elem(b"a")        == Some((b"a", b""))
/// skip_elem(b"a/")       == Some((b"a", b""))
/// skip_elem(b"")         == None
/// skip_elem(b"///")      == None
/// ```
fn skip_elem(path: &[u8]) -> Option<(&[u8], &[u8])> {
    let start = path.iter().position(|&c| c != b'/')?;
    let path = &path[start..];
    let end = path.iter().position(|&c| c == b'/').unwrap_or(path.len());
    let (elem, path) = path.split_at(end);
    let next = path.iter().position(|&c| c != b'/').unwrap_or(path.len());
    Some((elem, &path[next..]))
}

/// Walks `path` starting at the root (absolute) or the caller's
/// working directory (relative).
///
/// With `parent` set, stops one element early: the result is the
/// parent directory, and the final element is copied into `name_out`.
/// Must run inside a transaction because it puts inodes along the way.
fn resolve_impl(
    tx: &Tx,
    private: &ProcPrivateData,
    path: &[u8],
    parent: bool,
    mut name_out: Option<&mut [u8; DIR_SIZE]>,
) -> Result<Inode, KernelError> {
    let mut ip = if path.first() == Some(&b'/') {
        Inode::get(DeviceNo::ROOT, ROOT_INO)
    } else {
        private.cwd().dup()
    };

    let mut path = path;
    while let Some((name, rest)) = skip_elem(path) {
        path = rest;
        if let Some(name_out) = &mut name_out {
            let len = usize::min(name.len(), name_out.len());
            name_out[..len].copy_from_slice(&name[..len]);
            name_out[len..].fill(0);
        }

        let mut lip = ip.lock(tx);
        if lip.ty() != T_DIR {
            drop(lip);
            ip.put(tx);
            return Err(KernelError::NotADirectory);
        }

        if parent && path.is_empty() {
            // stop one level early.
            drop(lip);
            return Ok(ip);
        }

        let next = match directory::lookup(&mut lip, tx, name) {
            Ok((next, _off)) => next,
            Err(e) => {
                drop(lip);
                ip.put(tx);
                return Err(e);
            }
        };
        drop(lip);
        ip.put(tx);
        ip = next;
    }

    if parent {
        // the path named no final element to return.
        ip.put(tx);
        return Err(KernelError::InvalidPath);
    }
    Ok(ip)
}

/// Resolves `path` to an inode reference.
pub fn resolve(tx: &Tx, private: &ProcPrivateData, path: &[u8]) -> Result<Inode, KernelError> {
    resolve_impl(tx, private, path, false, None)
}

/// Resolves `path` to its parent directory and final element name.
pub fn resolve_parent<'n>(
    tx: &Tx,
    private: &ProcPrivateData,
    path: &[u8],
    name_out: &'n mut [u8; DIR_SIZE],
) -> Result<(Inode, &'n [u8]), KernelError> {
    let ip = resolve_impl(tx, private, path, true, Some(name_out))?;
    let len = name_out
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(name_out.len());
    Ok((ip, &name_out[..len]))
}
