//! The write-ahead log, which makes multi-block file system updates
//! crash-safe.
//!
//! A log transaction bundles the updates of several FS system calls;
//! the log commits only when no FS system call is in progress, so a
//! commit never writes an uncommitted call's data to disk.
//!
//! A system call opens a transaction with [`begin_tx()`] and closes it
//! with [`Tx::end`] (or by dropping the [`Tx`]). Usually begin just
//! bumps the count of in-progress calls; if the log is close to
//! running out of space, it sleeps until the last outstanding
//! transaction has committed.
//!
//! The log is a physical re-do log of disk blocks. The on-disk format:
//!
//! ```text
//! header block, containing block #s for block A, B, C, ...
//! block A
//! block B
//! block C
//! ...
//! ```
//!
//! The synchronous write of a non-empty header is the commit point; a
//! crash before it discards the transaction, a crash after it is
//! repaired by re-applying the logged blocks at boot.

use core::ptr;

use moss_fs_types::{BlockNo, LogHeader, SuperBlock};

use crate::{
    fs::{DeviceNo, block_io, block_io::BlockRef},
    param::{LOG_SIZE, MAX_OP_BLOCKS},
    proc,
    sync::SpinLock,
};

use dataview::PodMethods as _;

struct Log {
    dev: DeviceNo,
    /// Block number of the log header block.
    start: u32,
    /// Log body blocks available on disk.
    size: u32,
    /// How many FS system calls are executing.
    outstanding: u32,
    /// In commit(); please wait.
    committing: bool,
    /// In-memory mirror of the header, accumulating the open
    /// transaction's block numbers.
    header: LogHeader,
}

static LOG: SpinLock<Option<Log>> = SpinLock::new(None);

fn chan() -> usize {
    ptr::from_ref(&LOG).addr()
}

pub(super) fn init(dev: DeviceNo, sb: &SuperBlock) {
    assert!(
        (sb.nlog as usize) >= LOG_SIZE,
        "log area smaller than LOG_SIZE"
    );
    *LOG.lock() = Some(Log {
        dev,
        start: sb.log_start,
        size: sb.nlog,
        outstanding: 0,
        committing: false,
        header: LogHeader::zeroed(),
    });

    recover(dev, sb.log_start);
}

/// An open file system transaction.
///
/// Every disk mutation goes through [`Tx::write`], so a transaction
/// that returns early simply commits nothing. Dropping the transaction
/// closes it.
#[must_use]
pub struct Tx {
    ended: bool,
}

/// Opens a transaction, sleeping until the log can accommodate it.
///
/// Called at the start of each FS system call.
pub fn begin_tx() -> Tx {
    let mut log = LOG.lock();
    loop {
        let l = log.as_mut().expect("log used before fs::init");
        if l.committing
            || l.header.len() + (l.outstanding as usize + 1) * MAX_OP_BLOCKS > LOG_SIZE
        {
            // this transaction might exhaust log space; wait for the
            // current commit to finish.
            log = proc::sleep(chan(), log);
            continue;
        }
        l.outstanding += 1;
        break;
    }
    Tx { ended: false }
}

impl Tx {
    /// Closes the transaction; commits if it was the last outstanding
    /// one.
    pub fn end(mut self) {
        self.ended = true;
        end_op();
    }

    /// Returns the cached buffer for a block without reading it.
    pub fn get_block(&self, dev: DeviceNo, block_no: BlockNo) -> BlockRef {
        block_io::get(dev, block_no)
    }

    /// Returns the cached buffer for a block, read from disk.
    pub fn read_block(&self, dev: DeviceNo, block_no: BlockNo) -> BlockRef {
        let mut br = block_io::get(dev, block_no);
        let Ok(()) = br.read();
        br
    }

    /// Records a modified buffer in the log in place of writing it to
    /// disk; the commit will write it home.
    ///
    /// A repeated write to the same block within one transaction is
    /// absorbed into its existing slot. A new block is pinned in the
    /// cache until commit.
    pub fn write(&self, b: &mut BlockRef) {
        let mut log = LOG.lock();
        let l = log.as_mut().unwrap();
        assert!(
            l.header.len() < LOG_SIZE && (l.header.len() as u32) < l.size,
            "transaction too big"
        );
        assert!(l.outstanding > 0, "log write outside of transaction");

        let bn = BlockNo::new(b.index() as u32);
        if l.header.position(bn).is_none() {
            b.pin();
            let i = l.header.len();
            l.header.set_len(i + 1);
            l.header.set_target(i, bn);
        }
    }
}

impl Drop for Tx {
    fn drop(&mut self) {
        if !self.ended {
            end_op();
        }
    }
}

fn end_op() {
    let mut log = LOG.lock();
    let l = log.as_mut().unwrap();
    l.outstanding -= 1;
    assert!(!l.committing, "end_op during commit");

    if l.outstanding > 0 {
        // begin_tx() may be waiting for log space, and decrementing
        // outstanding has reduced the reserved amount.
        drop(log);
        proc::wakeup(chan());
        return;
    }

    // snapshot the header; the block I/O below sleeps, so it must run
    // without the log lock.
    l.committing = true;
    let dev = l.dev;
    let start = l.start;
    let len = l.header.len();
    let mut targets = [0u32; LOG_SIZE];
    for (i, t) in targets[..len].iter_mut().enumerate() {
        *t = l.header.target(i).value();
    }
    drop(log);

    commit(dev, start, &targets[..len]);

    let mut log = LOG.lock();
    let l = log.as_mut().unwrap();
    l.header.set_len(0);
    l.committing = false;
    drop(log);
    proc::wakeup(chan());
}

fn commit(dev: DeviceNo, start: u32, targets: &[u32]) {
    if targets.is_empty() {
        return;
    }
    write_body(dev, start, targets); // modified blocks from cache to log
    write_header(dev, start, targets); // header to disk -- the real commit
    install(dev, start, targets, false); // log to home locations
    write_header(dev, start, &[]); // erase the transaction from the log
}

/// Copies each transaction block from the cache into its log slot.
fn write_body(dev: DeviceNo, start: u32, targets: &[u32]) {
    for (i, &target) in targets.iter().enumerate() {
        let mut from = block_io::get(dev, BlockNo::new(target));
        let Ok(()) = from.read();
        let mut to = block_io::get(dev, BlockNo::new(start + 1 + i as u32));
        to.set_data(from.bytes());
        let Ok(()) = to.write();
    }
}

/// Writes the on-disk log header. With a non-empty `targets` this is
/// the commit point; with an empty one it erases the log.
fn write_header(dev: DeviceNo, start: u32, targets: &[u32]) {
    let mut br = block_io::get(dev, BlockNo::new(start));
    br.zeroed();
    let header = br.data_mut::<LogHeader>();
    header.set_len(targets.len());
    for (i, &target) in targets.iter().enumerate() {
        header.set_target(i, BlockNo::new(target));
    }
    let Ok(()) = br.write();
}

/// Copies committed blocks from their log slots to their home
/// locations, unpinning the cached home blocks unless recovering.
fn install(dev: DeviceNo, start: u32, targets: &[u32], recovering: bool) {
    for (i, &target) in targets.iter().enumerate() {
        let mut from = block_io::get(dev, BlockNo::new(start + 1 + i as u32));
        let Ok(()) = from.read();
        let mut to = block_io::get(dev, BlockNo::new(target));
        to.set_data(from.bytes());
        let Ok(()) = to.write();
        if !recovering {
            unsafe {
                to.unpin();
            }
        }
    }
}

/// Boot-time recovery: re-applies a committed but unfinished
/// transaction, then clears the log. Idempotent.
fn recover(dev: DeviceNo, start: u32) {
    let mut br = block_io::get(dev, BlockNo::new(start));
    let Ok(()) = br.read();
    let header = br.data::<LogHeader>();
    let len = header.len();
    assert!(len <= LOG_SIZE, "log header too large");
    let mut targets = [0u32; LOG_SIZE];
    for (i, t) in targets[..len].iter_mut().enumerate() {
        *t = header.target(i).value();
    }
    drop(br);

    install(dev, start, &targets[..len], true); // if committed, copy from log to disk
    write_header(dev, start, &[]); // clear the log
}
