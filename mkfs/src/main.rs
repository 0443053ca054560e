//! Builds the initial moss file system image.
//!
//! `mkfs fs.img [files...]` lays out an empty file system (boot block,
//! super block, log, inode table, bitmap, data) and copies the given
//! host files into the root directory.

use std::{
    env,
    fs::File,
    io::{Read, Seek, SeekFrom, Write as _},
    path::Path,
    process,
};

use anyhow::{Context as _, Result, ensure};
use dataview::PodMethods as _;
use moss_fs_types::{
    BITS_PER_BLOCK, BLOCK_SIZE, BlockNo, DIR_SIZE, DirEntry, DiskInode, INODES_PER_BLOCK,
    InodeBlock, InodeNo, MAX_FILE, NDIRECT, NINDIRECT, SuperBlock, T_DIR, T_FILE,
};
use moss_params::{FS_SIZE, LOG_SIZE, NUM_FS_INODES};

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} fs.img [files...]", args[0]);
        process::exit(1);
    }

    let mut fs = FsImage::create(Path::new(&args[1]))?;
    fs.write_super_block()?;
    let root = fs.create_root()?;
    assert_eq!(root, InodeNo::ROOT);

    for name in &args[2..] {
        let short = Path::new(name)
            .file_name()
            .context("input file has no name")?
            .to_str()
            .context("input file name is not UTF-8")?;
        let short = short.strip_prefix('_').unwrap_or(short);
        ensure!(short.len() < DIR_SIZE, "file name too long: {short}");

        let mut data = Vec::new();
        File::open(name)
            .with_context(|| format!("open {name}"))?
            .read_to_end(&mut data)?;

        let ino = fs.alloc_inode(T_FILE)?;
        fs.append(ino, &data)?;
        fs.add_dirent(root, ino, short.as_bytes())?;
    }

    // Round the root directory size up to a whole block.
    let mut inode = fs.read_inode(root)?;
    inode.size = inode.size.next_multiple_of(BLOCK_SIZE as u32);
    fs.write_inode(root, &inode)?;

    fs.write_bitmap()?;
    Ok(())
}

struct FsImage {
    img: File,
    sb: SuperBlock,
    next_inode: InodeNo,
    next_block: BlockNo,
}

impl FsImage {
    fn create(path: &Path) -> Result<Self> {
        let total = FS_SIZE as u32;
        let nbitmap = (FS_SIZE / BITS_PER_BLOCK + 1) as u32;
        let ninodeblocks = (NUM_FS_INODES / INODES_PER_BLOCK + 1) as u32;
        let nlog = 1 + LOG_SIZE as u32;
        // boot block, super block, log, inode table, bitmap
        let nmeta = 2 + nlog + ninodeblocks + nbitmap;

        let sb = SuperBlock {
            magic: SuperBlock::MAGIC,
            size: total,
            nblocks: total - nmeta,
            ninodes: NUM_FS_INODES as u32,
            nlog: LOG_SIZE as u32,
            log_start: 2,
            inode_start: 2 + nlog,
            bmap_start: 2 + nlog + ninodeblocks,
        };

        eprintln!(
            "nmeta {nmeta} (boot, super, log {nlog}, inode {ninodeblocks}, bitmap {nbitmap}) data {} total {total}",
            sb.nblocks,
        );

        let img = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("create {}", path.display()))?;

        let mut fs = Self {
            img,
            sb,
            next_inode: InodeNo::new(1),
            next_block: BlockNo::new(nmeta),
        };

        for bn in 0..total {
            fs.write_block(BlockNo::new(bn), &[0u8; BLOCK_SIZE])?;
        }
        Ok(fs)
    }

    fn write_super_block(&mut self) -> Result<()> {
        let mut buf = [0u8; BLOCK_SIZE];
        let bytes = self.sb.as_bytes();
        buf[..bytes.len()].copy_from_slice(bytes);
        self.write_block(SuperBlock::SUPER_BLOCK_NO, &buf)
    }

    fn create_root(&mut self) -> Result<InodeNo> {
        let ino = self.alloc_inode(T_DIR)?;
        self.add_dirent(ino, ino, b".")?;
        self.add_dirent(ino, ino, b"..")?;
        Ok(ino)
    }

    fn add_dirent(&mut self, dir: InodeNo, ino: InodeNo, name: &[u8]) -> Result<()> {
        let mut de = DirEntry::zeroed();
        de.set_inum(Some(ino));
        de.set_name(name);
        self.append(dir, de.as_bytes())
    }

    fn write_block(&mut self, bn: BlockNo, data: &[u8; BLOCK_SIZE]) -> Result<()> {
        self.img
            .seek(SeekFrom::Start(bn.value() as u64 * BLOCK_SIZE as u64))?;
        self.img.write_all(data)?;
        Ok(())
    }

    fn read_block(&mut self, bn: BlockNo) -> Result<[u8; BLOCK_SIZE]> {
        let mut buf = [0u8; BLOCK_SIZE];
        self.img
            .seek(SeekFrom::Start(bn.value() as u64 * BLOCK_SIZE as u64))?;
        self.img.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn alloc_inode(&mut self, ty: i16) -> Result<InodeNo> {
        let ino = self.next_inode;
        self.next_inode = InodeNo::new(ino.value() + 1);
        ensure!(ino.value() < self.sb.ninodes, "out of inodes");

        let mut inode = DiskInode::zeroed();
        inode.ty = ty;
        inode.nlink = 1;
        self.write_inode(ino, &inode)?;
        Ok(ino)
    }

    fn alloc_block(&mut self) -> Result<BlockNo> {
        let bn = self.next_block;
        self.next_block = BlockNo::new(bn.value() + 1);
        ensure!(bn.value() < self.sb.size, "out of data blocks");
        Ok(bn)
    }

    fn read_inode(&mut self, ino: InodeNo) -> Result<DiskInode> {
        let buf = self.read_block(self.sb.inode_block(ino))?;
        let block: &InodeBlock = buf.as_data_view().get(0);
        Ok(block.inode(ino).clone())
    }

    fn write_inode(&mut self, ino: InodeNo, inode: &DiskInode) -> Result<()> {
        let bn = self.sb.inode_block(ino);
        let mut buf = self.read_block(bn)?;
        *buf.as_data_view_mut().get_mut::<InodeBlock>(0).inode_mut(ino) = inode.clone();
        self.write_block(bn, &buf)
    }

    /// Maps file block `fbn` of `inode` to a disk block, allocating as
    /// needed (the host-side twin of the kernel's bmap).
    fn block_of(&mut self, inode: &mut DiskInode, fbn: usize) -> Result<BlockNo> {
        ensure!(fbn < MAX_FILE, "file too large");
        if fbn < NDIRECT {
            if inode.addrs[fbn] == 0 {
                inode.addrs[fbn] = self.alloc_block()?.value();
            }
            return Ok(BlockNo::new(inode.addrs[fbn]));
        }

        if inode.addrs[NDIRECT] == 0 {
            inode.addrs[NDIRECT] = self.alloc_block()?.value();
        }
        let ind_bn = BlockNo::new(inode.addrs[NDIRECT]);
        let idx = fbn - NDIRECT;
        let mut ind = self.read_block(ind_bn)?;
        let slots: &mut [u32; NINDIRECT] = ind.as_data_view_mut().get_mut(0);
        if slots[idx] == 0 {
            slots[idx] = self.alloc_block()?.value();
            let bn = slots[idx];
            self.write_block(ind_bn, &ind)?;
            return Ok(BlockNo::new(bn));
        }
        Ok(BlockNo::new(slots[idx]))
    }

    fn append(&mut self, ino: InodeNo, data: &[u8]) -> Result<()> {
        let mut inode = self.read_inode(ino)?;
        let mut off = inode.size as usize;
        let mut data = data;

        while !data.is_empty() {
            let fbn = off / BLOCK_SIZE;
            let bn = self.block_of(&mut inode, fbn)?;

            let in_block = off % BLOCK_SIZE;
            let n = usize::min(data.len(), BLOCK_SIZE - in_block);
            let mut buf = self.read_block(bn)?;
            buf[in_block..in_block + n].copy_from_slice(&data[..n]);
            self.write_block(bn, &buf)?;

            off += n;
            data = &data[n..];
        }

        inode.size = off as u32;
        self.write_inode(ino, &inode)?;
        Ok(())
    }

    fn write_bitmap(&mut self) -> Result<()> {
        let used = self.next_block.as_index();
        eprintln!("bitmap: first {used} blocks allocated");
        assert!(used < BITS_PER_BLOCK, "used blocks exceed one bitmap block");

        let mut buf = [0u8; BLOCK_SIZE];
        for bn in 0..used {
            buf[bn / 8] |= 1 << (bn % 8);
        }
        self.write_block(BlockNo::new(self.sb.bmap_start), &buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use dataview::PodMethods as _;

    #[test]
    fn image_has_valid_superblock_and_root() {
        let path = env::temp_dir().join(format!("moss-mkfs-test-{}.img", process::id()));

        let mut fs = FsImage::create(&path).unwrap();
        fs.write_super_block().unwrap();
        let root = fs.create_root().unwrap();
        assert_eq!(root, InodeNo::ROOT);

        let ino = fs.alloc_inode(T_FILE).unwrap();
        fs.append(ino, b"hello, disk").unwrap();
        fs.add_dirent(root, ino, b"greeting").unwrap();
        fs.write_bitmap().unwrap();

        // reopen and check what mkfs claims to have written
        let sb_block = fs.read_block(SuperBlock::SUPER_BLOCK_NO).unwrap();
        let sb: &SuperBlock = sb_block.as_data_view().get(0);
        assert_eq!(sb.magic, SuperBlock::MAGIC);
        assert_eq!(sb.size as usize, FS_SIZE);

        let root_inode = fs.read_inode(root).unwrap();
        assert_eq!(root_inode.ty, T_DIR);
        // ".", "..", and "greeting"
        assert_eq!(root_inode.size as usize, 3 * size_of::<DirEntry>());

        let data = fs.read_block(BlockNo::new(root_inode.addrs[0])).unwrap();
        let first: &DirEntry = data.as_data_view().get(0);
        assert_eq!(first.name(), b".");
        assert_eq!(first.inum(), Some(InodeNo::ROOT));

        let file_inode = fs.read_inode(ino).unwrap();
        assert_eq!(file_inode.ty, T_FILE);
        assert_eq!(file_inode.size as usize, b"hello, disk".len());

        std::fs::remove_file(&path).unwrap();
    }
}
