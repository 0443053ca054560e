use core::{ptr::NonNull, slice};

use dataview::PodMethods as _;

use crate::{
    error::KernelError,
    fs::{self, LockedInode, log::Tx},
    memory::{
        PAGE_SIZE, PageRound as _, VirtAddr, page_table::PtEntryFlags, vm_user::UserPageTable,
    },
    param::{MAX_ARG, USER_STACK_PAGES},
    proc::{
        Proc, ProcPrivateData,
        elf::{ELF_MAGIC, ELF_PROG_FLAG_EXEC, ELF_PROG_FLAG_WRITE, ELF_PROG_LOAD, ElfHeader,
              ProgramHeader},
    },
};

fn flags2perm(flags: u32) -> PtEntryFlags {
    let mut perm = PtEntryFlags::empty();
    if flags & ELF_PROG_FLAG_EXEC != 0 {
        perm.insert(PtEntryFlags::X);
    }
    if flags & ELF_PROG_FLAG_WRITE != 0 {
        perm.insert(PtEntryFlags::W);
    }
    perm
}

/// Replaces the current image with the program at `path`.
///
/// `argv` holds NUL-terminated argument strings, each in its own
/// frame. Returns the argument count, which the syscall layer delivers
/// as the user-visible return value; the argv array address travels in
/// a1. On failure the old image is untouched.
pub fn exec(
    p: &Proc,
    private: &mut ProcPrivateData,
    path: &[u8],
    argv: &[NonNull<u8>],
) -> Result<usize, KernelError> {
    let tx = fs::log::begin_tx();
    let ip = fs::path::resolve(&tx, private, path)?;
    let mut lip = ip.lock(&tx);

    let res = load_image(&tx, &mut lip, private);

    drop(lip);
    ip.put(&tx);
    tx.end();

    let (mut pt, entry) = res?;

    allocate_stack_pages(&mut pt)?;
    let sp = pt.size();
    let stack_base = sp - USER_STACK_PAGES * PAGE_SIZE;

    // push argument strings, then the argv[] array itself.
    let (sp, argc) = push_arguments(&mut pt, sp, stack_base, argv)?;

    // save the program name for debugging.
    let name = path
        .rsplit(|&c| c == b'/')
        .find(|s| !s.is_empty())
        .unwrap_or(path);
    p.shared().lock().set_name(name);

    // commit to the user image.
    let tf = private.trapframe_mut();
    tf.epc = entry; // initial program counter = entry point
    tf.sp = sp as u64; // initial stack pointer
    tf.a1 = sp as u64; // argv for the user main()
    private.replace_pagetable(pt);

    Ok(argc)
}

/// Validates the ELF image and loads every LOAD segment into a fresh
/// user page table.
fn load_image(
    tx: &Tx,
    lip: &mut LockedInode<'_>,
    private: &ProcPrivateData,
) -> Result<(UserPageTable, u64), KernelError> {
    let mut elf = ElfHeader::zeroed();
    if lip.read_kernel(tx, elf.as_bytes_mut(), 0)? != size_of::<ElfHeader>() {
        return Err(KernelError::InvalidExecutable);
    }
    if elf.magic != ELF_MAGIC {
        return Err(KernelError::InvalidExecutable);
    }

    let mut pt = UserPageTable::new(private.trapframe_phys())?;

    for i in 0..elf.phnum {
        let off = elf.phoff as usize + usize::from(i) * size_of::<ProgramHeader>();
        let mut ph = ProgramHeader::zeroed();
        if lip.read_kernel(tx, ph.as_bytes_mut(), off)? != size_of::<ProgramHeader>() {
            return Err(KernelError::InvalidExecutable);
        }
        if ph.ty != ELF_PROG_LOAD {
            continue;
        }
        if ph.memsz < ph.filesz {
            return Err(KernelError::InvalidExecutable);
        }
        if ph.vaddr.checked_add(ph.memsz).is_none() {
            return Err(KernelError::InvalidExecutable);
        }
        let va_start = VirtAddr::new(usize::try_from(ph.vaddr).unwrap())
            .map_err(|_| KernelError::InvalidExecutable)?;
        if !va_start.is_page_aligned() {
            return Err(KernelError::InvalidExecutable);
        }

        pt.grow_to((ph.vaddr + ph.memsz) as usize, flags2perm(ph.flags))?;
        load_segment(tx, lip, &pt, va_start, ph.off as usize, ph.filesz as usize)?;
    }

    Ok((pt, elf.entry))
}

/// Copies a segment's file contents into the page table at `va`.
///
/// `va` must be page-aligned and the range already mapped.
fn load_segment(
    tx: &Tx,
    lip: &mut LockedInode<'_>,
    pt: &UserPageTable,
    va: VirtAddr,
    file_off: usize,
    file_size: usize,
) -> Result<(), KernelError> {
    assert!(va.is_page_aligned());

    let mut i = 0;
    while i < file_size {
        let pa = pt.resolve(va.byte_add(i)?, PtEntryFlags::U)?;
        let n = usize::min(file_size - i, PAGE_SIZE);
        let dst = unsafe { slice::from_raw_parts_mut(pa.as_ptr::<u8>().as_ptr(), n) };
        if lip.read_kernel(tx, dst, file_off + i)? != n {
            return Err(KernelError::InvalidExecutable);
        }
        i += n;
    }

    Ok(())
}

/// Allocates the stack pages at the next page boundary, with an
/// inaccessible guard page below them.
fn allocate_stack_pages(pt: &mut UserPageTable) -> Result<(), KernelError> {
    let guard = pt.size().page_roundup();
    pt.grow_to(guard + (USER_STACK_PAGES + 1) * PAGE_SIZE, PtEntryFlags::W)?;
    pt.forbid_user_access(VirtAddr::new(guard)?)?;
    Ok(())
}

/// Pushes the argument strings and the argv[] pointer array onto the
/// new stack. Returns the final stack pointer and the argument count.
fn push_arguments(
    pt: &mut UserPageTable,
    mut sp: usize,
    stack_base: usize,
    argv: &[NonNull<u8>],
) -> Result<(usize, usize), KernelError> {
    assert!(argv.len() <= MAX_ARG);
    let mut ustack = [0usize; MAX_ARG + 1];

    for (arg, slot) in argv.iter().zip(&mut ustack) {
        let src = cstr_bytes(*arg);
        sp -= src.len();
        sp -= sp % 16; // risc-v sp must be 16-byte aligned
        if sp < stack_base {
            return Err(KernelError::ArgumentListTooLong);
        }
        pt.copy_out_bytes(VirtAddr::new(sp)?, src)?;
        *slot = sp;
    }
    ustack[argv.len()] = 0;

    // push the array of argv[] pointers.
    sp -= (argv.len() + 1) * size_of::<usize>();
    sp -= sp % 16;
    if sp < stack_base {
        return Err(KernelError::ArgumentListTooLong);
    }
    let src = unsafe {
        slice::from_raw_parts(
            ustack.as_ptr().cast::<u8>(),
            (argv.len() + 1) * size_of::<usize>(),
        )
    };
    pt.copy_out_bytes(VirtAddr::new(sp)?, src)?;

    Ok((sp, argv.len()))
}

/// The NUL-terminated string in `frame`, including its NUL.
fn cstr_bytes(frame: NonNull<u8>) -> &'static [u8] {
    let bytes = unsafe { slice::from_raw_parts(frame.as_ptr(), PAGE_SIZE) };
    let len = bytes
        .iter()
        .position(|&b| b == 0)
        .expect("argument string is NUL-terminated");
    &bytes[..=len]
}
