//! Processes: lifecycle, scheduling hooks, and the sleep/wakeup
//! rendezvous.

use core::{
    cell::UnsafeCell,
    cmp, fmt,
    ptr::{self, NonNull},
    sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, Ordering},
};

use arrayvec::ArrayString;

use crate::{
    cpu::Cpu,
    error::KernelError,
    file::File,
    fs::{self, DeviceNo, Inode},
    interrupt::{self, trap},
    memory::{
        PAGE_SIZE, PhysAddr, VirtAddr,
        layout::kstack,
        page,
        page_table::{PageTable, PtEntryFlags},
        vm_user::UserPageTable,
    },
    param::{NOFILE, NPROC},
    println,
    sync::{SpinLock, SpinLockGuard},
};

use self::{
    scheduler::Context,
    wait_lock::{Parent, WaitLock},
};

mod elf;
pub mod exec;
pub mod scheduler;
mod wait_lock;

static PROC: [Proc; NPROC] = [const { Proc::new() }; NPROC];
static INIT_PROC: AtomicPtr<Proc> = AtomicPtr::new(ptr::null_mut());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct ProcId(i32);

impl fmt::Display for ProcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl ProcId {
    pub const INVALID: Self = ProcId(-1);

    pub const fn new(pid: i32) -> Self {
        Self(pid)
    }

    pub fn get(&self) -> i32 {
        self.0
    }
}

/// The per-process page the trampoline saves user registers into.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    /// Kernel page table (satp).
    pub kernel_satp: u64, // 0
    /// Top of the process's kernel stack.
    pub kernel_sp: u64, // 8
    /// Address of trap_user().
    pub kernel_trap: u64, // 16
    /// Saved user program counter.
    pub epc: u64, // 24
    /// Saved kernel tp (hart id).
    pub kernel_hartid: u64, // 32
    pub ra: u64,  // 40
    pub sp: u64,  // 48
    pub gp: u64,  // 56
    pub tp: u64,  // 64
    pub t0: u64,  // 72
    pub t1: u64,  // 80
    pub t2: u64,  // 88
    pub s0: u64,  // 96
    pub s1: u64,  // 104
    pub a0: u64,  // 112
    pub a1: u64,  // 120
    pub a2: u64,  // 128
    pub a3: u64,  // 136
    pub a4: u64,  // 144
    pub a5: u64,  // 152
    pub a6: u64,  // 160
    pub a7: u64,  // 168
    pub s2: u64,  // 176
    pub s3: u64,  // 184
    pub s4: u64,  // 192
    pub s5: u64,  // 200
    pub s6: u64,  // 208
    pub s7: u64,  // 216
    pub s8: u64,  // 224
    pub s9: u64,  // 232
    pub s10: u64, // 240
    pub s11: u64, // 248
    pub t3: u64,  // 256
    pub t4: u64,  // 264
    pub t5: u64,  // 272
    pub t6: u64,  // 280
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Unused,
    Used,
    Sleeping { chan: usize },
    Runnable,
    Running,
    Zombie { exit_status: i32 },
}

/// Per-process state that other processes may inspect, under the
/// process lock.
pub struct ProcSharedData {
    /// Process ID.
    pid: ProcId,
    /// Process name, for debugging.
    name: ArrayString<16>,
    state: ProcState,
    /// Process has been killed.
    killed: bool,
    /// switch() here to run the process.
    pub(in crate::proc) context: Context,
}

impl ProcSharedData {
    pub fn pid(&self) -> ProcId {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &[u8]) {
        self.name.clear();
        for chunk in name.utf8_chunks() {
            for ch in chunk.valid().chars() {
                if self.name.try_push(ch).is_err() {
                    return;
                }
            }
            if !chunk.invalid().is_empty()
                && self.name.try_push(char::REPLACEMENT_CHARACTER).is_err()
            {
                return;
            }
        }
    }

    pub fn kill(&mut self) {
        self.killed = true;
    }

    pub fn killed(&self) -> bool {
        self.killed
    }
}

pub struct ProcShared(SpinLock<ProcSharedData>);

impl ProcShared {
    const fn new() -> Self {
        Self(SpinLock::new(ProcSharedData {
            pid: ProcId::INVALID,
            name: ArrayString::new_const(),
            state: ProcState::Unused,
            killed: false,
            context: Context::zeroed(),
        }))
    }

    pub fn lock(&self) -> SpinLockGuard<'_, ProcSharedData> {
        self.0.lock()
    }

    unsafe fn remember_locked(&self) -> SpinLockGuard<'_, ProcSharedData> {
        unsafe { self.0.remember_locked() }
    }
}

/// Per-process state touched only by the process itself (or by its
/// parent once it is a zombie).
pub struct ProcPrivateData {
    /// Bottom of this process's kernel stack.
    kstack: VirtAddr,
    /// User address space.
    pagetable: Option<UserPageTable>,
    /// Trap-frame page, mapped at TRAPFRAME.
    trapframe: Option<NonNull<TrapFrame>>,
    /// Open files.
    ofile: [Option<File>; NOFILE],
    /// Current directory.
    cwd: Option<Inode>,
}

impl ProcPrivateData {
    const fn new() -> Self {
        Self {
            kstack: VirtAddr::MIN,
            pagetable: None,
            trapframe: None,
            ofile: [const { None }; NOFILE],
            cwd: None,
        }
    }

    pub fn kstack(&self) -> VirtAddr {
        self.kstack
    }

    pub fn size(&self) -> usize {
        self.pagetable.as_ref().map_or(0, UserPageTable::size)
    }

    pub fn pagetable(&self) -> &UserPageTable {
        self.pagetable.as_ref().unwrap()
    }

    pub fn pagetable_mut(&mut self) -> &mut UserPageTable {
        self.pagetable.as_mut().unwrap()
    }

    /// Commits exec's new image, dropping the old one.
    pub fn replace_pagetable(&mut self, pagetable: UserPageTable) {
        self.pagetable = Some(pagetable);
    }

    pub fn trapframe(&self) -> &TrapFrame {
        unsafe { self.trapframe.unwrap().as_ref() }
    }

    pub fn trapframe_mut(&mut self) -> &mut TrapFrame {
        unsafe { self.trapframe.unwrap().as_mut() }
    }

    /// Physical address of the trap-frame page.
    pub fn trapframe_phys(&self) -> PhysAddr {
        PhysAddr::from_ptr(self.trapframe.unwrap())
    }

    pub fn ofile(&self, fd: usize) -> Result<&File, KernelError> {
        self.ofile
            .get(fd)
            .and_then(Option::as_ref)
            .ok_or(KernelError::BadFileDescriptor)
    }

    pub fn has_free_ofile(&self) -> bool {
        self.ofile.iter().any(Option::is_none)
    }

    /// Stores `file` in the lowest free descriptor slot; hands it back
    /// if the table is full, so the caller can close it properly.
    pub fn add_ofile(&mut self, file: File) -> Result<usize, File> {
        match self
            .ofile
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.is_none())
        {
            Some((fd, slot)) => {
                *slot = Some(file);
                Ok(fd)
            }
            None => Err(file),
        }
    }

    pub fn take_ofile(&mut self, fd: usize) -> Result<File, KernelError> {
        self.ofile
            .get_mut(fd)
            .and_then(Option::take)
            .ok_or(KernelError::BadFileDescriptor)
    }

    pub fn cwd(&self) -> &Inode {
        self.cwd.as_ref().unwrap()
    }

    pub fn replace_cwd(&mut self, cwd: Inode) -> Inode {
        self.cwd.replace(cwd).unwrap()
    }
}

/// A process-table slot.
pub struct Proc {
    shared: ProcShared,
    /// Parent process; guarded by the wait lock.
    parent: Parent,
    private: UnsafeCell<ProcPrivateData>,
}

unsafe impl Sync for Proc {}

impl Proc {
    const fn new() -> Self {
        Self {
            shared: ProcShared::new(),
            parent: Parent::new(),
            private: UnsafeCell::new(ProcPrivateData::new()),
        }
    }

    /// Returns the current process.
    pub fn current() -> &'static Self {
        Self::try_current().unwrap()
    }

    pub fn try_current() -> Option<&'static Self> {
        let p = interrupt::with_push_disabled(|| Cpu::current().proc())?;
        Some(unsafe { p.as_ref() })
    }

    pub fn shared(&self) -> &ProcShared {
        &self.shared
    }

    /// Returns the process's private data.
    ///
    /// # Safety
    ///
    /// Only the process itself may call this while it can run; the
    /// parent may call it once the process is a zombie.
    #[expect(clippy::mut_from_ref)]
    pub unsafe fn private_mut(&self) -> &mut ProcPrivateData {
        unsafe { self.private.get().as_mut() }.unwrap()
    }

    fn is_child_of(&self, parent: &Proc, wait_lock: &mut SpinLockGuard<'_, WaitLock>) -> bool {
        self.parent
            .get(wait_lock)
            .is_some_and(|pp| ptr::eq(pp, parent))
    }

    fn allocate_pid() -> ProcId {
        static NEXT_PID: AtomicI32 = AtomicI32::new(1);
        ProcId(NEXT_PID.fetch_add(1, Ordering::Relaxed))
    }

    /// Finds an unused slot and initializes it enough to run in the
    /// kernel: a pid, a trap-frame page, an empty user page table, and
    /// a saved context that returns to forkret.
    ///
    /// Returns the slot with its lock held.
    fn allocate() -> Result<
        (
            &'static Self,
            SpinLockGuard<'static, ProcSharedData>,
            &'static mut ProcPrivateData,
        ),
        KernelError,
    > {
        let (p, mut shared) = 'found: {
            for p in &PROC {
                let shared = p.shared.lock();
                if shared.state == ProcState::Unused {
                    break 'found (p, shared);
                }
            }
            return Err(KernelError::OutOfProcesses);
        };

        shared.pid = Self::allocate_pid();
        shared.state = ProcState::Used;
        let private = unsafe { p.private_mut() };

        let res: Result<(), KernelError> = (|| {
            let tf: NonNull<TrapFrame> = page::alloc_frame()?.cast();
            private.trapframe = Some(tf);
            private.pagetable = Some(UserPageTable::new(PhysAddr::from_ptr(tf))?);

            // the first scheduling of this process will switch to
            // forkret, which returns to user space.
            shared.context.clear();
            shared.context.ra = forkret as usize as u64;
            shared.context.sp = (private.kstack.addr() + PAGE_SIZE) as u64;
            Ok(())
        })();

        if let Err(e) = res {
            p.free(&mut shared);
            drop(shared);
            return Err(e);
        }

        Ok((p, shared, private))
    }

    /// Returns a slot to the unused state, freeing the trap frame, the
    /// page table, and all user memory.
    ///
    /// The process lock must be held.
    fn free(&self, shared: &mut SpinLockGuard<'_, ProcSharedData>) {
        let private = unsafe { self.private_mut() };
        if let Some(tf) = private.trapframe.take() {
            unsafe {
                page::free_frame(tf.cast());
            }
        }
        drop(private.pagetable.take());
        unsafe { self.parent.reset() };
        shared.pid = ProcId::INVALID;
        shared.name.clear();
        shared.killed = false;
        shared.state = ProcState::Unused;
    }
}

/// Maps one kernel stack page per process slot, each below an unmapped
/// guard page.
pub fn map_stacks(kpgtbl: &mut PageTable) {
    for (i, _p) in PROC.iter().enumerate() {
        let frame = page::alloc_frame().unwrap();
        kpgtbl
            .map_page(kstack(i), PhysAddr::from_ptr(frame), PtEntryFlags::RW)
            .unwrap();
    }
}

/// Records each slot's kernel stack address.
pub fn init() {
    for (i, p) in PROC.iter().enumerate() {
        unsafe { p.private_mut() }.kstack = kstack(i);
    }
}

/// A user program that calls exec("/init", ["/init", 0]), assembled by
/// hand. od -An -tx1 of the build output.
static INIT_CODE: &[u8] = &[
    0x17, 0x05, 0x00, 0x00, 0x13, 0x05, 0x45, 0x02, 0x97, 0x05, 0x00, 0x00, 0x93, 0x85, 0x35,
    0x02, 0x93, 0x08, 0x70, 0x00, 0x73, 0x00, 0x00, 0x00, 0x93, 0x08, 0x20, 0x00, 0x73, 0x00,
    0x00, 0x00, 0xef, 0xf0, 0x9f, 0xff, 0x2f, 0x69, 0x6e, 0x69, 0x74, 0x00, 0x00, 0x24, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Sets up the first user process.
pub fn user_init() {
    let (p, mut shared, private) = Proc::allocate().unwrap();
    INIT_PROC.store(ptr::from_ref(p).cast_mut(), Ordering::Release);

    // one user page holding initcode's instructions and data.
    private.pagetable_mut().map_first(INIT_CODE).unwrap();

    // prepare for the very first "return" from kernel to user.
    let tf = private.trapframe_mut();
    tf.epc = 0; // user program counter
    tf.sp = PAGE_SIZE as u64; // user stack pointer

    // the root inode needs no disk read here; the inode cache entry is
    // filled in lazily once the file system is running.
    private.cwd = Some(Inode::get(DeviceNo::ROOT, fs::ROOT_INO));

    shared.set_name(b"initcode");
    shared.state = ProcState::Runnable;
    drop(shared);
}

/// Grows or shrinks user memory by `n` bytes.
pub fn grow(private: &mut ProcPrivateData, n: isize) -> Result<(), KernelError> {
    let pagetable = private.pagetable_mut();
    let old_size = pagetable.size();
    let new_size = old_size.saturating_add_signed(n);
    match new_size.cmp(&old_size) {
        cmp::Ordering::Less => pagetable.shrink_to(new_size),
        cmp::Ordering::Equal => {}
        cmp::Ordering::Greater => pagetable.grow_to(new_size, PtEntryFlags::W)?,
    }
    Ok(())
}

/// Creates a new process, copying the parent.
///
/// Sets up the child's kernel state to return as if from the fork()
/// system call, with return value 0.
pub fn fork(p: &'static Proc, p_private: &ProcPrivateData) -> Result<ProcId, KernelError> {
    let parent_name = p.shared.lock().name;

    let (np, mut np_shared, np_private) = Proc::allocate()?;

    // copy user memory from parent to child.
    if let Err(e) = p_private
        .pagetable()
        .try_clone_into(np_private.pagetable_mut())
    {
        np.free(&mut np_shared);
        drop(np_shared);
        return Err(e);
    }

    // copy saved user registers; fork returns 0 in the child.
    *np_private.trapframe_mut() = *p_private.trapframe();
    np_private.trapframe_mut().a0 = 0;

    // increment reference counts on open files and the cwd.
    for (of, nof) in p_private.ofile.iter().zip(&mut np_private.ofile) {
        *nof = of.as_ref().map(File::dup);
    }
    np_private.cwd = Some(p_private.cwd().dup());
    np_shared.name = parent_name;

    let pid = np_shared.pid;
    drop(np_shared);

    let mut wait_lock = wait_lock::lock();
    np.parent.set(Some(p), &mut wait_lock);
    drop(wait_lock);

    np.shared.lock().state = ProcState::Runnable;

    Ok(pid)
}

/// Passes p's abandoned children to init.
///
/// Caller must hold the wait lock.
fn reparent(p: &Proc, wait_lock: &mut SpinLockGuard<'_, WaitLock>) {
    let init_proc = INIT_PROC.load(Ordering::Acquire);
    for pp in &PROC {
        if pp.is_child_of(p, wait_lock) {
            pp.parent
                .set(Some(unsafe { init_proc.as_ref() }.unwrap()), wait_lock);
            wakeup(init_proc.addr());
        }
    }
}

/// Exits the current process; does not return.
///
/// The process stays a zombie until its parent calls wait().
pub fn exit(p: &'static Proc, status: i32) -> ! {
    assert!(
        !ptr::eq(p, INIT_PROC.load(Ordering::Acquire)),
        "init exiting"
    );

    let private = unsafe { p.private_mut() };

    // close all open files.
    for of in &mut private.ofile {
        if let Some(of) = of.take() {
            of.close();
        }
    }

    let tx = fs::log::begin_tx();
    private.cwd.take().unwrap().put(&tx);
    tx.end();

    let mut wait_lock = wait_lock::lock();

    // give any children to init.
    reparent(p, &mut wait_lock);

    // the parent might be sleeping in wait().
    if let Some(parent) = p.parent.get(&mut wait_lock) {
        wakeup(ptr::from_ref(parent).addr());
    }

    let mut shared = p.shared.lock();
    shared.state = ProcState::Zombie {
        exit_status: status,
    };
    drop(wait_lock);

    // jump into the scheduler, never to return.
    scheduler::sched(&mut shared);

    unreachable!("zombie exit");
}

/// Waits for a child to exit; returns its pid after freeing it.
///
/// If `addr` is non-zero, the child's exit status is copied to user
/// memory there.
pub fn wait(
    p: &Proc,
    p_private: &ProcPrivateData,
    addr: VirtAddr,
) -> Result<ProcId, KernelError> {
    let mut wait_lock = wait_lock::lock();

    loop {
        let mut have_kids = false;
        for pp in &PROC {
            if !pp.is_child_of(p, &mut wait_lock) {
                continue;
            }

            // make sure the child isn't still in exit() or switch().
            let mut pp_shared = pp.shared.lock();

            have_kids = true;
            if let ProcState::Zombie { exit_status } = pp_shared.state {
                let pid = pp_shared.pid;
                if addr != VirtAddr::MIN
                    && p_private
                        .pagetable()
                        .copy_out(addr, &exit_status)
                        .is_err()
                {
                    drop(pp_shared);
                    drop(wait_lock);
                    return Err(KernelError::InaccessibleMemory(addr));
                }
                pp.free(&mut pp_shared);
                drop(pp_shared);
                drop(wait_lock);
                return Ok(pid);
            }
            drop(pp_shared);
        }

        // no point waiting if we have no children.
        if !have_kids || p.shared.lock().killed() {
            drop(wait_lock);
            return Err(KernelError::NoChildProcess);
        }

        // wait for a child to exit; exit() wakes the parent's address.
        wait_lock = sleep(ptr::from_ref(p).addr(), wait_lock);
    }
}

/// Gives up the CPU for one scheduling round.
pub fn yield_(p: &Proc) {
    let mut shared = p.shared.lock();
    shared.state = ProcState::Runnable;
    scheduler::sched(&mut shared);
    drop(shared);
}

/// A fork child's very first scheduling switches here.
extern "C" fn forkret() -> ! {
    static FIRST: AtomicBool = AtomicBool::new(true);

    // still holding the process lock from schedule(); release it.
    let p = Proc::current();
    drop(unsafe { p.shared.remember_locked() });

    if FIRST.swap(false, Ordering::AcqRel) {
        // file system initialization must run in the context of a
        // regular process (it sleeps), so it cannot run from main().
        fs::init(DeviceNo::ROOT);
    }

    trap::trap_user_ret(p)
}

/// Atomically releases `guard` and sleeps on `chan`; reacquires the
/// lock when awakened.
///
/// Wakeups are broadcast, so callers test their predicate in a loop
/// around this.
pub fn sleep<T>(chan: usize, guard: SpinLockGuard<'_, T>) -> SpinLockGuard<'_, T> {
    let p = Proc::current();
    // Holding the process lock before releasing the caller's lock
    // guarantees no wakeup is lost: wakeup() needs the process lock to
    // see this process.
    let mut shared = p.shared.lock();
    let lock = guard.into_lock();

    shared.state = ProcState::Sleeping { chan };

    scheduler::sched(&mut shared);

    // awake again; the channel is implicitly cleared by leaving the
    // Sleeping state.
    drop(shared);
    lock.lock()
}

/// Wakes every process sleeping on `chan`.
///
/// Must be called without any process lock held.
pub fn wakeup(chan: usize) {
    let current = Proc::try_current().map(ptr::from_ref);
    for p in &PROC {
        if current == Some(ptr::from_ref(p)) {
            continue;
        }
        let mut shared = p.shared.lock();
        if shared.state == (ProcState::Sleeping { chan }) {
            shared.state = ProcState::Runnable;
        }
        drop(shared);
    }
}

/// Kills the process with the given pid.
///
/// The victim won't exit until it next crosses the user-space boundary
/// (see trap_user()).
pub fn kill(pid: ProcId) -> Result<(), KernelError> {
    for p in &PROC {
        let mut shared = p.shared.lock();
        if shared.pid == pid {
            shared.killed = true;
            if let ProcState::Sleeping { .. } = shared.state {
                // wake it from sleep() so it notices.
                shared.state = ProcState::Runnable;
            }
            drop(shared);
            return Ok(());
        }
        drop(shared);
    }
    Err(KernelError::ProcessNotFound)
}

/// The current process's pid.
pub fn current_pid() -> ProcId {
    Proc::current().shared.lock().pid
}

/// Whether the current process has been killed.
pub fn current_killed() -> bool {
    Proc::current().shared.lock().killed
}

/// Copies to a user address (if `user_dst`) or a kernel address.
pub fn either_copy_out_bytes(
    private: &ProcPrivateData,
    user_dst: bool,
    dst: usize,
    src: &[u8],
) -> Result<(), KernelError> {
    if user_dst {
        return private
            .pagetable()
            .copy_out_bytes(VirtAddr::new(dst)?, src);
    }
    unsafe {
        ptr::with_exposed_provenance_mut::<u8>(dst).copy_from_nonoverlapping(src.as_ptr(), src.len());
    }
    Ok(())
}

/// Copies from a user address (if `user_src`) or a kernel address.
pub fn either_copy_in_bytes(
    private: &ProcPrivateData,
    dst: &mut [u8],
    user_src: bool,
    src: usize,
) -> Result<(), KernelError> {
    if user_src {
        return private.pagetable().copy_in_bytes(dst, VirtAddr::new(src)?);
    }
    unsafe {
        ptr::with_exposed_provenance::<u8>(src).copy_to_nonoverlapping(dst.as_mut_ptr(), dst.len());
    }
    Ok(())
}

/// Prints a process listing to the console, for debugging.
///
/// Runs when a user types ^P on the console.
pub fn dump() {
    println!();
    for p in &PROC {
        let shared = p.shared.lock();
        let pid = shared.pid;
        let state = shared.state;
        let name = shared.name;
        drop(shared);
        if state == ProcState::Unused {
            continue;
        }

        let state = match state {
            ProcState::Unused => "unused",
            ProcState::Used => "used",
            ProcState::Sleeping { .. } => "sleep",
            ProcState::Runnable => "runnable",
            ProcState::Running => "run",
            ProcState::Zombie { .. } => "zombie",
        };

        println!("{pid:5} {state:<10} {name}");
    }
}
