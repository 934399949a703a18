//! The thread control block: register context, stacks, topology, and the
//! state machine every thread moves through (§3 NEW → READY → RUNNING →
//! {SLEEPING,BLOCKED} → ZOMBIE). Threads live in a single process-wide
//! arena (`THREADS`) keyed by tid; runqueues, the owning process, and
//! kthread handles each hold a *count*, not an owning pointer, so the
//! arena is the only place a `Thread` is actually dropped.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering};

use x86_64::VirtAddr;

use crate::error::{Errno, KResult};
use crate::memory::vmap::{self, MapFlags, Protection};
use crate::sync::spinlock::SpinLockIrq;
use crate::task::id_alloc::IdAllocator;
use crate::task::process::ProcessId;

pub const KSTACK_SIZE: u64 = 32 * 1024;
pub const UTK_STACK_SIZE: u64 = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    New = 0,
    Ready = 1,
    Running = 2,
    Blocked = 3,
    Sleeping = 4,
    Zombie = 5,
}

impl ThreadState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ThreadState::New,
            1 => ThreadState::Ready,
            2 => ThreadState::Running,
            3 => ThreadState::Blocked,
            4 => ThreadState::Sleeping,
            _ => ThreadState::Zombie,
        }
    }
}

bitflags::bitflags! {
    /// A thread's allowed-CPU set and pinning discipline, consulted once at
    /// attach time to pick the least-loaded allowed CPU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TopologyFlags: u32 {
        const THIS_CPU   = 1 << 0;
        const BSP        = 1 << 1;
        const NO_MIGRATE = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Topology {
    pub flags: TopologyFlags,
    /// Bitmask of allowed CPUs, one bit per cpu id; ignored when
    /// `THIS_CPU`/`BSP` narrows the choice to a single CPU.
    pub allowed: u64,
}

impl Topology {
    pub fn any() -> Self {
        Topology { flags: TopologyFlags::empty(), allowed: u64::MAX }
    }
}

/// Register context swapped by `context_switch::switch_to`. Field order and
/// offsets are load-bearing: the assembly routine indexes into this layout
/// directly rather than through Rust field access.
#[repr(C)]
#[derive(Clone)]
pub struct CpuContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

impl CpuContext {
    const fn zeroed() -> Self {
        CpuContext {
            rax: 0, rbx: 0, rcx: 0, rdx: 0, rsi: 0, rdi: 0, rbp: 0, rsp: 0,
            r8: 0, r9: 0, r10: 0, r11: 0, r12: 0, r13: 0, r14: 0, r15: 0,
            rip: 0, rflags: 0,
        }
    }

    /// Build the initial context for a brand-new kernel thread: RIP is the
    /// entry point, RSP the top of its kernel stack, RDI its single SysV
    /// argument. RFLAGS starts with IF clear (the reserved bit 1 set, but
    /// interrupts off) so the thread can finish its own setup before
    /// enabling interrupts itself on entry.
    pub fn new_kthread(entry: u64, arg: u64, stack_top: VirtAddr) -> Self {
        let mut ctx = Self::zeroed();
        ctx.rip = entry;
        ctx.rsp = stack_top.as_u64();
        ctx.rflags = 0x002;
        ctx.rdi = arg;
        ctx
    }
}

/// A kernel stack allocated through `vmap`, with an unmapped guard page
/// immediately below the usable span so a stack overflow faults instead of
/// silently corrupting an adjacent allocation.
pub struct KernelStack {
    pub base: VirtAddr,
    pub top: VirtAddr,
    pub size: u64,
}

impl KernelStack {
    pub fn alloc(size: u64) -> KResult<Self> {
        let page = crate::memory::layout::PAGE_SIZE;
        let span = size + page;
        let region = vmap::vmap(None, span, Protection::READ | Protection::WRITE, MapFlags::ALLOC, None)?;
        vmap::vunmap(region, page)?;
        let base = VirtAddr::new(region.as_u64() + page);
        Ok(KernelStack { base, top: VirtAddr::new(base.as_u64() + size), size })
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        let _ = vmap::vunmap(self.base, self.size);
    }
}

bitflags::bitflags! {
    /// Flags accepted by `sched_prepare_sleep`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SleepFlags: u8 {
        const INTERRUPTIBLE = 1 << 0;
        const BLOCK         = 1 << 1;
    }
}

/// The thread control block. `utk_stack` is field 0 by contract: a future
/// syscall entry path reads it with a fixed displacement off the thread
/// pointer rather than through a named field lookup.
#[repr(C)]
pub struct Thread {
    pub utk_stack: VirtAddr,
    pub tid: u64,
    pub process: ProcessId,
    pub name: String,
    state: AtomicU8,
    pub cpu: AtomicU32,
    pub topology: Topology,
    pub priority: u8,
    pub wakeup_time: AtomicU64,
    pub wakeup_err: AtomicI32,
    sleep_flags: AtomicU8,
    pub should_exit: AtomicBool,
    pub in_usercopy: AtomicBool,
    refcount: AtomicU32,
    pub context: CpuContext,
    pub ext_state: *mut u8,
    pub kernel_stack: KernelStack,
    pub utk_stack_alloc: Option<KernelStack>,
    pub policy_priv: *mut u8,
    pub has_started: bool,
}

unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, s: ThreadState) {
        self.state.store(s as u8, Ordering::Release);
    }

    /// Compare-and-swap the state; used by wakeup paths that must not
    /// clobber a concurrent transition (e.g. a timeout racing a signal).
    pub fn cas_state(&self, expected: ThreadState, new: ThreadState) -> bool {
        self.state
            .compare_exchange(expected as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_interruptible(&self) -> bool {
        self.sleep_flags().contains(SleepFlags::INTERRUPTIBLE)
    }

    /// Whether the sleep this thread is currently parked in was requested
    /// with `SleepFlags::BLOCK` (§4.5: distinguishes a plain timed sleep,
    /// which wakes with `0` on timeout, from a blocking wait, which wakes
    /// with `-ETIMEDOUT`).
    pub fn is_blocking_sleep(&self) -> bool {
        self.sleep_flags().contains(SleepFlags::BLOCK)
    }

    pub fn sleep_flags(&self) -> SleepFlags {
        SleepFlags::from_bits_truncate(self.sleep_flags.load(Ordering::Relaxed))
    }

    pub fn set_sleep_flags(&self, flags: SleepFlags) {
        self.sleep_flags.store(flags.bits(), Ordering::Relaxed);
    }

    /// §3: released under acquire-release; reaping requires the count to
    /// drop to exactly the value the reaper itself holds (1).
    pub fn retain(&self) -> u32 {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn release(&self) -> u32 {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        crate::bug_on!(prev == 0, "thread refcount underflow");
        prev - 1
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if !self.policy_priv.is_null() {
            (crate::task::policy::active().free_priv)(self.policy_priv);
            self.policy_priv = core::ptr::null_mut();
        }
        if !self.ext_state.is_null() {
            EXT_STATE_CACHE.free(self.ext_state);
            self.ext_state = core::ptr::null_mut();
        }
    }
}

use crate::memory::slab::SlabCache;

/// 512-byte, 16-byte-aligned FXSAVE areas, one per thread, drawn from a
/// dedicated cache rather than the general heap so the alignment
/// requirement is structural rather than incidental.
static EXT_STATE_CACHE: SlabCacheHandle = SlabCacheHandle::new();

struct SlabCacheHandle {
    inner: conquer_once::spin::OnceCell<SlabCache>,
}

impl SlabCacheHandle {
    const fn new() -> Self {
        SlabCacheHandle { inner: conquer_once::spin::OnceCell::uninit() }
    }

    fn get(&self) -> &SlabCache {
        self.inner.try_init_once(|| SlabCache::create(512, 16, None, None)).ok();
        self.inner.get().unwrap()
    }

    fn alloc(&self) -> *mut u8 {
        self.get().alloc().unwrap_or(core::ptr::null_mut())
    }

    fn free(&self, ptr: *mut u8) {
        self.get().free(ptr);
    }
}

static THREADS: SpinLockIrq<BTreeMap<u64, Box<Thread>>> = SpinLockIrq::new(BTreeMap::new());

fn allocate_tid(process_bitmap: &IdAllocator) -> KResult<u64> {
    process_bitmap.alloc().map(|id| id as u64)
}

/// Create a new kernel thread (NEW state, not yet attached to any
/// runqueue). `tid_alloc` is the owning process's per-process TID bitmap.
pub fn create_kernel_thread(
    name: String,
    process: ProcessId,
    tid_alloc: &IdAllocator,
    entry: extern "C" fn(u64) -> !,
    arg: u64,
    priority: u8,
) -> KResult<u64> {
    let tid = allocate_tid(tid_alloc)?;
    let kernel_stack = KernelStack::alloc(KSTACK_SIZE)?;
    let context = CpuContext::new_kthread(entry as u64, arg, kernel_stack.top);
    let ext_state = EXT_STATE_CACHE.alloc();

    let thread = Box::new(Thread {
        utk_stack: VirtAddr::new(0),
        tid,
        process,
        name,
        state: AtomicU8::new(ThreadState::New as u8),
        cpu: AtomicU32::new(0),
        topology: Topology::any(),
        priority,
        wakeup_time: AtomicU64::new(0),
        wakeup_err: AtomicI32::new(0),
        sleep_flags: AtomicU8::new(0),
        should_exit: AtomicBool::new(false),
        in_usercopy: AtomicBool::new(false),
        refcount: AtomicU32::new(0),
        context,
        ext_state,
        kernel_stack,
        utk_stack_alloc: None,
        policy_priv: core::ptr::null_mut(),
        has_started: false,
    });

    THREADS.lock().insert(tid, thread);
    Ok(tid)
}

/// Look up a thread by tid and run `f` on it under the global table's
/// lock. Used by every scheduler path that needs more than a raw pointer.
pub fn with_thread<R>(tid: u64, f: impl FnOnce(&mut Thread) -> R) -> Option<R> {
    let mut table = THREADS.lock();
    table.get_mut(&tid).map(|t| f(t))
}

/// Raw pointer to a thread, valid as long as the caller (or the runqueue
/// slot it was copied from) holds a reference. Used by `per_cpu` to cache
/// the running thread without re-locking `THREADS` on every access.
pub fn thread_ptr(tid: u64) -> *mut Thread {
    THREADS.lock().get_mut(&tid).map(|b| b.as_mut() as *mut Thread).unwrap_or(core::ptr::null_mut())
}

/// Remove and drop a thread from the arena. Only the reaper calls this,
/// and only once the refcount has dropped to the value it itself holds.
pub fn destroy(tid: u64) {
    THREADS.lock().remove(&tid);
}

pub fn exists(tid: u64) -> bool {
    THREADS.lock().contains_key(&tid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_u8() {
        assert_eq!(ThreadState::from_u8(ThreadState::Sleeping as u8), ThreadState::Sleeping);
    }
}
