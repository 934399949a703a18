//! Deferred-work queues: one global list and one list per CPU, each served
//! by a dedicated worker kthread blocked on a semaphore. A work item is a
//! plain function pointer plus a `u64` argument rather than a boxed
//! closure, so items can be slab-allocated and freed by the worker that
//! runs them instead of going through the general heap.

use alloc::collections::VecDeque;

use conquer_once::spin::OnceCell;

use crate::error::{Errno, KResult};
use crate::memory::slab::SlabCache;
use crate::sync::semaphore::Semaphore;
use crate::sync::spinlock::SpinLockIrq;
use crate::task::kthread;
use crate::task::policy;
use crate::task::runqueue::MAX_CPUS;

struct Work {
    func: fn(u64),
    arg: u64,
}

struct WorkCache {
    inner: OnceCell<SlabCache>,
}

impl WorkCache {
    const fn new() -> Self {
        WorkCache { inner: OnceCell::uninit() }
    }

    fn get(&self) -> &SlabCache {
        self.inner
            .try_init_once(|| SlabCache::create(core::mem::size_of::<Work>(), core::mem::align_of::<Work>(), None, None))
            .ok();
        self.inner.get().unwrap()
    }
}

static WORK_CACHE: WorkCache = WorkCache::new();

struct WorkList {
    queue: SpinLockIrq<VecDeque<*mut Work>>,
    sem: Semaphore,
}

unsafe impl Send for WorkList {}
unsafe impl Sync for WorkList {}

impl WorkList {
    const fn new() -> Self {
        WorkList { queue: SpinLockIrq::new(VecDeque::new()), sem: Semaphore::new(0) }
    }

    fn push(&self, func: fn(u64), arg: u64) -> KResult<()> {
        let ptr = WORK_CACHE.get().alloc().ok_or(Errno::NoMem)? as *mut Work;
        unsafe {
            ptr.write(Work { func, arg });
        }
        self.queue.lock().push_back(ptr);
        self.sem.signal();
        Ok(())
    }

    fn run_one(&self) {
        self.sem.wait(false, 0).expect("non-interruptible wait cannot fail");
        let work = self.queue.lock().pop_front();
        if let Some(ptr) = work {
            let (func, arg) = unsafe { ((*ptr).func, (*ptr).arg) };
            func(arg);
            WORK_CACHE.get().free(ptr as *mut u8);
        }
    }
}

static GLOBAL: WorkList = WorkList::new();
const NULL_LIST: OnceCell<&'static WorkList> = OnceCell::uninit();
static PER_CPU: [OnceCell<&'static WorkList>; MAX_CPUS] = [NULL_LIST; MAX_CPUS];

/// A workqueue worker never stops on its own: like the reaper, it is a
/// permanent per-queue daemon for the life of the kernel.
fn worker_loop(list: &'static WorkList) -> ! {
    loop {
        list.run_one();
    }
}

/// Enqueue work on the global queue, serviced by `worker/global`.
pub fn add(func: fn(u64), arg: u64) -> KResult<()> {
    GLOBAL.push(func, arg)
}

/// Enqueue work on a specific CPU's queue, serviced by that CPU's
/// `worker/<cpu>` thread.
pub fn add_on(cpu: u32, func: fn(u64), arg: u64) -> KResult<()> {
    let list = *PER_CPU[cpu as usize].get().ok_or(Errno::NoDev)?;
    list.push(func, arg)
}

/// Enqueue a boxed closure on the global queue. The `Work` item itself is
/// still the ordinary `fn(u64)` + `u64` pair; the closure is leaked onto the
/// heap and `arg` is its address, recovered and dropped by `run_closure`
/// once the worker runs it. For callers (like ISR teardown) that need to
/// capture state without plumbing it through a dedicated `fn`.
pub fn add_closure(f: alloc::boxed::Box<dyn FnOnce() + Send + 'static>) -> KResult<()> {
    let raw = alloc::boxed::Box::into_raw(alloc::boxed::Box::new(f));
    let result = GLOBAL.push(run_closure, raw as u64);
    if result.is_err() {
        // Reclaim instead of leaking if the queue couldn't accept it.
        unsafe {
            drop(alloc::boxed::Box::from_raw(raw));
        }
    }
    result
}

fn run_closure(arg: u64) {
    let raw = arg as *mut alloc::boxed::Box<dyn FnOnce() + Send + 'static>;
    let boxed = unsafe { alloc::boxed::Box::from_raw(raw) };
    (*boxed)();
}

/// Spawn the calling CPU's worker thread, and on the BSP also the single
/// global worker. Called once per CPU during scheduler bring-up.
pub fn init_this_cpu() {
    let cpu = crate::per_cpu::cpu_id();
    let list: &'static WorkList = alloc::boxed::Box::leak(alloc::boxed::Box::new(WorkList::new()));
    PER_CPU[cpu as usize].try_init_once(|| list).ok();

    kthread::kthread_run(move || worker_loop(list), "worker/pcpu", policy::DEFAULT_PRIORITY)
        .expect("failed to spawn per-CPU workqueue worker");

    if cpu == 0 {
        kthread::kthread_run(move || worker_loop(&GLOBAL), "worker/global", policy::DEFAULT_PRIORITY)
            .expect("failed to spawn global workqueue worker");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU64, Ordering};

    static LAST_ARG: AtomicU64 = AtomicU64::new(0);

    fn record(arg: u64) {
        LAST_ARG.store(arg, Ordering::Release);
    }

    #[test]
    fn work_list_runs_pushed_item_in_order() {
        let list = WorkList::new();
        list.push(record, 42).unwrap();
        list.run_one();
        assert_eq!(LAST_ARG.load(Ordering::Acquire), 42);
    }
}
