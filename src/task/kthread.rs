//! Kernel threads: a closure wrapped up as a thread entry point, a handle
//! the spawner can join or ask to stop, and the park/unpark pair worker
//! pools use to idle without spinning. Every kthread belongs to the kernel
//! process and is spawned on the calling CPU.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::ToString;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use crate::sync::spinlock::SpinLockIrq;
use crate::task::process;
use crate::task::scheduler;
use crate::task::thread;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KthreadError {
    SpawnFailed,
    AlreadyStopped,
    NotFound,
}

struct Kthread {
    tid: u64,
    should_stop: AtomicBool,
    exit_code: AtomicI32,
    exited: AtomicBool,
    parked: AtomicBool,
}

#[derive(Clone)]
pub struct KthreadHandle(Arc<Kthread>);

impl KthreadHandle {
    pub fn tid(&self) -> u64 {
        self.0.tid
    }
}

/// The closure a freshly-spawned kthread runs, boxed up so its address fits
/// in the single argument register `CpuContext::new_kthread` hands off.
struct KthreadStart {
    func: Option<Box<dyn FnOnce() + Send + 'static>>,
}

static REGISTRY: SpinLockIrq<BTreeMap<u64, Arc<Kthread>>> = SpinLockIrq::new(BTreeMap::new());

/// Spawn `func` as a new kernel thread named `name` at the given priority
/// band, attached to the kernel process and runnable on the calling CPU.
pub fn kthread_run<F>(func: F, name: &str, priority: u8) -> Result<KthreadHandle, KthreadError>
where
    F: FnOnce() + Send + 'static,
{
    let tid_alloc = process::tid_alloc_of(process::KERNEL_PID).map_err(|_| KthreadError::SpawnFailed)?;

    let start = Box::new(KthreadStart { func: Some(Box::new(func)) });
    let arg = Box::into_raw(start) as u64;

    let tid = thread::create_kernel_thread(
        name.to_string(),
        process::KERNEL_PID,
        tid_alloc,
        kthread_entry,
        arg,
        priority,
    )
    .map_err(|_| KthreadError::SpawnFailed)?;

    let kthread = Arc::new(Kthread {
        tid,
        should_stop: AtomicBool::new(false),
        exit_code: AtomicI32::new(0),
        exited: AtomicBool::new(false),
        parked: AtomicBool::new(false),
    });

    process::with_process(process::KERNEL_PID, |p| p.attach_thread(tid));
    REGISTRY.lock().insert(tid, Arc::clone(&kthread));
    scheduler::spawn(tid);

    Ok(KthreadHandle(kthread))
}

/// Ask a kthread to stop at its own next convenience (`kthread_should_stop`
/// check), then wait for it to exit.
pub fn kthread_stop(handle: &KthreadHandle) -> Result<i32, KthreadError> {
    if handle.0.exited.load(Ordering::Acquire) {
        return Err(KthreadError::AlreadyStopped);
    }
    handle.0.should_stop.store(true, Ordering::Release);
    kthread_unpark_inner(&handle.0);
    kthread_join(handle);
    Ok(handle.0.exit_code.load(Ordering::Acquire))
}

/// Whether the calling kthread has been asked to stop. Must be polled from
/// inside the kthread's own closure; worker loops check this once per
/// iteration instead of being killed out from under a lock.
pub fn kthread_should_stop() -> bool {
    current_kthread().map(|k| k.0.should_stop.load(Ordering::Acquire)).unwrap_or(false)
}

fn current_kthread() -> Option<KthreadHandle> {
    let tid = scheduler::current_thread_id();
    REGISTRY.lock().get(&tid).cloned().map(KthreadHandle)
}

/// Park the calling kthread until `kthread_unpark` is called on its
/// handle, or it has been asked to stop.
pub fn kthread_park() {
    let Some(handle) = current_kthread() else {
        return;
    };
    handle.0.parked.store(true, Ordering::Release);
    while handle.0.parked.load(Ordering::Acquire) && !handle.0.should_stop.load(Ordering::Acquire) {
        scheduler::block_current();
    }
}

fn kthread_unpark_inner(kthread: &Arc<Kthread>) {
    if kthread.parked.swap(false, Ordering::AcqRel) {
        scheduler::unblock(kthread.tid);
    }
}

pub fn kthread_unpark(handle: &KthreadHandle) {
    kthread_unpark_inner(&handle.0);
}

/// Block the caller until `handle`'s kthread has exited.
pub fn kthread_join(handle: &KthreadHandle) {
    while !handle.0.exited.load(Ordering::Acquire) {
        core::hint::spin_loop();
    }
}

/// Terminate the calling kthread. Must be called from inside a kthread;
/// never returns.
pub fn kthread_exit(code: i32) -> ! {
    let tid = scheduler::current_thread_id();
    if let Some(kthread) = REGISTRY.lock().remove(&tid) {
        kthread.exit_code.store(code, Ordering::Release);
        kthread.exited.store(true, Ordering::Release);
    }
    scheduler::exit_current(code);
}

/// The trampoline every kthread starts at: unbox its closure, run it with
/// interrupts enabled, and fall through to `kthread_exit` if the closure
/// returns on its own instead of calling it explicitly.
extern "C" fn kthread_entry(arg: u64) -> ! {
    x86_64::instructions::interrupts::enable();
    let start = unsafe { Box::from_raw(arg as *mut KthreadStart) };
    if let Some(func) = start.func {
        func();
    }
    kthread_exit(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kthread_error_variants_are_distinct() {
        assert_ne!(KthreadError::SpawnFailed, KthreadError::NotFound);
    }
}
