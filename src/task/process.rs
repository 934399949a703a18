//! Processes: a name, a credential set, a per-process thread-id bitmap,
//! and the set of threads currently attached. Process ids are drawn from
//! one global bitmap; thread ids are drawn from a bitmap owned by each
//! process, so two different processes can both have a thread 1.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use crate::error::KResult;
use crate::sync::spinlock::SpinLockIrq;
use crate::task::id_alloc::IdAllocator;

pub type ProcessId = u32;

/// pid 0 is the kernel process: the idle threads and every kthread spawned
/// before a "real" process exists are attached to it.
pub const KERNEL_PID: ProcessId = 0;

const MAX_PIDS: usize = 4096;
const MAX_TIDS_PER_PROCESS: usize = 1024;

#[derive(Debug, Clone, Copy)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    pub const KERNEL: Credentials = Credentials { uid: 0, gid: 0 };
}

pub struct Process {
    pub pid: ProcessId,
    pub parent: ProcessId,
    pub name: String,
    pub credentials: Credentials,
    pub tid_alloc: IdAllocator,
    threads: SpinLockIrq<Vec<u64>>,
    exit_code: AtomicI32,
    refcount: AtomicU32,
}

impl Process {
    pub fn retain(&self) -> u32 {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn release(&self) -> u32 {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        crate::bug_on!(prev == 0, "process refcount underflow");
        prev - 1
    }

    pub fn attach_thread(&self, tid: u64) {
        self.threads.lock().push(tid);
    }

    pub fn detach_thread(&self, tid: u64) {
        self.threads.lock().retain(|&t| t != tid);
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn set_exit_code(&self, code: i32) {
        self.exit_code.store(code, Ordering::Release);
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::Acquire)
    }
}

static PID_ALLOC: conquer_once::spin::OnceCell<IdAllocator> = conquer_once::spin::OnceCell::uninit();
static PROCESSES: SpinLockIrq<BTreeMap<ProcessId, Box<Process>>> = SpinLockIrq::new(BTreeMap::new());

fn pid_alloc() -> &'static IdAllocator {
    PID_ALLOC.try_init_once(|| IdAllocator::new(MAX_PIDS)).ok();
    PID_ALLOC.get().unwrap()
}

/// Create the kernel process (pid 0). Called once at boot before any
/// kthread is spawned.
pub fn init_kernel_process() {
    pid_alloc().reserve(KERNEL_PID as usize);
    let process = Box::new(Process {
        pid: KERNEL_PID,
        parent: KERNEL_PID,
        name: String::from("kernel"),
        credentials: Credentials::KERNEL,
        tid_alloc: IdAllocator::new(MAX_TIDS_PER_PROCESS),
        threads: SpinLockIrq::new(Vec::new()),
        exit_code: AtomicI32::new(0),
        refcount: AtomicU32::new(1),
    });
    PROCESSES.lock().insert(KERNEL_PID, process);
}

pub fn create(name: String, parent: ProcessId) -> KResult<ProcessId> {
    let pid = pid_alloc().alloc()? as ProcessId;
    let process = Box::new(Process {
        pid,
        parent,
        name,
        credentials: Credentials::KERNEL,
        tid_alloc: IdAllocator::new(MAX_TIDS_PER_PROCESS),
        threads: SpinLockIrq::new(Vec::new()),
        exit_code: AtomicI32::new(0),
        refcount: AtomicU32::new(1),
    });
    PROCESSES.lock().insert(pid, process);
    Ok(pid)
}

pub fn with_process<R>(pid: ProcessId, f: impl FnOnce(&Process) -> R) -> Option<R> {
    PROCESSES.lock().get(&pid).map(|p| f(p))
}

pub fn destroy(pid: ProcessId) {
    if pid == KERNEL_PID {
        return;
    }
    PROCESSES.lock().remove(&pid);
    pid_alloc().free(pid as usize);
}

/// A `'static` handle to a process's TID allocator. Sound because a
/// `Box<Process>` in `PROCESSES` never moves and is only ever dropped by
/// [`destroy`], which the caller of this function is responsible for not
/// racing (threads hold a process reference for exactly this reason).
pub fn tid_alloc_of(pid: ProcessId) -> KResult<&'static IdAllocator> {
    PROCESSES
        .lock()
        .get(&pid)
        .map(|p| unsafe { &*(&p.tid_alloc as *const IdAllocator) })
        .ok_or(crate::error::Errno::NoEnt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_destroy_reuses_pid() {
        init_kernel_process_for_test();
        let pid = create(String::from("test"), KERNEL_PID).unwrap();
        assert_ne!(pid, KERNEL_PID);
        destroy(pid);
    }

    fn init_kernel_process_for_test() {
        if with_process(KERNEL_PID, |_| ()).is_none() {
            init_kernel_process();
        }
    }
}
