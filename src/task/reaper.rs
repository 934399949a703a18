//! The per-CPU reaper: a dedicated kthread that waits on its run queue's
//! zombie semaphore, pops the next zombie thread, and once its refcount
//! has dropped to the single reference the arena itself holds, removes it
//! from the global thread table (dropping it for good).

use crate::task::policy;
use crate::task::thread;
use crate::task::{kthread, runqueue};

/// A freshly-zombied thread is still referenced by whatever last touched
/// it (a `kthread_join`, a wait queue that hasn't noticed yet); the reaper
/// only actually frees it once nothing else is holding on.
const REAPABLE_REFCOUNT: u32 = 0;

fn reap_one(rq: &'static runqueue::RunQueue) {
    let tid = rq.wait_zombie();
    loop {
        let refcount = thread::with_thread(tid, |t| t.refcount());
        match refcount {
            Some(n) if n > REAPABLE_REFCOUNT => {
                // Somebody still holds a reference; give them a chance to
                // drop it before spinning again.
                core::hint::spin_loop();
            }
            _ => break,
        }
    }
    thread::destroy(tid);
}

fn reaper_loop(rq: &'static runqueue::RunQueue) -> ! {
    loop {
        reap_one(rq);
    }
}

/// Spawn the calling CPU's reaper thread. Called once per CPU during
/// scheduler bring-up, after that CPU's run queue exists.
pub fn init_this_cpu() {
    let rq = crate::per_cpu::runqueue();
    kthread::kthread_run(move || reaper_loop(rq), "reaper", policy::DEFAULT_PRIORITY)
        .expect("failed to spawn reaper thread");
}
