//! The scheduler proper: picking the next thread to run, switching to it,
//! and the sleep/wakeup protocol every blocking primitive in `sync` is
//! built on. Each CPU owns exactly one run queue (`task::runqueue`); this
//! module is what ties that queue, the active policy, and `per_cpu`
//! together into an actual preemptive scheduler.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::task::process::{self, ProcessId};
use crate::task::runqueue;
pub use crate::task::thread::SleepFlags;
use crate::task::thread::{self, ThreadState};
use crate::task::{context_switch, policy};

static SCHED_RUNNING: AtomicBool = AtomicBool::new(false);

/// Whether any CPU has started running its idle thread yet. Sync
/// primitives use this to tell a genuine scheduling wait apart from the
/// brief window during boot where locks are still plain spins.
pub fn is_running() -> bool {
    SCHED_RUNNING.load(Ordering::Acquire)
}

/// The tid of the thread executing on the calling CPU right now, or 0
/// before this CPU's scheduler has started.
pub fn current_thread_id() -> u64 {
    let ptr = crate::per_cpu::current_thread_ptr();
    if ptr.is_null() {
        0
    } else {
        unsafe { (*ptr).tid }
    }
}

/// Create this CPU's run queue and idle thread, and make the idle thread
/// "current" so `per_cpu::current_thread_ptr()` is never null once this
/// returns. Does not start running it: call [`start`] for that.
pub fn init_this_cpu(cpu_id: u32, idle_entry: extern "C" fn(u64) -> !) {
    let rq = runqueue::init_for_cpu(cpu_id);
    let tid_alloc = process::tid_alloc_of(process::KERNEL_PID).expect("kernel process not initialized");
    let tid = thread::create_kernel_thread(
        alloc::format!("idle/{}", cpu_id),
        process::KERNEL_PID,
        tid_alloc,
        idle_entry,
        0,
        (policy::NUM_BANDS - 1) as u8,
    )
    .expect("failed to create idle thread");
    process::with_process(process::KERNEL_PID, |p| p.attach_thread(tid));

    rq.attach(tid);
    rq.set_idle(tid);
    rq.set_current(tid);
    thread::with_thread(tid, |t| t.set_state(ThreadState::Running));

    let ptr = thread::thread_ptr(tid);
    unsafe {
        crate::per_cpu::set_idle_thread(ptr);
        crate::per_cpu::set_current_thread(ptr);
    }
}

/// Switch into this CPU's idle thread for the first time. Never returns:
/// the idle thread's own loop becomes the CPU's permanent fallback path
/// whenever there is nothing else ready to run.
pub fn start() -> ! {
    SCHED_RUNNING.store(true, Ordering::Release);
    let idle = crate::per_cpu::idle_thread_ptr();
    unsafe { context_switch::switch_to_first(idle) }
}

/// Attach `tid` to the calling CPU's run queue and make it ready. Load
/// balancing across CPUs is not implemented: every thread lands on
/// whichever CPU spawned it.
pub fn spawn(tid: u64) {
    let rq = crate::per_cpu::runqueue();
    rq.attach(tid);
    rq.enqueue_ready(tid);
    crate::per_cpu::set_need_resched();
}

/// Record that the current thread is about to sleep (via `schedule()`),
/// optionally with a timeout. Must be called with the caller's wait queue
/// already holding the thread's tid, immediately before `schedule()`:
/// once this returns the thread is off the ready queue and only a
/// `sched_wakeup`/timeout expiry will put it back.
pub fn sched_prepare_sleep(timeout_ms: u64, flags: SleepFlags) {
    let tid = current_thread_id();
    thread::with_thread(tid, |t| t.set_sleep_flags(flags));
    let rq = crate::per_cpu::runqueue();
    let wake_at = if timeout_ms == 0 {
        u64::MAX
    } else {
        crate::time::uptime_us().saturating_add(timeout_ms.saturating_mul(1000))
    };
    rq.push_sleeper(tid, wake_at, flags);
}

/// Wake `tid`: pull it off whatever CPU's sleeper list it is parked on,
/// stash `reason` for it to observe as `schedule()`'s return value, and
/// make it ready again. `reason` is typically 0 (normal wakeup) or a
/// negative `Errno` value (timeout, interrupted).
pub fn sched_wakeup(tid: u64, reason: i32) {
    let Some(cpu) = thread::with_thread(tid, |t| t.cpu.load(Ordering::Acquire)) else {
        return;
    };
    let rq = runqueue::for_cpu(cpu);
    if !rq.remove_sleeper(tid) {
        // Already moved to ready (or reaped) by a racing wakeup/timeout; the
        // reason it actually woke for is whichever happened first.
        return;
    }
    thread::with_thread(tid, |t| t.wakeup_err.store(reason, Ordering::Release));
    rq.enqueue_ready(tid);
    if cpu == crate::per_cpu::cpu_id() {
        crate::per_cpu::set_need_resched();
    } else {
        crate::interrupts::controller::send_ipi(cpu, crate::interrupts::controller::Ipi::Reschedule);
    }
}

/// Block the current thread (e.g. waiting on a condition with no timeout
/// of its own) and reschedule. Returns once some other path transitions it
/// back to READY and it is chosen again.
pub fn block_current() -> i32 {
    let tid = current_thread_id();
    thread::with_thread(tid, |t| t.set_state(ThreadState::Blocked));
    schedule()
}

/// Move a BLOCKED thread back onto its owning CPU's ready queue.
pub fn unblock(tid: u64) {
    let Some(cpu) = thread::with_thread(tid, |t| t.cpu.load(Ordering::Acquire)) else {
        return;
    };
    let rq = runqueue::for_cpu(cpu);
    rq.enqueue_ready(tid);
    if cpu == crate::per_cpu::cpu_id() {
        crate::per_cpu::set_need_resched();
    } else {
        crate::interrupts::controller::send_ipi(cpu, crate::interrupts::controller::Ipi::Reschedule);
    }
}

/// The core reschedule point. Picks the next ready thread (or this CPU's
/// idle thread if none is ready), switches to it, and returns once this
/// thread is chosen again -- possibly much later, on a fresh stack frame's
/// worth of callers above it, which is exactly why this can't be `unsafe`
/// `-> !`: from the caller's point of view it's an ordinary function call
/// that sometimes takes a while.
///
/// Returns whatever `reason` a `sched_wakeup` stashed for this thread (0 if
/// none), consumed exactly once.
pub fn schedule() -> i32 {
    x86_64::instructions::interrupts::disable();
    crate::per_cpu::clear_need_resched();

    let rq = crate::per_cpu::runqueue();
    let prev_tid = rq.current_tid();
    let prev_ptr = crate::per_cpu::current_thread_ptr();
    let prev_state = thread::with_thread(prev_tid, |t| t.state());

    if prev_state == Some(ThreadState::Running) {
        rq.enqueue_ready(prev_tid);
    }

    let next_tid = rq.pick_next().unwrap_or_else(|| rq.idle_tid());

    if next_tid == prev_tid {
        thread::with_thread(prev_tid, |t| t.set_state(ThreadState::Running));
        x86_64::instructions::interrupts::enable();
        return thread::with_thread(prev_tid, |t| t.wakeup_err.swap(0, Ordering::AcqRel)).unwrap_or(0);
    }

    let next_ptr = thread::thread_ptr(next_tid);
    thread::with_thread(next_tid, |t| t.set_state(ThreadState::Running));
    rq.set_current(next_tid);
    unsafe {
        crate::per_cpu::set_current_thread(next_ptr);
        context_switch::switch(prev_ptr, next_ptr);
    }

    // Resumes here once some future `schedule()` call picks `prev_tid`
    // again. Interrupts were disabled by whichever call switched us out;
    // re-enable before returning to our caller.
    x86_64::instructions::interrupts::enable();
    thread::with_thread(prev_tid, |t| t.wakeup_err.swap(0, Ordering::AcqRel)).unwrap_or(0)
}

/// Called from `preempt_enable` once the preempt count drops back to zero
/// with `need_resched` set: take the hit here rather than leaving it for
/// the next timer tick.
pub fn preempt_check() {
    if is_running() && crate::per_cpu::need_resched() && crate::per_cpu::preempt_count() == 0 {
        schedule();
    }
}

/// Per-tick housekeeping for the calling CPU's run queue: wake any
/// sleepers whose timeout has elapsed and ask the active policy whether
/// the running thread's quantum is up.
pub fn sched_tick() {
    let rq = crate::per_cpu::runqueue();
    let now = crate::time::uptime_us();
    for tid in rq.expired_sleepers(now) {
        thread::with_thread(tid, |t| {
            // §4.5/§8: a plain timed sleep wakes with 0 (natural); only a
            // BLOCK-flagged sleep's timeout is reported as -ETIMEDOUT.
            let err = if t.is_blocking_sleep() { crate::error::Errno::TimedOut as i32 } else { 0 };
            t.wakeup_err.store(err, Ordering::Release)
        });
        rq.enqueue_ready(tid);
    }
    if rq.tick_current() {
        crate::per_cpu::set_need_resched();
    }
}

/// Tear down the current thread: mark it a zombie (for the per-CPU reaper
/// to destroy), detach it from its process, and never return. Must be
/// called on the thread's own stack; `schedule()` never picks a zombie
/// back up, so the following loop only ever runs its first iteration.
pub fn exit_current(code: i32) -> ! {
    let tid = current_thread_id();
    let pid = thread::with_thread(tid, |t| t.process).unwrap_or(process::KERNEL_PID);
    process::with_process(pid, |p| {
        p.set_exit_code(code);
        p.detach_thread(tid);
    });
    crate::per_cpu::runqueue().push_zombie(tid);
    loop {
        schedule();
    }
}

/// The process a tid belongs to, if it still exists.
pub fn process_of(tid: u64) -> Option<ProcessId> {
    thread::with_thread(tid, |t| t.process)
}
