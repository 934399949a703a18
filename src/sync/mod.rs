//! Locking and atomics primitives: spinlocks (plain and IRQ-disabling),
//! read-write spinlocks, a scheduler-aware mutex, a counting semaphore, and
//! a one-shot completion.

pub mod completion;
pub mod mutex;
pub mod rwlock;
pub mod semaphore;
pub mod spinlock;

pub use completion::Completion;
pub use mutex::Mutex;
pub use rwlock::RwSpinLock;
pub use semaphore::Semaphore;
pub use spinlock::{SpinLock, SpinLockIrq};
