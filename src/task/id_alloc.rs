//! Bitmap ID allocators. The same structure backs both the global process-ID
//! space and each process's per-thread-ID space; only the capacity and who
//! owns the instance differ.

use alloc::vec::Vec;

use crate::error::{Errno, KResult};
use crate::sync::spinlock::SpinLockIrq;

struct Bitmap {
    words: Vec<u64>,
    capacity: usize,
}

impl Bitmap {
    fn new(capacity: usize) -> Self {
        let words = (capacity + 63) / 64;
        Bitmap { words: alloc::vec![0u64; words], capacity }
    }

    fn alloc(&mut self) -> Option<usize> {
        for (i, word) in self.words.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = (!*word).trailing_zeros() as usize;
                let id = i * 64 + bit;
                if id >= self.capacity {
                    return None;
                }
                *word |= 1 << bit;
                return Some(id);
            }
        }
        None
    }

    fn free(&mut self, id: usize) {
        let word = id / 64;
        let bit = id % 64;
        crate::bug_on!(self.words[word] & (1 << bit) == 0, "id_alloc: double free of id {}", id);
        self.words[word] &= !(1u64 << bit);
    }
}

/// A bitmap allocator over `[0, capacity)`. Id 0 is reserved by convention
/// (callers that need "0 means none" can simply never hand it out) — here we
/// instead let the caller reserve it explicitly via [`IdAllocator::reserve`].
pub struct IdAllocator {
    bitmap: SpinLockIrq<Bitmap>,
}

impl IdAllocator {
    pub fn new(capacity: usize) -> Self {
        IdAllocator { bitmap: SpinLockIrq::new(Bitmap::new(capacity)) }
    }

    pub fn alloc(&self) -> KResult<usize> {
        self.bitmap.lock().alloc().ok_or(Errno::NoMem)
    }

    pub fn free(&self, id: usize) {
        self.bitmap.lock().free(id);
    }

    /// Mark `id` permanently taken without handing it to a caller first
    /// (used to reserve id 0 for the idle/kernel thread or PID 0).
    pub fn reserve(&self, id: usize) {
        let mut bitmap = self.bitmap.lock();
        let word = id / 64;
        let bit = id % 64;
        bitmap.words[word] |= 1 << bit;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_ascending_ids_and_reuses_freed() {
        let a = IdAllocator::new(8);
        let first = a.alloc().unwrap();
        let second = a.alloc().unwrap();
        assert_ne!(first, second);
        a.free(first);
        let third = a.alloc().unwrap();
        assert_eq!(third, first);
    }

    #[test]
    fn exhausts_capacity() {
        let a = IdAllocator::new(2);
        a.alloc().unwrap();
        a.alloc().unwrap();
        assert_eq!(a.alloc(), Err(Errno::NoMem));
    }

    #[test]
    fn reserve_blocks_an_id_up_front() {
        let a = IdAllocator::new(4);
        a.reserve(0);
        let id = a.alloc().unwrap();
        assert_ne!(id, 0);
    }
}
