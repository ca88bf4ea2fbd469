//! Process-shared mutex over a lock word in shared memory.
//!
//! The word holds 0 when free and the holder's pid when taken. Accept-mutex
//! users only ever try-lock; slab users hold it across short critical
//! sections only, so contention is resolved by spinning with a yield
//! backoff. Holders must not call into the reactor, allocate from a pool,
//! or block on I/O.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

const SPIN_ROUNDS: u32 = 2048;

/// Handle to a lock word living inside an `ShmMap`. Copyable; the mapping
/// must outlive every handle.
#[derive(Clone, Copy, Debug)]
pub struct ShmMutex {
    word: NonNull<AtomicU32>,
}

impl ShmMutex {
    /// # Safety
    /// `word` must point into a live shared mapping, be aligned for
    /// `AtomicU32`, and remain mapped for the life of the handle.
    pub unsafe fn from_ptr(word: *mut u8) -> Self {
        debug_assert_eq!(word as usize % std::mem::align_of::<AtomicU32>(), 0);
        Self {
            word: NonNull::new(word as *mut AtomicU32).expect("null lock word"),
        }
    }

    fn word(&self) -> &AtomicU32 {
        unsafe { self.word.as_ref() }
    }

    /// Single CAS attempt; never blocks.
    pub fn try_lock(&self, id: u32) -> bool {
        self.word()
            .compare_exchange(0, id, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Spin until acquired. Only for short critical sections (slab).
    pub fn lock(&self, id: u32) {
        loop {
            for _ in 0..SPIN_ROUNDS {
                if self.word().load(Ordering::Relaxed) == 0 && self.try_lock(id) {
                    return;
                }
                std::hint::spin_loop();
            }
            unsafe {
                libc::sched_yield();
            }
        }
    }

    /// Release if held by `id`.
    pub fn unlock(&self, id: u32) -> bool {
        self.word()
            .compare_exchange(id, 0, Ordering::Release, Ordering::Relaxed)
            .is_ok()
    }

    /// Release a lock held by another process (a reaped worker).
    pub fn force_unlock(&self, id: u32) -> bool {
        self.unlock(id)
    }

    pub fn holder(&self) -> u32 {
        self.word().load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::ShmMap;

    #[test]
    fn test_try_lock_and_unlock() {
        let map = ShmMap::new(64).expect("mmap");
        let mtx = unsafe { ShmMutex::from_ptr(map.base()) };

        assert!(mtx.try_lock(100));
        assert_eq!(mtx.holder(), 100);
        assert!(!mtx.try_lock(200), "second locker must fail");
        assert!(!mtx.unlock(200), "only the holder can unlock");
        assert!(mtx.unlock(100));
        assert!(mtx.try_lock(200));
        assert!(mtx.unlock(200));
    }

    #[test]
    fn test_force_unlock_clears_dead_holder() {
        let map = ShmMap::new(64).expect("mmap");
        let mtx = unsafe { ShmMutex::from_ptr(map.base()) };

        assert!(mtx.try_lock(4242));
        assert!(mtx.force_unlock(4242));
        assert_eq!(mtx.holder(), 0);
    }
}
