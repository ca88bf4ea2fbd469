//! The core shared region: accept mutex and per-worker counters.
//!
//! A single small mapping created before workers fork and reused across
//! cycles, holding the process-shared state the event engine needs: the
//! accept-mutex lock word and accept/active counters per worker slot.

use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::shm::{ShmMap, ShmMutex};

pub const MAX_WORKERS: usize = 64;

#[repr(C)]
struct CoreShared {
    accept_lock: AtomicU32,
    _pad: u32,
    accepted: [AtomicU64; MAX_WORKERS],
    active: [AtomicU64; MAX_WORKERS],
}

/// Handle to the core shared region; cheap to clone, reused by every
/// cycle generation.
#[derive(Clone)]
pub struct SharedRegion {
    map: Rc<ShmMap>,
}

impl SharedRegion {
    pub fn new() -> io::Result<Self> {
        let size = std::mem::size_of::<CoreShared>().next_multiple_of(4096);
        let map = Rc::new(ShmMap::new(size)?);
        Ok(Self { map })
    }

    fn shared(&self) -> &CoreShared {
        unsafe { &*(self.map.base() as *const CoreShared) }
    }

    pub fn accept_mutex(&self) -> ShmMutex {
        unsafe { ShmMutex::from_ptr(self.map.base()) }
    }

    pub fn note_accept(&self, worker: usize) {
        if worker < MAX_WORKERS {
            self.shared().accepted[worker].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn accepted(&self, worker: usize) -> u64 {
        if worker < MAX_WORKERS {
            self.shared().accepted[worker].load(Ordering::Relaxed)
        } else {
            0
        }
    }

    pub fn set_active(&self, worker: usize, n: u64) {
        if worker < MAX_WORKERS {
            self.shared().active[worker].store(n, Ordering::Relaxed);
        }
    }

    pub fn active(&self, worker: usize) -> u64 {
        if worker < MAX_WORKERS {
            self.shared().active[worker].load(Ordering::Relaxed)
        } else {
            0
        }
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("base", &self.map.base())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_zero_and_accumulate() {
        let region = SharedRegion::new().expect("region");
        assert_eq!(region.accepted(0), 0);
        region.note_accept(0);
        region.note_accept(0);
        region.note_accept(3);
        assert_eq!(region.accepted(0), 2);
        assert_eq!(region.accepted(3), 1);

        region.set_active(1, 17);
        assert_eq!(region.active(1), 17);
    }

    #[test]
    fn test_clone_shares_state() {
        let region = SharedRegion::new().expect("region");
        let other = region.clone();
        region.note_accept(5);
        assert_eq!(other.accepted(5), 1);

        let mtx = region.accept_mutex();
        assert!(mtx.try_lock(9));
        assert!(!other.accept_mutex().try_lock(10));
        assert!(mtx.unlock(9));
    }

    #[test]
    fn test_out_of_range_worker_is_ignored() {
        let region = SharedRegion::new().expect("region");
        region.note_accept(MAX_WORKERS + 1);
        assert_eq!(region.accepted(MAX_WORKERS + 1), 0);
    }
}
