//! Arena allocator with chained small-block regions and a side list of
//! large allocations.
//!
//! Small allocations bump-allocate out of fixed-size arenas; when the
//! current arena cannot satisfy a request a few times in a row, the scan
//! start advances past it so long-lived pools do not rescan full arenas.
//! Large allocations go to a separate list and are the only ones that can
//! be freed individually. Cleanups registered on the pool run when the
//! pool is destroyed or reset, most recent first.
//!
//! Callers must not use returned pointers after the pool is reset or
//! dropped; the pool is the unit of memory lifetime for a connection or
//! request.

#![allow(dead_code)] // the full allocation contract is wider than the in-tree consumers

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;

/// Allocations at or below this size come from the arena chain; anything
/// larger goes to the large list.
const MAX_SMALL: usize = 4095;

/// Arenas that fail this many allocation attempts are skipped by the scan.
const MAX_FAILED: u32 = 4;

const POOL_ALIGNMENT: usize = 16;

struct Arena {
    base: NonNull<u8>,
    layout: Layout,
    used: usize,
    failed: u32,
}

impl Arena {
    fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, POOL_ALIGNMENT).expect("arena layout");
        let base = unsafe { alloc(layout) };
        let base = NonNull::new(base).expect("arena allocation failed");
        Self {
            base,
            layout,
            used: 0,
            failed: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Try to carve `size` bytes out of this arena, optionally aligned.
    fn take(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let offset = if align > 1 {
            let addr = self.base.as_ptr() as usize + self.used;
            self.used + (addr.wrapping_neg() & (align - 1))
        } else {
            self.used
        };
        if offset + size > self.capacity() {
            return None;
        }
        self.used = offset + size;
        // Offset stays within the arena allocation checked above.
        Some(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) })
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

struct Large {
    ptr: NonNull<u8>,
    layout: Layout,
}

type Cleanup = Box<dyn FnOnce()>;

/// Region-style allocator with LIFO cleanups.
pub struct Pool {
    arenas: Vec<Arena>,
    /// Index of the first arena the small-allocation scan considers.
    current: usize,
    /// Largest request served from the arena chain.
    max: usize,
    /// Size of each appended arena (the head arena's size).
    block_size: usize,
    large: Vec<Large>,
    cleanups: Vec<Cleanup>,
}

impl Pool {
    /// Create a pool whose head arena holds `size` bytes.
    pub fn new(size: usize) -> Self {
        let size = size.max(64);
        Self {
            arenas: vec![Arena::new(size)],
            current: 0,
            max: size.min(MAX_SMALL),
            block_size: size,
            large: Vec::new(),
            cleanups: Vec::new(),
        }
    }

    /// Allocate `size` bytes with no particular alignment.
    pub fn alloc(&mut self, size: usize) -> NonNull<u8> {
        self.alloc_with_align(size, 1)
    }

    /// Allocate `size` bytes aligned for pointer-sized access.
    pub fn alloc_aligned(&mut self, size: usize) -> NonNull<u8> {
        self.alloc_with_align(size, std::mem::align_of::<usize>())
    }

    fn alloc_with_align(&mut self, size: usize, align: usize) -> NonNull<u8> {
        if size <= self.max {
            self.alloc_small(size, align)
        } else {
            self.alloc_large(size, align)
        }
    }

    fn alloc_small(&mut self, size: usize, align: usize) -> NonNull<u8> {
        for idx in self.current..self.arenas.len() {
            if let Some(p) = self.arenas[idx].take(size, align) {
                return p;
            }
        }

        // No arena fits: append a fresh one sized like the head arena,
        // charging a failure to every arena the scan walked. Arenas that
        // keep failing are skipped by future scans.
        for idx in self.current..self.arenas.len() {
            let arena = &mut self.arenas[idx];
            arena.failed += 1;
            if arena.failed > MAX_FAILED && self.current == idx {
                self.current = idx + 1;
            }
        }
        self.current = self.current.min(self.arenas.len() - 1);

        let mut arena = Arena::new(self.block_size);
        let p = arena
            .take(size, align)
            .expect("fresh arena must fit a small allocation");
        self.arenas.push(arena);
        if self.current >= self.arenas.len() {
            self.current = self.arenas.len() - 1;
        }
        p
    }

    fn alloc_large(&mut self, size: usize, align: usize) -> NonNull<u8> {
        let layout =
            Layout::from_size_align(size, align.max(POOL_ALIGNMENT)).expect("large layout");
        let ptr = unsafe { alloc(layout) };
        let ptr = NonNull::new(ptr).expect("large allocation failed");
        self.large.push(Large { ptr, layout });
        ptr
    }

    /// Free a single allocation. Only large allocations can be freed this
    /// way; returns false (declined) for anything else.
    pub fn free(&mut self, ptr: NonNull<u8>) -> bool {
        if let Some(idx) = self.large.iter().position(|l| l.ptr == ptr) {
            let l = self.large.swap_remove(idx);
            unsafe { dealloc(l.ptr.as_ptr(), l.layout) };
            return true;
        }
        false
    }

    /// Register a cleanup to run at destroy/reset time. Cleanups run most
    /// recent first.
    pub fn cleanup<F: FnOnce() + 'static>(&mut self, f: F) {
        self.cleanups.push(Box::new(f));
    }

    /// Run cleanups, drop large allocations, and rewind every arena.
    /// Pointers previously returned by this pool are invalidated.
    pub fn reset(&mut self) {
        for c in self.cleanups.drain(..).rev() {
            c();
        }
        for l in self.large.drain(..) {
            unsafe { dealloc(l.ptr.as_ptr(), l.layout) };
        }
        for arena in &mut self.arenas {
            arena.used = 0;
            arena.failed = 0;
        }
        self.current = 0;
    }

    /// Bytes handed out from arenas plus large allocations; for
    /// accounting and tests.
    pub fn used(&self) -> usize {
        let small: usize = self.arenas.iter().map(|a| a.used).sum();
        let large: usize = self.large.iter().map(|l| l.layout.size()).sum();
        small + large
    }

    /// Total arena capacity plus large allocation sizes.
    pub fn capacity(&self) -> usize {
        let small: usize = self.arenas.iter().map(|a| a.capacity()).sum();
        let large: usize = self.large.iter().map(|l| l.layout.size()).sum();
        small + large
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        for c in self.cleanups.drain(..).rev() {
            c();
        }
        for l in self.large.drain(..) {
            unsafe { dealloc(l.ptr.as_ptr(), l.layout) };
        }
        // Arenas free themselves.
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("arenas", &self.arenas.len())
            .field("current", &self.current)
            .field("large", &self.large.len())
            .field("used", &self.used())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_small_allocations_share_arenas() {
        let mut pool = Pool::new(1024);
        let a = pool.alloc(100);
        let b = pool.alloc(100);
        assert_ne!(a, b);
        assert_eq!(pool.arenas.len(), 1);
        assert!(pool.used() <= pool.capacity());
    }

    #[test]
    fn test_arena_chain_grows_when_full() {
        let mut pool = Pool::new(256);
        for _ in 0..16 {
            pool.alloc(100);
        }
        assert!(pool.arenas.len() > 1);
        assert!(pool.used() <= pool.capacity());
    }

    #[test]
    fn test_scan_start_advances_past_failing_arenas() {
        let mut pool = Pool::new(256);
        // Each arena fits two 100-byte allocations; force repeated scan
        // failures so the head arena gets skipped.
        for _ in 0..2 * (MAX_FAILED as usize + 2) {
            pool.alloc(100);
        }
        assert!(pool.current > 0);
    }

    #[test]
    fn test_large_allocation_and_free() {
        let mut pool = Pool::new(512);
        let small = pool.alloc(16);
        let large = pool.alloc(MAX_SMALL + 1);

        assert!(!pool.free(small), "small allocations are declined");
        assert!(pool.free(large));
        assert!(!pool.free(large), "double free is declined");
    }

    #[test]
    fn test_alloc_aligned() {
        let mut pool = Pool::new(512);
        pool.alloc(3);
        let p = pool.alloc_aligned(8);
        assert_eq!(p.as_ptr() as usize % std::mem::align_of::<usize>(), 0);
    }

    #[test]
    fn test_cleanups_run_lifo_exactly_once() {
        let order = Rc::new(RefCell::new(Vec::new()));
        {
            let mut pool = Pool::new(256);
            for i in 0..3 {
                let order = Rc::clone(&order);
                pool.cleanup(move || order.borrow_mut().push(i));
            }
        }
        assert_eq!(*order.borrow(), vec![2, 1, 0]);
    }

    #[test]
    fn test_reset_runs_cleanups_and_rewinds() {
        let ran = Rc::new(RefCell::new(0));
        let mut pool = Pool::new(256);
        {
            let ran = Rc::clone(&ran);
            pool.cleanup(move || *ran.borrow_mut() += 1);
        }
        pool.alloc(MAX_SMALL + 1);
        pool.alloc(32);

        pool.reset();
        assert_eq!(*ran.borrow(), 1);
        assert_eq!(pool.used(), 0);

        drop(pool);
        assert_eq!(*ran.borrow(), 1, "reset cleanups do not run again");
    }

    #[test]
    fn test_accounting_invariant() {
        let mut pool = Pool::new(300);
        let mut live = 0usize;
        for i in 0..40 {
            let n = 17 + (i * 13) % 200;
            pool.alloc(n);
            live += n;
        }
        pool.alloc(MAX_SMALL + 10);
        live += MAX_SMALL + 10;
        assert!(live <= pool.capacity());
        assert!(pool.used() >= live, "alignment may pad, never shrink");
    }
}
