//! Anonymous shared memory mappings.

use std::io;
use std::ptr::NonNull;

/// A `MAP_SHARED | MAP_ANONYMOUS` mapping, inherited across fork so every
/// worker sees it at the same address. Unmapped when the last handle in
/// this process drops.
#[derive(Debug)]
pub struct ShmMap {
    base: NonNull<u8>,
    size: usize,
}

impl ShmMap {
    pub fn new(size: usize) -> io::Result<Self> {
        debug_assert!(size > 0);
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            base: NonNull::new(ptr as *mut u8).expect("mmap returned null"),
            size,
        })
    }

    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for ShmMap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_is_zeroed_and_writable() {
        let map = ShmMap::new(8192).expect("mmap");
        let slice = unsafe { std::slice::from_raw_parts_mut(map.base(), map.size()) };
        assert!(slice.iter().all(|&b| b == 0));
        slice[0] = 0xAB;
        slice[8191] = 0xCD;
        assert_eq!(slice[0], 0xAB);
        assert_eq!(slice[8191], 0xCD);
    }
}
