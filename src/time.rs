//! Cached monotonic time.
//!
//! Reading the clock once per reactor iteration keeps timer arithmetic
//! cheap and gives every handler in the same iteration a consistent view
//! of "now".

use std::time::Instant;

/// Monotonic clock with a cached millisecond reading.
#[derive(Debug)]
pub struct Clock {
    start: Instant,
    now_ms: u64,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            now_ms: 0,
        }
    }

    /// Refresh the cached reading. Called once per reactor iteration,
    /// right after the poll call returns.
    pub fn update(&mut self) -> u64 {
        self.now_ms = self.start.elapsed().as_millis() as u64;
        self.now_ms
    }

    /// Milliseconds since the clock was created, as of the last `update`.
    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_clock_is_monotonic() {
        let mut clock = Clock::new();
        let a = clock.update();
        thread::sleep(Duration::from_millis(5));
        let b = clock.update();
        assert!(b >= a + 5);
        assert_eq!(b, clock.now_ms());
    }

    #[test]
    fn test_cached_reading_is_stable() {
        let mut clock = Clock::new();
        clock.update();
        let a = clock.now_ms();
        thread::sleep(Duration::from_millis(2));
        // No update in between: the cached value must not move.
        assert_eq!(a, clock.now_ms());
    }
}
