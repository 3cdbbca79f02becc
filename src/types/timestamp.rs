//! Hybrid-logical timestamp
//!
//! Commit ordering uses `(physical nanoseconds, logical counter)` pairs with a
//! strict total order. The allocator never regresses, even when the wall clock
//! does, and replay pushes it forward past every timestamp it observes.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Hybrid-logical timestamp. Field order gives the derived `Ord` the
/// physical-then-logical comparison.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
pub struct Timestamp {
    physical: i64,
    logical: u32,
}

impl Timestamp {
    pub const MIN: Timestamp = Timestamp { physical: 0, logical: 0 };
    pub const MAX: Timestamp = Timestamp { physical: i64::MAX, logical: u32::MAX };

    pub fn new(physical: i64, logical: u32) -> Self {
        Self { physical, logical }
    }

    pub fn physical(&self) -> i64 {
        self.physical
    }

    pub fn logical(&self) -> u32 {
        self.logical
    }

    /// The minimal timestamp strictly greater than `self`.
    pub fn next(&self) -> Timestamp {
        if self.logical == u32::MAX {
            Timestamp { physical: self.physical + 1, logical: 0 }
        } else {
            Timestamp { physical: self.physical, logical: self.logical + 1 }
        }
    }

    /// The maximal timestamp strictly smaller than `self`; saturates at
    /// `MIN`.
    pub fn prev(&self) -> Timestamp {
        if *self == Timestamp::MIN {
            Timestamp::MIN
        } else if self.logical == 0 {
            Timestamp { physical: self.physical - 1, logical: u32::MAX }
        } else {
            Timestamp { physical: self.physical, logical: self.logical - 1 }
        }
    }

    /// Fixed 12-byte big-endian encoding, used for reserved logtail columns.
    pub fn to_bytes(&self) -> [u8; 12] {
        let mut buf = [0u8; 12];
        buf[..8].copy_from_slice(&self.physical.to_be_bytes());
        buf[8..].copy_from_slice(&self.logical.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Timestamp> {
        if buf.len() != 12 {
            return None;
        }
        let physical = i64::from_be_bytes(buf[..8].try_into().ok()?);
        let logical = u32::from_be_bytes(buf[8..].try_into().ok()?);
        Some(Timestamp { physical, logical })
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.physical, self.logical)
    }
}

/// Monotone timestamp allocator.
///
/// `alloc` returns a timestamp strictly greater than everything previously
/// allocated or observed. The physical half follows the wall clock when the
/// clock is ahead; otherwise the logical half ticks.
pub struct TsAllocator {
    last: Mutex<Timestamp>,
}

impl TsAllocator {
    pub fn new() -> Self {
        Self { last: Mutex::new(Timestamp::new(wall_nanos(), 0)) }
    }

    /// Start from a fixed timestamp. Tests use this for deterministic orders.
    pub fn with_start(start: Timestamp) -> Self {
        Self { last: Mutex::new(start) }
    }

    pub fn alloc(&self) -> Timestamp {
        let mut last = self.last.lock();
        let wall = wall_nanos();
        let next = if wall > last.physical { Timestamp::new(wall, 0) } else { last.next() };
        *last = next;
        next
    }

    /// Push the clock past a replayed timestamp.
    pub fn observe(&self, ts: Timestamp) {
        let mut last = self.last.lock();
        if ts > *last {
            *last = ts;
        }
    }

    /// The most recently allocated or observed timestamp.
    pub fn last(&self) -> Timestamp {
        *self.last.lock()
    }
}

impl Default for TsAllocator {
    fn default() -> Self {
        Self::new()
    }
}

fn wall_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_is_minimal_increment() {
        let ts = Timestamp::new(100, 5);
        assert_eq!(ts.next(), Timestamp::new(100, 6));

        let rollover = Timestamp::new(100, u32::MAX);
        assert_eq!(rollover.next(), Timestamp::new(101, 0));
    }

    #[test]
    fn test_total_order() {
        let a = Timestamp::new(1, 10);
        let b = Timestamp::new(2, 0);
        let c = Timestamp::new(2, 1);
        assert!(a < b && b < c);
        assert!(a < a.next());
    }

    #[test]
    fn test_allocator_monotone() {
        let alloc = TsAllocator::new();
        let mut prev = alloc.alloc();
        for _ in 0..10_000 {
            let ts = alloc.alloc();
            assert!(ts > prev);
            prev = ts;
        }
    }

    #[test]
    fn test_observe_pushes_forward() {
        let alloc = TsAllocator::with_start(Timestamp::new(10, 0));
        let future = Timestamp::new(i64::MAX - 1, 3);
        alloc.observe(future);
        assert!(alloc.alloc() > future);
    }

    #[test]
    fn test_byte_roundtrip() {
        let ts = Timestamp::new(-7, 42);
        assert_eq!(Timestamp::from_bytes(&ts.to_bytes()), Some(ts));
        assert_eq!(Timestamp::from_bytes(&[0u8; 4]), None);
    }
}
