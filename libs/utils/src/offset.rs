use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// A byte position in the append-only commit log.
///
/// Physical offsets are monotonic non-decreasing per node; arithmetic that
/// could wrap is considered a bug, hence the checked `Add` below.
#[derive(Clone, Copy, Default, Eq, Ord, PartialEq, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Offset(pub u64);

impl Offset {
    /// The start of the log.
    pub const ZERO: Offset = Offset(0);

    /// Subtract a number of bytes, returning None on overflow.
    pub fn checked_sub<T: Into<u64>>(self, other: T) -> Option<Offset> {
        self.0.checked_sub(other.into()).map(Offset)
    }

    /// Bytes by which `self` is ahead of `other`; zero if it is behind.
    pub fn saturating_sub(self, other: Offset) -> u64 {
        self.0.saturating_sub(other.0)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for Offset {
    fn from(n: u64) -> Offset {
        Offset(n)
    }
}

impl From<Offset> for u64 {
    fn from(off: Offset) -> u64 {
        off.0
    }
}

impl Add<u64> for Offset {
    type Output = Offset;

    fn add(self, other: u64) -> Self::Output {
        // panic on overflow
        Offset(self.0.checked_add(other).expect("offset overflow"))
    }
}

impl AddAssign<u64> for Offset {
    fn add_assign(&mut self, other: u64) {
        *self = *self + other;
    }
}

impl FromStr for Offset {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(Offset)
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Offset {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Atomic [`Offset`] cell, advanced only monotonically.
pub struct AtomicOffset {
    inner: AtomicU64,
}

impl AtomicOffset {
    pub fn new(val: Offset) -> Self {
        AtomicOffset {
            inner: AtomicU64::new(val.0),
        }
    }

    pub fn load(&self) -> Offset {
        Offset(self.inner.load(Ordering::Acquire))
    }

    pub fn store(&self, val: Offset) {
        self.inner.store(val.0, Ordering::Release);
    }

    /// Advance the cell to `candidate` with a compare-and-set loop; values
    /// less than or equal to the current one are ignored. Returns whether the
    /// stored value grew.
    pub fn advance(&self, candidate: Offset) -> bool {
        let mut current = self.inner.load(Ordering::Acquire);
        loop {
            if candidate.0 <= current {
                return false;
            }
            match self.inner.compare_exchange_weak(
                current,
                candidate.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(seen) => current = seen,
            }
        }
    }
}

impl fmt::Debug for AtomicOffset {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.load())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_offset_arithmetic() {
        let off = Offset(100);
        assert_eq!(off + 28, Offset(128));
        assert_eq!(off.checked_sub(30u64), Some(Offset(70)));
        assert_eq!(off.checked_sub(101u64), None);
        assert_eq!(Offset(50).saturating_sub(Offset(80)), 0);
        assert_eq!(Offset(80).saturating_sub(Offset(50)), 30);

        let mut off = Offset::ZERO;
        off += 12;
        assert_eq!(off, Offset(12));
    }

    #[test]
    fn test_offset_parse_display() {
        assert_eq!("4096".parse::<Offset>().unwrap(), Offset(4096));
        assert!("nope".parse::<Offset>().is_err());
        assert_eq!(format!("{}", Offset(4096)), "4096");
        assert_eq!(format!("{:?}", Offset(4096)), "4096");
    }

    #[test]
    fn test_offset_serde_transparent() {
        let json = serde_json::to_string(&Offset(42)).unwrap();
        assert_eq!(json, "42");
        let back: Offset = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Offset(42));
    }

    #[test]
    fn test_atomic_offset_advance() {
        let cell = AtomicOffset::new(Offset(10));
        assert!(!cell.advance(Offset(10)));
        assert!(!cell.advance(Offset(5)));
        assert!(cell.advance(Offset(20)));
        assert_eq!(cell.load(), Offset(20));
    }

    // many writers racing: final value must be the max of everything submitted
    #[test]
    fn test_atomic_offset_advance_concurrent() {
        let cell = Arc::new(AtomicOffset::new(Offset::ZERO));
        let mut handles = Vec::new();
        for t in 0..8u64 {
            let cell = Arc::clone(&cell);
            handles.push(std::thread::spawn(move || {
                for i in 0..1000u64 {
                    cell.advance(Offset(t * 1000 + i));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cell.load(), Offset(7999));
    }
}
