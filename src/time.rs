//! Bag timestamps.
//!
//! A bag timestamp is a `(sec, nsec)` pair. On disk, header `time` fields
//! carry it packed into a u64 as `(nsec << 32) | sec`; the raw index data
//! stores the two halves separately.

use std::fmt;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time {
    pub sec: u32,
    pub nsec: u32,
}

impl Time {
    pub const ZERO: Time = Time { sec: 0, nsec: 0 };
    pub const MAX: Time = Time {
        sec: u32::MAX,
        nsec: u32::MAX,
    };

    pub fn new(sec: u32, nsec: u32) -> Self {
        Self { sec, nsec }
    }

    /// Packs into the header-field representation.
    pub fn pack(self) -> u64 {
        ((self.nsec as u64) << 32) | self.sec as u64
    }

    /// Inverse of [`Time::pack`].
    pub fn unpack(raw: u64) -> Self {
        Self {
            sec: raw as u32,
            nsec: (raw >> 32) as u32,
        }
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}
