//! Log Sequence Number (LSN): a 64-bit byte position in the WAL.

use std::fmt;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Transaction log position. Totally ordered; the difference between two
/// positions is a byte distance. The canonical textual form is two hex
/// halves separated by a slash, e.g. `1/16B3748`.
#[derive(
    Debug, Clone, Copy, Default, Eq, Ord, PartialEq, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const MAX: Lsn = Lsn(u64::MAX);
    pub const INVALID: Lsn = Lsn(0);

    pub fn is_valid(self) -> bool {
        self != Lsn::INVALID
    }

    /// Subtract a number, returning None on overflow.
    pub fn checked_sub<T: Into<u64>>(self, other: T) -> Option<Lsn> {
        self.0.checked_sub(other.into()).map(Lsn)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid textual LSN, expected <hi>/<lo> in hex")]
pub struct ParseLsnError;

impl FromStr for Lsn {
    type Err = ParseLsnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s.split_once('/').ok_or(ParseLsnError)?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| ParseLsnError)?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| ParseLsnError)?;
        Ok(Lsn(((hi as u64) << 32) | lo as u64))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xffff_ffff)
    }
}

impl From<u64> for Lsn {
    fn from(n: u64) -> Self {
        Lsn(n)
    }
}

impl From<Lsn> for u64 {
    fn from(lsn: Lsn) -> u64 {
        lsn.0
    }
}

impl Add<u64> for Lsn {
    type Output = Lsn;

    fn add(self, other: u64) -> Self::Output {
        // panic on overflow, like the underlying integer addition
        Lsn(self.0.checked_add(other).expect("Lsn addition overflowed"))
    }
}

impl AddAssign<u64> for Lsn {
    fn add_assign(&mut self, other: u64) {
        *self = *self + other;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_canonical_form() {
        assert_eq!("0/16B3748".parse(), Ok(Lsn(0x16B3748)));
        assert_eq!("1/16B3748".parse(), Ok(Lsn(0x1_16B3748)));
        assert_eq!("FFFFFFFF/FFFFFFFF".parse(), Ok(Lsn(u64::MAX)));
        assert_eq!("0/0".parse(), Ok(Lsn::INVALID));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(Lsn::from_str("16B3748"), Err(ParseLsnError));
        assert_eq!(Lsn::from_str("0/xyz"), Err(ParseLsnError));
        assert_eq!(Lsn::from_str("0/1/2"), Err(ParseLsnError));
        assert_eq!(Lsn::from_str(""), Err(ParseLsnError));
    }

    #[test]
    fn display_roundtrip() {
        for lsn in [Lsn(0), Lsn(42), Lsn(0x16B3748), Lsn(0x1_16B3748), Lsn::MAX] {
            assert_eq!(lsn.to_string().parse(), Ok(lsn));
        }
    }

    #[test]
    fn ordering_is_numeric() {
        assert!(Lsn(0x1_0000_0000) > Lsn(0xFFFF_FFFF));
        assert!(Lsn::INVALID < Lsn(1));
    }

    #[test]
    fn arithmetic() {
        assert_eq!(Lsn(10) + 5, Lsn(15));
        assert_eq!(Lsn(10).checked_sub(4u64), Some(Lsn(6)));
        assert_eq!(Lsn(10).checked_sub(11u64), None);
        let mut lsn = Lsn(1);
        lsn += 2;
        assert_eq!(lsn, Lsn(3));
    }

    #[test]
    fn serde_transparent() {
        let lsn = Lsn(0x16B3748);
        assert_eq!(serde_json::to_string(&lsn).unwrap(), "23803720");
    }
}
