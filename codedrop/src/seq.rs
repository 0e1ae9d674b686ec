//! Sequence numbering.

use std::{
    fmt,
    ops::{Add, AddAssign, Sub},
};

/// A 32-bit chunk sequence number, dense from zero within a transfer.
///
/// Sequence numbers never wrap: the AEAD nonce of a chunk is derived from
/// its sequence number, so reuse within a transfer would be catastrophic.
/// Arithmetic that would exceed [`Seq::MAX`] is reported as
/// [`SeqExhausted`] instead of wrapping.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Seq(pub u32);

impl Seq {
    /// Zero.
    pub const ZERO: Self = Self(0);

    /// Highest usable sequence number.
    pub const MAX: Self = Self(u32::MAX);

    /// The sequence number following this one.
    pub fn checked_next(self) -> Result<Self, SeqExhausted> {
        self.0.checked_add(1).map(Self).ok_or(SeqExhausted)
    }

    /// Number of sequence steps from `base` up to (and excluding) this one.
    ///
    /// `base` must not exceed `self`.
    pub fn since(self, base: Self) -> u32 {
        debug_assert!(base <= self);
        self.0.saturating_sub(base.0)
    }
}

/// The sequence number space of a transfer is exhausted.
///
/// A single transfer is limited to 2³² chunks; at the default chunk size
/// this is roughly one pebibyte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqExhausted;

impl fmt::Display for SeqExhausted {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "sequence number space exhausted")
    }
}

impl std::error::Error for SeqExhausted {}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Seq {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl From<Seq> for u32 {
    fn from(v: Seq) -> Self {
        v.0
    }
}

impl Add<u32> for Seq {
    type Output = Self;
    fn add(self, rhs: u32) -> Self::Output {
        Self(self.0.saturating_add(rhs))
    }
}

impl AddAssign<u32> for Seq {
    fn add_assign(&mut self, rhs: u32) {
        *self = *self + rhs;
    }
}

impl Sub<Seq> for Seq {
    type Output = u32;
    fn sub(self, rhs: Seq) -> Self::Output {
        self.since(rhs)
    }
}
