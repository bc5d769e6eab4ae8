//! See [`PacketNumber`].

use std::{
    cmp::Ordering,
    ops::{Add, AddAssign, Sub, SubAssign},
};

use bytes::{Buf, BufMut};

/// A monotonically increasing packet number, one space for sends and one for
/// receives (spec.md §3, "Packet number").
///
/// Stored as a [`u32`], wrapping on overflow. Comparisons take wraparound into
/// account the same way [`Seq`] does in the teacher crate, so that a session
/// which outlives `u32::MAX` packets (vanishingly unlikely, but cheap to get
/// right) still orders correctly.
///
/// [`Seq`]: https://docs.rs/aeronet_proto (teacher's `seq::Seq`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PacketNumber(pub u32);

impl PacketNumber {
    /// The first packet number of a fresh send or receive space.
    pub const ZERO: Self = Self(0);

    /// Distance from `self` to `rhs`, signed, taking wraparound into account.
    #[must_use]
    pub const fn dist_to(self, rhs: Self) -> i64 {
        (rhs.0.wrapping_sub(self.0) as i32) as i64
    }

    /// Reads this value from the front of `buf` as a little-endian `u32`.
    pub fn read(buf: &mut impl Buf) -> Self {
        Self(buf.get_u32_le())
    }

    /// Writes this value to the end of `buf` as a little-endian `u32`.
    pub fn write(self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.0);
    }
}

impl Ord for PacketNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.0 as i32).wrapping_sub(other.0 as i32).cmp(&0)
    }
}

impl PartialOrd for PacketNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Add<u32> for PacketNumber {
    type Output = Self;

    fn add(self, rhs: u32) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u32> for PacketNumber {
    fn add_assign(&mut self, rhs: u32) {
        *self = *self + rhs;
    }
}

impl Sub<PacketNumber> for PacketNumber {
    type Output = i64;

    /// Signed distance `self - rhs`, used to index into `send_records` (spec.md
    /// §4.4, "locate the corresponding SendRecord by index").
    fn sub(self, rhs: PacketNumber) -> i64 {
        rhs.dist_to(self)
    }
}

impl Sub<u32> for PacketNumber {
    type Output = Self;

    fn sub(self, rhs: u32) -> Self::Output {
        Self(self.0.wrapping_sub(rhs))
    }
}

impl SubAssign<u32> for PacketNumber {
    fn sub_assign(&mut self, rhs: u32) {
        *self = *self - rhs;
    }
}
