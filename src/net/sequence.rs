//! Wrapping 16-bit sequence numbers
//!
//! Packet sequences, reliable message ids and command sequences all wrap at
//! u16::MAX. Ordering uses a half-range window: `a` is newer than `b` when it
//! lies less than 32768 steps ahead of it.

/// Wrapping sequence number
pub type Sequence = u16;

const HALF_RANGE: u16 = 1 << 15;

/// `s1` is strictly newer than `s2`
///
/// `sequence_greater_than(2, 1)` and `sequence_greater_than(0, 65535)` hold;
/// `sequence_greater_than(1, 1)` does not.
#[inline]
pub fn sequence_greater_than(s1: Sequence, s2: Sequence) -> bool {
    ((s1 > s2) && (s1 - s2 <= HALF_RANGE)) || ((s1 < s2) && (s2 - s1 > HALF_RANGE))
}

/// Signed distance from `from` forward to `to`
#[inline]
pub fn sequence_diff(from: Sequence, to: Sequence) -> i16 {
    to.wrapping_sub(from) as i16
}
