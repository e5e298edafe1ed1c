//! Key kinds and the monotonic rank transform shared by every kernel.

use serde::{Deserialize, Serialize};

const SIGN_BIT: u32 = 0x8000_0000;

/// Bit interpretation of the 32-bit key words
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyKind {
    /// Unsigned integer
    Uint,
    /// IEEE-754 single precision float
    Float,
}

/// Key interpretation plus sort direction, as passed to the kernels
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct KeyOrder {
    /// How key words are read
    pub kind:      KeyKind,
    /// Smallest rank first when `true`
    pub ascending: bool,
}

impl KeyOrder {
    /// New order
    pub fn new(kind: KeyKind, ascending: bool) -> Self {
        Self { kind, ascending }
    }

    /// Maps a key word to an unsigned rank whose natural order is the requested order.
    ///
    /// Floats get their sign bit flipped, negatives also get the remaining bits
    /// inverted, so that `-inf < -1 < -0 <= 0 < 1 < inf` holds on the ranks.
    /// Descending order inverts the whole rank.
    #[inline]
    pub fn rank(&self, bits: u32) -> u32 {
        let r = match self.kind {
            KeyKind::Uint => bits,
            KeyKind::Float => {
                if bits & SIGN_BIT != 0 {
                    !bits
                } else {
                    bits | SIGN_BIT
                }
            }
        };
        if self.ascending { r } else { !r }
    }

    /// Radix digit of the rank at bit offset `shift`.
    #[inline]
    pub fn digit(&self, bits: u32, shift: u32, mask: u32) -> usize {
        ((self.rank(bits) >> shift) & mask) as usize
    }
}

/// Scalar types usable as co-sort keys
pub trait SortKey: Copy + PartialOrd + Send + Sync + 'static {
    /// Bit interpretation on the device
    const KIND: KeyKind;
    /// Smallest value
    const LOWEST: Self;
    /// Largest value
    const HIGHEST: Self;

    /// Raw bit pattern uploaded to the device
    fn to_bits(self) -> u32;
    /// Inverse of [`SortKey::to_bits`]
    fn from_bits(bits: u32) -> Self;

    /// Key that sorts in front of every other key under `ascending`.
    fn leading(ascending: bool) -> Self {
        if ascending { Self::LOWEST } else { Self::HIGHEST }
    }
}

impl SortKey for u32 {
    const KIND: KeyKind = KeyKind::Uint;
    const LOWEST: Self = u32::MIN;
    const HIGHEST: Self = u32::MAX;

    fn to_bits(self) -> u32 {
        self
    }
    fn from_bits(bits: u32) -> Self {
        bits
    }
}

impl SortKey for f32 {
    const KIND: KeyKind = KeyKind::Float;
    const LOWEST: Self = f32::NEG_INFINITY;
    const HIGHEST: Self = f32::INFINITY;

    fn to_bits(self) -> u32 {
        f32::to_bits(self)
    }
    fn from_bits(bits: u32) -> Self {
        f32::from_bits(bits)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    fn ranked<K: SortKey>(keys: &[K], ascending: bool) -> Vec<K> {
        let order = KeyOrder::new(K::KIND, ascending);
        let mut out = keys.to_vec();
        out.sort_by_key(|k| order.rank(k.to_bits()));
        out
    }

    #[test]
    fn test_float_rank_is_monotonic() {
        let keys = [3.5f32, -0.25, f32::INFINITY, 0.0, -7.0, f32::NEG_INFINITY, 1.0, -1.0];
        assert_eq!(
            ranked(&keys, true),
            vec![f32::NEG_INFINITY, -7.0, -1.0, -0.25, 0.0, 1.0, 3.5, f32::INFINITY]
        );
        assert_eq!(
            ranked(&keys, false),
            vec![f32::INFINITY, 3.5, 1.0, 0.0, -0.25, -1.0, -7.0, f32::NEG_INFINITY]
        );
    }

    #[test]
    fn test_uint_rank() {
        let keys = [7u32, 0, u32::MAX, 3];
        assert_eq!(ranked(&keys, true), vec![0, 3, 7, u32::MAX]);
        assert_eq!(ranked(&keys, false), vec![u32::MAX, 7, 3, 0]);
    }

    #[test]
    fn test_leading_key_ranks_first() {
        for ascending in [true, false] {
            let order = KeyOrder::new(KeyKind::Float, ascending);
            let lead = order.rank(f32::leading(ascending).to_bits());
            assert!([-3.0f32, 0.0, 1e30].iter().all(|k| order.rank(k.to_bits()) >= lead));
        }
    }
}
