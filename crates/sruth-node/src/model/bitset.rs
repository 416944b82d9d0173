//! `FiniteBitSet`: a compact, serializable "which pieces" bitmap with a
//! complete/partial distinction. Used both on the wire (inside a
//! `PieceSpec`) and as the trailing bytes of a hidden `DiskFile`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FiniteBitSet {
    /// All `len` bits are conceptually set; no explicit bitmap is stored.
    Complete(u32),
    /// Explicit bitmap over `len` bits, one bit per piece, LSB-first per byte.
    Partial { len: u32, bits: Vec<u8> },
}

impl FiniteBitSet {
    pub fn empty(len: u32) -> Self {
        if len == 0 {
            return Self::Complete(0);
        }
        Self::Partial {
            len,
            bits: vec![0u8; len.div_ceil(8) as usize],
        }
    }

    pub fn len(&self) -> u32 {
        match self {
            Self::Complete(len) => *len,
            Self::Partial { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_set(&self, i: u32) -> bool {
        if i >= self.len() {
            return false;
        }
        match self {
            Self::Complete(_) => true,
            Self::Partial { bits, .. } => {
                let byte = bits[(i / 8) as usize];
                (byte >> (i % 8)) & 1 == 1
            }
        }
    }

    pub fn are_all_set(&self) -> bool {
        match self {
            Self::Complete(_) => true,
            Self::Partial { len, bits } => (0..*len).all(|i| {
                let byte = bits[(i / 8) as usize];
                (byte >> (i % 8)) & 1 == 1
            }),
        }
    }

    /// Returns a new bitset with bit `i` set, promoting to `Complete` when
    /// every bit ends up set.
    pub fn set_bit(&self, i: u32) -> Self {
        match self {
            Self::Complete(len) => Self::Complete(*len),
            Self::Partial { len, bits } => {
                if i >= *len {
                    return Self::Partial {
                        len: *len,
                        bits: bits.clone(),
                    };
                }
                let mut bits = bits.clone();
                bits[(i / 8) as usize] |= 1 << (i % 8);
                let candidate = Self::Partial { len: *len, bits };
                if candidate.are_all_set() {
                    Self::Complete(*len)
                } else {
                    candidate
                }
            }
        }
    }

    pub fn iter_set(&self) -> impl Iterator<Item = u32> + '_ {
        let len = self.len();
        (0..len).filter(move |i| self.is_set(*i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bincode() {
        let bs = FiniteBitSet::empty(19).set_bit(3).set_bit(17);
        let encoded = bincode::serde::encode_to_vec(&bs, bincode::config::standard()).unwrap();
        let (decoded, _): (FiniteBitSet, usize) =
            bincode::serde::decode_from_slice(&encoded, bincode::config::standard()).unwrap();
        assert_eq!(bs, decoded);
    }

    #[test]
    fn promotes_to_complete_exactly_when_all_set() {
        let mut bs = FiniteBitSet::empty(3);
        assert!(!bs.are_all_set());
        bs = bs.set_bit(0);
        bs = bs.set_bit(1);
        assert!(matches!(bs, FiniteBitSet::Partial { .. }));
        bs = bs.set_bit(2);
        assert!(matches!(bs, FiniteBitSet::Complete(3)));
        assert!(bs.are_all_set());
    }

    #[test]
    fn complete_reports_every_bit_set() {
        let bs = FiniteBitSet::Complete(8);
        for i in 0..8 {
            assert!(bs.is_set(i));
        }
        assert!(!bs.is_set(8));
    }
}
