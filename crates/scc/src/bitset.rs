use alloy_primitives::Bytes;
use serde::{Deserialize, Serialize};

/// Set of committee member indices, packed little-endian into bytes.
///
/// Trailing zero bytes are trimmed, so every set has exactly one encoding and
/// equality of sets is equality of bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Bytes", into = "Bytes")]
pub struct BitSet(Bytes);

impl From<Bytes> for BitSet {
    fn from(bytes: Bytes) -> Self {
        let used = bytes.iter().rposition(|byte| *byte != 0).map_or(0, |last| last + 1);
        Self(bytes.slice(..used).into())
    }
}

impl From<BitSet> for Bytes {
    fn from(set: BitSet) -> Self {
        set.0
    }
}

impl BitSet {
    pub fn insert(&mut self, idx: usize) {
        let byte = idx / 8;
        let mut bits = self.0.to_vec();
        if bits.len() <= byte {
            bits.resize(byte + 1, 0);
        }
        bits[byte] |= 1 << (idx % 8);
        self.0 = bits.into();
    }

    pub fn contains(&self, idx: usize) -> bool {
        self.0
            .get(idx / 8)
            .is_some_and(|byte| byte & (1 << (idx % 8)) != 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().enumerate().flat_map(|(byte_idx, byte)| {
            (0..8)
                .filter(move |bit| byte & (1 << bit) != 0)
                .map(move |bit| byte_idx * 8 + bit)
        })
    }

    pub fn len(&self) -> usize {
        self.0.iter().map(|byte| byte.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FromIterator<usize> for BitSet {
    fn from_iter<T: IntoIterator<Item = usize>>(iter: T) -> Self {
        let mut set = Self::default();
        for idx in iter {
            set.insert(idx);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_indices() {
        let set: BitSet = [0, 3, 9].into_iter().collect();
        assert!(set.contains(9));
        assert!(!set.contains(8));
        assert!(!set.contains(100));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 3, 9]);
        assert_eq!(set.len(), 3);
        assert_eq!(serde_json::to_string(&set).unwrap(), "\"0x0902\"");
    }

    #[test]
    fn padded_encodings_decode_to_the_same_set() {
        let set: BitSet = [0, 3, 9].into_iter().collect();
        let padded: BitSet = serde_json::from_str("\"0x09020000\"").unwrap();
        assert_eq!(padded, set);
        assert_eq!(serde_json::to_string(&padded).unwrap(), "\"0x0902\"");

        let empty: BitSet = serde_json::from_str("\"0x0000\"").unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty, BitSet::default());
    }
}
