use std::collections::{BTreeMap, HashMap};

use alloy_primitives::{Address, FixedBytes};
use serde::{Deserialize, Serialize};

use crate::{Stake, ValidatorId};

/// Compressed BLS12-381 G1 public key.
pub type BlsPublicKeyBytes = FixedBytes<48>;

/// Everything the network knows about a validator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorProfile {
    pub id: ValidatorId,
    /// Address of the secp256k1 key that signs events.
    pub address: Address,
    pub weight: Stake,
    pub bls_key: BlsPublicKeyBytes,
}

/// Stake-weighted validator set of one epoch.
///
/// Validators are kept sorted by id; positions in that order are the dense
/// indices used by the vector clock and by certificate signer bitsets.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<(ValidatorId, Stake)>", into = "Vec<(ValidatorId, Stake)>")]
pub struct Validators {
    entries: Vec<(ValidatorId, Stake)>,
    index: HashMap<ValidatorId, usize>,
    total: Stake,
}

impl Validators {
    /// Builds a set from `(id, stake)` pairs. Zero-stake entries are dropped and
    /// a repeated id keeps its last stake.
    pub fn new(stakes: impl IntoIterator<Item = (ValidatorId, Stake)>) -> Self {
        let entries: Vec<_> = stakes
            .into_iter()
            .collect::<BTreeMap<_, _>>()
            .into_iter()
            .filter(|(_, stake)| *stake > 0)
            .collect();
        let index = entries
            .iter()
            .enumerate()
            .map(|(idx, (id, _))| (*id, idx))
            .collect();
        let total = entries.iter().map(|(_, stake)| stake).sum();
        Self {
            entries,
            index,
            total,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: ValidatorId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn index_of(&self, id: ValidatorId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    pub fn id_at(&self, idx: usize) -> Option<ValidatorId> {
        self.entries.get(idx).map(|(id, _)| *id)
    }

    pub fn stake(&self, id: ValidatorId) -> Stake {
        self.index_of(id).map_or(0, |idx| self.entries[idx].1)
    }

    pub fn stake_at(&self, idx: usize) -> Stake {
        self.entries.get(idx).map_or(0, |(_, stake)| *stake)
    }

    pub const fn total_stake(&self) -> Stake {
        self.total
    }

    /// Smallest stake strictly above two thirds of the total.
    pub const fn quorum(&self) -> Stake {
        self.total * 2 / 3 + 1
    }

    pub fn iter(&self) -> impl Iterator<Item = (ValidatorId, Stake)> + '_ {
        self.entries.iter().copied()
    }

    pub fn ids(&self) -> impl Iterator<Item = ValidatorId> + '_ {
        self.entries.iter().map(|(id, _)| *id)
    }

    /// Ids ordered by stake descending, then id ascending.
    pub fn by_stake(&self) -> Vec<ValidatorId> {
        let mut sorted = self.entries.clone();
        sorted.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        sorted.into_iter().map(|(id, _)| id).collect()
    }
}

impl From<Vec<(ValidatorId, Stake)>> for Validators {
    fn from(value: Vec<(ValidatorId, Stake)>) -> Self {
        Self::new(value)
    }
}

impl From<Validators> for Vec<(ValidatorId, Stake)> {
    fn from(value: Validators) -> Self {
        value.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_follow_id_order_and_zero_stake_is_dropped() {
        let validators = Validators::new([(7, 10), (2, 30), (5, 0), (3, 30)]);
        assert_eq!(validators.len(), 3);
        assert_eq!(validators.ids().collect::<Vec<_>>(), vec![2, 3, 7]);
        assert_eq!(validators.index_of(7), Some(2));
        assert!(!validators.contains(5));
        assert_eq!(validators.total_stake(), 70);
        assert_eq!(validators.quorum(), 47);
        assert_eq!(validators.by_stake(), vec![2, 3, 7]);
    }

    #[test]
    fn serde_uses_pairs() {
        let validators = Validators::new([(1, 5), (2, 6)]);
        let json = serde_json::to_string(&validators).unwrap();
        assert_eq!(json, "[[1,5],[2,6]]");
        let back: Validators = serde_json::from_str(&json).unwrap();
        assert_eq!(back, validators);
    }
}
