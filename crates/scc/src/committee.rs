use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sonic_primitives::{Stake, ValidatorId, ValidatorProfile};

use crate::{BlsError, BlsPublicKey};

/// A signing seat in a committee.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub validator: ValidatorId,
    pub key: BlsPublicKey,
    pub weight: Stake,
}

/// The BLS committee of an epoch, ordered by validator id. A member's position
/// is its index in certificate signer bitsets.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Member>", into = "Vec<Member>")]
pub struct Committee {
    members: Vec<Member>,
}

impl Committee {
    pub fn new(members: impl IntoIterator<Item = Member>) -> Self {
        let members = members
            .into_iter()
            .filter(|member| member.weight > 0)
            .map(|member| (member.validator, member))
            .collect::<BTreeMap<_, _>>()
            .into_values()
            .collect();
        Self { members }
    }

    pub fn from_profiles<'a>(
        profiles: impl IntoIterator<Item = &'a ValidatorProfile>,
    ) -> Result<Self, BlsError> {
        let members = profiles
            .into_iter()
            .map(|profile| {
                Ok(Member {
                    validator: profile.id,
                    key: BlsPublicKey::try_from(&profile.bls_key)?,
                    weight: profile.weight,
                })
            })
            .collect::<Result<Vec<_>, BlsError>>()?;
        Ok(Self::new(members))
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn member(&self, idx: usize) -> Option<&Member> {
        self.members.get(idx)
    }

    pub fn index_of(&self, validator: ValidatorId) -> Option<usize> {
        self.members
            .binary_search_by_key(&validator, |member| member.validator)
            .ok()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn total_weight(&self) -> Stake {
        self.members.iter().map(|member| member.weight).sum()
    }

    /// Smallest weight strictly above two thirds of the total.
    pub fn quorum(&self) -> Stake {
        self.total_weight() * 2 / 3 + 1
    }
}

impl From<Vec<Member>> for Committee {
    fn from(value: Vec<Member>) -> Self {
        Self::new(value)
    }
}

impl From<Committee> for Vec<Member> {
    fn from(value: Committee) -> Self {
        value.members
    }
}
