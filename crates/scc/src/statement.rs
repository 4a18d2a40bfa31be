use alloy_primitives::{B256, keccak256};
use serde::{Deserialize, Serialize};
use sonic_primitives::{BlockNumber, Epoch};

use crate::Committee;

/// Something a committee signs.
pub trait Statement: Clone + std::fmt::Debug {
    /// Digest the committee members sign.
    fn signing_hash(&self) -> B256;
}

/// Claim that block `number` with `hash` and `state_root` is final on `chain_id`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockStatement {
    pub chain_id: u64,
    pub number: BlockNumber,
    pub hash: B256,
    pub state_root: B256,
}

impl Statement for BlockStatement {
    fn signing_hash(&self) -> B256 {
        let mut buf = Vec::with_capacity(5 + 8 + 8 + 32 + 32);
        buf.extend_from_slice(b"block");
        buf.extend_from_slice(&self.chain_id.to_be_bytes());
        buf.extend_from_slice(&self.number.to_be_bytes());
        buf.extend_from_slice(self.hash.as_slice());
        buf.extend_from_slice(self.state_root.as_slice());
        keccak256(buf)
    }
}

/// Claim that `committee` signs for `epoch` on `chain_id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitteeStatement {
    pub chain_id: u64,
    pub epoch: Epoch,
    pub committee: Committee,
}

impl Statement for CommitteeStatement {
    fn signing_hash(&self) -> B256 {
        let mut buf = Vec::with_capacity(9 + 8 + 4 + self.committee.len() * (4 + 48 + 8));
        buf.extend_from_slice(b"committee");
        buf.extend_from_slice(&self.chain_id.to_be_bytes());
        buf.extend_from_slice(&self.epoch.to_be_bytes());
        for member in self.committee.members() {
            buf.extend_from_slice(&member.validator.to_be_bytes());
            buf.extend_from_slice(member.key.to_bytes().as_slice());
            buf.extend_from_slice(&member.weight.to_be_bytes());
        }
        keccak256(buf)
    }
}
