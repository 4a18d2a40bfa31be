//! Genesis: the rules, validators and funded accounts a network starts from.
//!
//! Two shapes exist. A [`fake`] genesis is derived from a validator count and
//! an upgrade set with deterministic keys, for local networks and tests. A
//! [`SignedGenesis`] is a JSON file signed by a trusted key with EIP-712 typed
//! data over the hashes of its sections.

use std::collections::HashSet;

use alloy_primitives::{Address, B256, U256, keccak256};
use serde::{Deserialize, Serialize};
use sonic_primitives::{Timestamp, ValidatorId, ValidatorProfile, Validators};
use sonic_scc::{BlsError, BlsPublicKey, Committee, Member};

use crate::{Rules, RulesError};

pub mod fake;
pub use fake::{FAKE_NETWORK_ID, FakeGenesis};

mod signed;
pub use signed::{GenesisSections, SignedGenesis};

#[derive(Debug, thiserror::Error)]
pub enum GenesisError {
    #[error("failed reading genesis file `{path}`")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed (de)serializing genesis")]
    Json(#[from] serde_json::Error),
    #[error("genesis rules are invalid")]
    Rules(#[from] RulesError),
    #[error("genesis has no validators")]
    NoValidators,
    #[error("validator `{0}` is listed more than once")]
    DuplicateValidator(ValidatorId),
    #[error("validator `{0}` has zero weight")]
    ZeroWeight(ValidatorId),
    #[error("account `{0}` is listed more than once")]
    DuplicateAccount(Address),
    #[error("validator `{id}` has an invalid BLS key")]
    BlsKey {
        id: ValidatorId,
        #[source]
        source: BlsError,
    },
    #[error("invalid fake genesis description `{0}`")]
    FakeSpec(String),
    #[error("failed deriving a key")]
    Key(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("failed signing genesis")]
    Signing(#[from] alloy_signer::Error),
    #[error("genesis signature is malformed")]
    BadSignature(#[from] alloy_primitives::SignatureError),
    #[error("genesis is signed by `{got}`, expected the trusted key `{expected}`")]
    UntrustedSigner { expected: Address, got: Address },
}

/// A funded account at genesis.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenesisAccount {
    pub address: Address,
    pub balance: U256,
    #[serde(default)]
    pub nonce: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Genesis {
    /// Timestamp of block 0.
    pub time: Timestamp,
    /// The only sender allowed to call the driver contract.
    pub driver_owner: Address,
    pub rules: Rules,
    pub validators: Vec<ValidatorProfile>,
    pub accounts: Vec<GenesisAccount>,
}

impl Genesis {
    pub fn validate(&self) -> Result<(), GenesisError> {
        self.rules.validate()?;
        if self.validators.is_empty() {
            return Err(GenesisError::NoValidators);
        }
        let mut ids = HashSet::new();
        for validator in &self.validators {
            if !ids.insert(validator.id) {
                return Err(GenesisError::DuplicateValidator(validator.id));
            }
            if validator.weight == 0 {
                return Err(GenesisError::ZeroWeight(validator.id));
            }
        }
        self.committee()?;
        let mut addresses = HashSet::new();
        for account in &self.accounts {
            if !addresses.insert(account.address) {
                return Err(GenesisError::DuplicateAccount(account.address));
            }
        }
        Ok(())
    }

    pub fn validator_set(&self) -> Validators {
        Validators::new(self.validators.iter().map(|v| (v.id, v.weight)))
    }

    pub fn committee(&self) -> Result<Committee, GenesisError> {
        let members = self
            .validators
            .iter()
            .map(|validator| {
                Ok(Member {
                    validator: validator.id,
                    key: BlsPublicKey::try_from(&validator.bls_key).map_err(|source| {
                        GenesisError::BlsKey {
                            id: validator.id,
                            source,
                        }
                    })?,
                    weight: validator.weight,
                })
            })
            .collect::<Result<Vec<_>, GenesisError>>()?;
        Ok(Committee::new(members))
    }

    /// Hashes of the header, rules, validators and accounts sections.
    pub fn section_hashes(&self) -> Result<GenesisSections, GenesisError> {
        Ok(GenesisSections {
            header: section_hash(&(self.time, self.driver_owner))?,
            rules: section_hash(&self.rules)?,
            validators: section_hash(&self.validators)?,
            accounts: section_hash(&self.accounts)?,
        })
    }

    /// Identity of this genesis: the hash over all section hashes.
    pub fn hash(&self) -> Result<B256, GenesisError> {
        let sections = self.section_hashes()?;
        Ok(keccak256(
            [
                sections.header,
                sections.rules,
                sections.validators,
                sections.accounts,
            ]
            .concat(),
        ))
    }
}

fn section_hash<T: Serialize>(section: &T) -> Result<B256, GenesisError> {
    Ok(keccak256(serde_json::to_vec(section)?))
}
