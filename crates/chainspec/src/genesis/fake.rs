//! Deterministic genesis for local networks.
//!
//! Validator `n` (1-based) signs events with the secp256k1 key whose scalar is
//! `n`, and holds a BLS key derived from `keccak256("fake-bls" || n)`. The same
//! secp256k1 keys, continued past the validator count, fund extra accounts.

use std::str::FromStr;

use alloy_primitives::{B256, U256, keccak256};
use alloy_signer_local::PrivateKeySigner;
use sonic_primitives::{Timestamp, ValidatorId, ValidatorProfile};
use sonic_scc::BlsSecretKey;

use super::{Genesis, GenesisAccount, GenesisError};
use crate::{Rules, Upgrades};

/// Chain id of fake networks.
pub const FAKE_NETWORK_ID: u64 = 4003;

const FAKE_STAKE: u64 = 1_000_000;

/// secp256k1 key number `n`.
pub fn fake_key(n: u32) -> Result<PrivateKeySigner, GenesisError> {
    let mut scalar = B256::ZERO;
    scalar[28..].copy_from_slice(&n.to_be_bytes());
    PrivateKeySigner::from_bytes(&scalar).map_err(|err| GenesisError::Key(Box::new(err)))
}

/// BLS key of fake validator `n`.
pub fn fake_bls_key(n: ValidatorId) -> Result<BlsSecretKey, GenesisError> {
    let seed = keccak256([b"fake-bls".as_slice(), &n.to_be_bytes()].concat());
    BlsSecretKey::from_seed(seed.as_slice()).map_err(|err| GenesisError::Key(Box::new(err)))
}

/// Description of a fake genesis, parsed from `fake:<validators>[:<upgrades>]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FakeGenesis {
    pub validators: u32,
    pub upgrades: Upgrades,
    /// Funded accounts beyond the validators' own.
    pub extra_accounts: u32,
    pub balance: U256,
    pub time: Timestamp,
}

impl FakeGenesis {
    pub fn new(validators: u32, upgrades: Upgrades) -> Self {
        Self {
            validators,
            upgrades,
            extra_accounts: 10,
            balance: U256::from(1_000_000_000u64) * U256::from(10u64).pow(U256::from(18)),
            time: Timestamp::from_secs(1_700_000_000),
        }
    }

    pub fn build(&self) -> Result<Genesis, GenesisError> {
        self.build_with_rules(Rules::fakenet(FAKE_NETWORK_ID, self.upgrades))
    }

    /// Builds the genesis with custom rules; `upgrades` is ignored in favour of
    /// the flags in `rules`.
    pub fn build_with_rules(&self, rules: Rules) -> Result<Genesis, GenesisError> {
        if self.validators == 0 {
            return Err(GenesisError::NoValidators);
        }
        let validators = (1..=self.validators)
            .map(|id| {
                Ok(ValidatorProfile {
                    id,
                    address: fake_key(id)?.address(),
                    weight: FAKE_STAKE,
                    bls_key: fake_bls_key(id)?.public_key().to_bytes(),
                })
            })
            .collect::<Result<Vec<_>, GenesisError>>()?;
        let accounts = (1..=self.validators + self.extra_accounts)
            .map(|n| {
                Ok(GenesisAccount {
                    address: fake_key(n)?.address(),
                    balance: self.balance,
                    nonce: 0,
                })
            })
            .collect::<Result<Vec<_>, GenesisError>>()?;

        let genesis = Genesis {
            time: self.time,
            driver_owner: fake_key(1)?.address(),
            rules,
            validators,
            accounts,
        };
        genesis.validate()?;
        Ok(genesis)
    }
}

impl FromStr for FakeGenesis {
    type Err = GenesisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || GenesisError::FakeSpec(s.to_string());
        let mut parts = s.split(':');
        if parts.next() != Some("fake") {
            return Err(invalid());
        }
        let validators = parts
            .next()
            .and_then(|n| n.parse().ok())
            .filter(|n| *n > 0)
            .ok_or_else(invalid)?;
        let upgrades = match parts.next() {
            Some(list) => Upgrades::parse_list(list).map_err(|_| invalid())?,
            None => Upgrades::sonic(),
        };
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self::new(validators, upgrades))
    }
}
