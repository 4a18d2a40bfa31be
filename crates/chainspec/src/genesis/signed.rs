use std::{borrow::Cow, path::Path};

use alloy_primitives::{Address, Signature, U256};
use alloy_signer::SignerSync;
use alloy_sol_types::{Eip712Domain, SolStruct, sol};
use serde::{Deserialize, Serialize};

use super::{Genesis, GenesisError};

sol! {
    /// Typed data signed by the genesis authority.
    #[derive(Debug, PartialEq, Eq)]
    struct GenesisSections {
        bytes32 header;
        bytes32 rules;
        bytes32 validators;
        bytes32 accounts;
    }
}

fn domain(chain_id: u64) -> Eip712Domain {
    Eip712Domain::new(
        Some(Cow::Borrowed("Sonic Genesis")),
        Some(Cow::Borrowed("1")),
        Some(U256::from(chain_id)),
        None,
        None,
    )
}

/// A JSON genesis together with the trusted key's signature over it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedGenesis {
    pub genesis: Genesis,
    pub signature: Signature,
}

impl SignedGenesis {
    pub fn sign(genesis: Genesis, signer: &impl SignerSync) -> Result<Self, GenesisError> {
        let hash = genesis
            .section_hashes()?
            .eip712_signing_hash(&domain(genesis.rules.network_id));
        let signature = signer.sign_hash_sync(&hash)?;
        Ok(Self { genesis, signature })
    }

    /// Checks the signature against `trusted` and the genesis contents; returns
    /// the genesis if both hold.
    pub fn verify(self, trusted: Address) -> Result<Genesis, GenesisError> {
        let hash = self
            .genesis
            .section_hashes()?
            .eip712_signing_hash(&domain(self.genesis.rules.network_id));
        let signer = self.signature.recover_address_from_prehash(&hash)?;
        if signer != trusted {
            return Err(GenesisError::UntrustedSigner {
                expected: trusted,
                got: signer,
            });
        }
        self.genesis.validate()?;
        Ok(self.genesis)
    }

    pub fn read(path: &Path) -> Result<Self, GenesisError> {
        let bytes = std::fs::read(path).map_err(|source| GenesisError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn write(&self, path: &Path) -> Result<(), GenesisError> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json).map_err(|source| GenesisError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
