use serde::{Deserialize, Serialize};
use sonic_primitives::ValidatorId;

use crate::{BlsPublicKey, BlsSecretKey, BlsSignature, Statement};

/// A single member's signature over a statement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialSignature {
    pub signer: ValidatorId,
    pub signature: BlsSignature,
}

/// Signs statements for the committee seat of one validator.
#[derive(Debug)]
pub struct Signer {
    validator: ValidatorId,
    key: BlsSecretKey,
}

impl Signer {
    pub const fn new(validator: ValidatorId, key: BlsSecretKey) -> Self {
        Self { validator, key }
    }

    pub const fn validator(&self) -> ValidatorId {
        self.validator
    }

    pub fn public_key(&self) -> BlsPublicKey {
        self.key.public_key()
    }

    pub fn sign<S: Statement>(&self, statement: &S) -> PartialSignature {
        PartialSignature {
            signer: self.validator,
            signature: self.key.sign(statement.signing_hash().as_slice()),
        }
    }
}
