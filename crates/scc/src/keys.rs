//! BLS12-381 keys in the "minimal public key" variant: public keys on G1
//! (48 bytes compressed), signatures on G2 (96 bytes compressed).

use std::fmt;

use alloy_primitives::FixedBytes;
use blst::{
    BLST_ERROR,
    min_pk::{AggregatePublicKey, AggregateSignature, PublicKey, SecretKey, Signature},
};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sonic_primitives::BlsPublicKeyBytes;

/// Domain separation tag for certificate signatures.
pub const DST: &[u8] = b"SONIC_SCC_BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";

pub const PUBLIC_KEY_LEN: usize = 48;
pub const SIGNATURE_LEN: usize = 96;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("bls operation failed: {0:?}")]
pub struct BlsError(pub BLST_ERROR);

fn check(err: BLST_ERROR) -> Result<(), BlsError> {
    match err {
        BLST_ERROR::BLST_SUCCESS => Ok(()),
        other => Err(BlsError(other)),
    }
}

pub struct BlsSecretKey(SecretKey);

impl BlsSecretKey {
    /// Derives a key from at least 32 bytes of input keying material.
    pub fn from_seed(ikm: &[u8]) -> Result<Self, BlsError> {
        SecretKey::key_gen(ikm, &[]).map(Self).map_err(BlsError)
    }

    pub fn random(rng: &mut impl RngCore) -> Self {
        let mut ikm = [0u8; 32];
        loop {
            rng.fill_bytes(&mut ikm);
            if let Ok(key) = Self::from_seed(&ikm) {
                return key;
            }
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlsError> {
        SecretKey::from_bytes(bytes).map(Self).map_err(BlsError)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn public_key(&self) -> BlsPublicKey {
        BlsPublicKey(self.0.sk_to_pk())
    }

    pub fn sign(&self, message: &[u8]) -> BlsSignature {
        BlsSignature(self.0.sign(message, DST, &[]))
    }
}

impl fmt::Debug for BlsSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BlsSecretKey").field(&"<redacted>").finish()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BlsPublicKey(PublicKey);

impl BlsPublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlsError> {
        let key = PublicKey::uncompress(bytes).map_err(BlsError)?;
        key.validate().map_err(BlsError)?;
        Ok(Self(key))
    }

    pub fn to_bytes(&self) -> BlsPublicKeyBytes {
        FixedBytes(self.0.compress())
    }

    /// Sums `keys` into a single key that verifies the aggregate of their signatures.
    pub fn aggregate<'a>(keys: impl IntoIterator<Item = &'a Self>) -> Result<Self, BlsError> {
        let keys: Vec<&PublicKey> = keys.into_iter().map(|key| &key.0).collect();
        if keys.is_empty() {
            return Err(BlsError(BLST_ERROR::BLST_AGGR_TYPE_MISMATCH));
        }
        let aggregate = AggregatePublicKey::aggregate(&keys, false).map_err(BlsError)?;
        Ok(Self(aggregate.to_public_key()))
    }
}

impl TryFrom<&BlsPublicKeyBytes> for BlsPublicKey {
    type Error = BlsError;

    fn try_from(value: &BlsPublicKeyBytes) -> Result<Self, Self::Error> {
        Self::from_bytes(value.as_slice())
    }
}

impl fmt::Debug for BlsPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlsPublicKey({})", self.to_bytes())
    }
}

impl Serialize for BlsPublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_bytes().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for BlsPublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = BlsPublicKeyBytes::deserialize(deserializer)?;
        Self::try_from(&bytes).map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BlsSignature(Signature);

impl BlsSignature {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlsError> {
        Signature::uncompress(bytes).map(Self).map_err(BlsError)
    }

    pub fn to_bytes(&self) -> FixedBytes<SIGNATURE_LEN> {
        FixedBytes(self.0.compress())
    }

    pub fn verify(&self, message: &[u8], key: &BlsPublicKey) -> Result<(), BlsError> {
        check(self.0.verify(true, message, DST, &[], &key.0, true))
    }

    pub fn aggregate<'a>(signatures: impl IntoIterator<Item = &'a Self>) -> Result<Self, BlsError> {
        let signatures: Vec<&Signature> = signatures.into_iter().map(|sig| &sig.0).collect();
        if signatures.is_empty() {
            return Err(BlsError(BLST_ERROR::BLST_AGGR_TYPE_MISMATCH));
        }
        let aggregate = AggregateSignature::aggregate(&signatures, true).map_err(BlsError)?;
        Ok(Self(aggregate.to_signature()))
    }
}

impl fmt::Debug for BlsSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlsSignature({})", self.to_bytes())
    }
}

impl Serialize for BlsSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_bytes().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for BlsSignature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = FixedBytes::<SIGNATURE_LEN>::deserialize(deserializer)?;
        Self::from_bytes(bytes.as_slice()).map_err(serde::de::Error::custom)
    }
}
