use serde::{Deserialize, Serialize};
use sonic_primitives::{Stake, ValidatorId};

use crate::{
    BitSet, BlockStatement, BlsError, BlsPublicKey, BlsSignature, Committee, CommitteeStatement,
    Statement,
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CertificateError {
    #[error("validator `{0}` is not a member of the committee")]
    UnknownSigner(ValidatorId),
    #[error("signer index `{0}` is outside the committee")]
    SignerOutOfRange(usize),
    #[error("signers hold weight `{signed}`, at least `{required}` is required")]
    InsufficientWeight { signed: Stake, required: Stake },
    #[error("signature does not verify")]
    InvalidSignature(#[source] BlsError),
    #[error("failed aggregating signatures")]
    Aggregation(#[source] BlsError),
}

/// BLS signature aggregated over the members marked in `signers`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedSignature {
    pub signers: BitSet,
    pub signature: BlsSignature,
}

/// A statement with an aggregated committee signature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate<S> {
    pub statement: S,
    pub signature: AggregatedSignature,
}

pub type BlockCertificate = Certificate<BlockStatement>;
pub type CommitteeCertificate = Certificate<CommitteeStatement>;

impl<S: Statement> Certificate<S> {
    /// Total committee weight behind this certificate.
    pub fn signer_weight(&self, committee: &Committee) -> Result<Stake, CertificateError> {
        self.signature.signers.iter().try_fold(0, |acc, idx| {
            committee
                .member(idx)
                .map(|member| acc + member.weight)
                .ok_or(CertificateError::SignerOutOfRange(idx))
        })
    }

    /// Checks the certificate against the committee that was supposed to sign it.
    ///
    /// Valid iff every signer is a member, their combined weight is above two
    /// thirds of the committee weight, and the aggregate signature verifies
    /// against the aggregate of their public keys.
    pub fn verify(&self, committee: &Committee) -> Result<(), CertificateError> {
        let signed = self.signer_weight(committee)?;
        let required = committee.quorum();
        if signed < required {
            return Err(CertificateError::InsufficientWeight { signed, required });
        }
        let keys = self
            .signature
            .signers
            .iter()
            .filter_map(|idx| committee.member(idx).map(|member| &member.key));
        let key = BlsPublicKey::aggregate(keys).map_err(CertificateError::Aggregation)?;
        self.signature
            .signature
            .verify(self.statement.signing_hash().as_slice(), &key)
            .map_err(CertificateError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::B256;
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::{BlsSecretKey, Member, Signer};

    fn setup(weights: &[Stake]) -> (Committee, Vec<Signer>) {
        let mut rng = StdRng::seed_from_u64(11);
        let signers: Vec<_> = (1..=weights.len() as u32)
            .map(|id| Signer::new(id, BlsSecretKey::random(&mut rng)))
            .collect();
        let committee = Committee::new(signers.iter().zip(weights).map(|(signer, weight)| Member {
            validator: signer.validator(),
            key: signer.public_key(),
            weight: *weight,
        }));
        (committee, signers)
    }

    fn certify(
        committee: &Committee,
        signers: &[Signer],
        statement: &BlockStatement,
    ) -> BlockCertificate {
        let partials: Vec<_> = signers.iter().map(|s| s.sign(statement)).collect();
        Certificate {
            statement: statement.clone(),
            signature: AggregatedSignature {
                signers: partials
                    .iter()
                    .map(|p| committee.index_of(p.signer).unwrap())
                    .collect(),
                signature: BlsSignature::aggregate(partials.iter().map(|p| &p.signature))
                    .unwrap(),
            },
        }
    }

    fn statement() -> BlockStatement {
        BlockStatement {
            chain_id: 146,
            number: 12,
            hash: B256::repeat_byte(1),
            state_root: B256::repeat_byte(2),
        }
    }

    #[test]
    fn quorum_certificate_verifies() {
        let (committee, signers) = setup(&[10, 10, 10, 10]);
        let certificate = certify(&committee, &signers[..3], &statement());
        assert_eq!(certificate.signer_weight(&committee), Ok(30));
        certificate.verify(&committee).unwrap();

        let json = serde_json::to_string(&certificate).unwrap();
        let back: BlockCertificate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, certificate);
        back.verify(&committee).unwrap();
    }

    #[test]
    fn two_thirds_exactly_is_not_enough() {
        let (committee, signers) = setup(&[10, 10, 10]);
        let certificate = certify(&committee, &signers[..2], &statement());
        assert_eq!(
            certificate.verify(&committee),
            Err(CertificateError::InsufficientWeight {
                signed: 20,
                required: 21
            })
        );
    }

    #[test]
    fn tampered_statement_fails() {
        let (committee, signers) = setup(&[10, 10, 10]);
        let mut certificate = certify(&committee, &signers, &statement());
        certificate.statement.number += 1;
        assert!(matches!(
            certificate.verify(&committee),
            Err(CertificateError::InvalidSignature(_))
        ));
    }

    #[test]
    fn signer_bits_outside_committee_are_rejected() {
        let (committee, signers) = setup(&[10, 10, 10]);
        let mut certificate = certify(&committee, &signers, &statement());
        certificate.signature.signers.insert(5);
        assert_eq!(
            certificate.verify(&committee),
            Err(CertificateError::SignerOutOfRange(5))
        );
    }
}
