//! Certification chain.
//!
//! Every committed block gets a [`BlockCertificate`]: a [`BlockStatement`]
//! signed by more than two thirds of the epoch committee's weight, with the
//! individual BLS signatures aggregated into one. Committees themselves are
//! chained by [`CommitteeCertificate`]s, each signed by the previous epoch's
//! committee, so a light client starting from the genesis committee can follow
//! every rotation and then check any block with a single pairing.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod aggregator;
pub use aggregator::Aggregator;

pub mod bitset;
pub use bitset::BitSet;

pub mod certificate;
pub use certificate::{
    AggregatedSignature, BlockCertificate, Certificate, CertificateError, CommitteeCertificate,
};

pub mod committee;
pub use committee::{Committee, Member};

pub mod keys;
pub use keys::{BlsError, BlsPublicKey, BlsSecretKey, BlsSignature};

pub mod signer;
pub use signer::{PartialSignature, Signer};

pub mod statement;
pub use statement::{BlockStatement, CommitteeStatement, Statement};
