//! Collects partial signatures and emits a certificate once the signers hold a
//! quorum of the committee weight.

use std::collections::{BTreeMap, HashMap, HashSet};

use alloy_primitives::B256;
use sonic_primitives::Stake;
use tracing::{debug, info};

use crate::{
    AggregatedSignature, BlsSignature, Certificate, CertificateError, Committee,
    PartialSignature, Statement,
};

struct Pending<S> {
    statement: S,
    partials: BTreeMap<usize, BlsSignature>,
    weight: Stake,
}

/// Aggregates partial signatures for statements signed by one committee.
pub struct Aggregator<S> {
    committee: Committee,
    pending: HashMap<B256, Pending<S>>,
    /// Statements that already produced a certificate; late partials are ignored.
    done: HashSet<B256>,
}

impl<S: Statement> Aggregator<S> {
    pub fn new(committee: Committee) -> Self {
        Self {
            committee,
            pending: HashMap::new(),
            done: HashSet::new(),
        }
    }

    pub const fn committee(&self) -> &Committee {
        &self.committee
    }

    /// Replaces the committee, dropping everything collected for the old one.
    pub fn set_committee(&mut self, committee: Committee) {
        self.committee = committee;
        self.pending.clear();
        self.done.clear();
    }

    /// Adds a partial signature for `statement`.
    ///
    /// Returns the certificate as soon as the collected signers reach the
    /// quorum. Partials that do not verify against the signer's key are
    /// rejected; duplicates are ignored.
    pub fn add_partial(
        &mut self,
        statement: &S,
        partial: PartialSignature,
    ) -> Result<Option<Certificate<S>>, CertificateError> {
        let hash = statement.signing_hash();
        if self.done.contains(&hash) {
            return Ok(None);
        }

        let idx = self
            .committee
            .index_of(partial.signer)
            .ok_or(CertificateError::UnknownSigner(partial.signer))?;
        let member = &self.committee.members()[idx];
        partial
            .signature
            .verify(hash.as_slice(), &member.key)
            .map_err(CertificateError::InvalidSignature)?;

        let pending = self.pending.entry(hash).or_insert_with(|| Pending {
            statement: statement.clone(),
            partials: BTreeMap::new(),
            weight: 0,
        });
        if pending.partials.insert(idx, partial.signature).is_some() {
            debug!(%hash, signer = partial.signer, "duplicate partial signature ignored");
            return Ok(None);
        }
        pending.weight += member.weight;

        if pending.weight < self.committee.quorum() {
            return Ok(None);
        }

        let Some(pending) = self.pending.remove(&hash) else {
            return Ok(None);
        };
        let signature = BlsSignature::aggregate(pending.partials.values())
            .map_err(CertificateError::Aggregation)?;
        self.done.insert(hash);
        info!(
            %hash,
            signers = pending.partials.len(),
            weight = pending.weight,
            "statement certified"
        );
        Ok(Some(Certificate {
            statement: pending.statement,
            signature: AggregatedSignature {
                signers: pending.partials.keys().copied().collect(),
                signature,
            },
        }))
    }

    /// Drops pending statements that `keep` rejects.
    pub fn retain(&mut self, mut keep: impl FnMut(&S) -> bool) {
        self.pending.retain(|_, pending| keep(&pending.statement));
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn partial_count(&self, statement: &S) -> usize {
        self.pending
            .get(&statement.signing_hash())
            .map_or(0, |pending| pending.partials.len())
    }
}
