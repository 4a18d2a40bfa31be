//! Block and committee certification.
//!
//! Every node that holds a committee seat signs each committed block of the
//! seat's epoch and, when an epoch seals, the committee of the next epoch.
//! The committee of the first epoch signs itself. Partial signatures travel
//! over gossip; every node aggregates them and stores a certificate once a
//! quorum signed a statement that matches its own chain.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
};

use sonic_primitives::{Block, BlockNumber, Epoch};
use sonic_scc::{
    Aggregator, BlockCertificate, BlockStatement, Committee, CommitteeCertificate,
    CommitteeStatement, PartialSignature, Signer,
};
use tracing::{debug, info, instrument, warn};

use crate::{
    error::Fatal,
    former::{CommittedBlock, EpochSwitch},
    network::Gossip,
    store::ChainStore,
};

/// Uncertified blocks signed again after a restart.
pub const RESIGN_LIMIT: u64 = 128;

/// Signatures and certificates waiting for a block or epoch this node has not
/// reached yet.
const EARLY_CAPACITY: usize = 4_096;

pub struct Certifier {
    store: Arc<ChainStore>,
    chain_id: u64,
    signer: Option<Signer>,
    blocks: BTreeMap<Epoch, Aggregator<BlockStatement>>,
    /// Keyed by the signing epoch.
    committees: BTreeMap<Epoch, Aggregator<CommitteeStatement>>,
    early_blocks: BTreeMap<BlockNumber, (Epoch, BlockCertificate)>,
    early_committees: BTreeMap<Epoch, CommitteeCertificate>,
    /// Partials signed by committees of epochs not known yet.
    deferred: VecDeque<Gossip>,
}

impl std::fmt::Debug for Certifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certifier")
            .field("chain_id", &self.chain_id)
            .field("signer", &self.signer.as_ref().map(Signer::validator))
            .field("deferred", &self.deferred.len())
            .finish_non_exhaustive()
    }
}

impl Certifier {
    pub fn new(store: Arc<ChainStore>, signer: Option<Signer>) -> Self {
        Self {
            chain_id: store.genesis().rules.network_id,
            store,
            signer,
            blocks: BTreeMap::new(),
            committees: BTreeMap::new(),
            early_blocks: BTreeMap::new(),
            early_committees: BTreeMap::new(),
            deferred: VecDeque::new(),
        }
    }

    /// Signs what this node still owes: the genesis committee, the current
    /// epoch's committee and up to [`RESIGN_LIMIT`] uncertified blocks.
    #[instrument(skip_all, err)]
    pub fn start(&mut self) -> Result<Vec<Gossip>, Fatal> {
        let mut out = Vec::new();
        if self.store.committee_certificate(1)?.is_none() {
            out.extend(self.sign_committee(1, 1)?);
        }
        let current = self.store.epoch_state().epoch;
        if current > 1 && self.store.committee_certificate(current)?.is_none() {
            out.extend(self.sign_committee(current - 1, current)?);
        }

        let head = self.store.head().number;
        let mut first = head.saturating_sub(RESIGN_LIMIT - 1);
        while first <= head && self.store.block_certificate(first)?.is_some() {
            first += 1;
        }
        for number in first..=head {
            let Some(block) = self.store.block(number)? else {
                break;
            };
            out.extend(self.sign_block(block.epoch(), &block)?);
        }
        debug!(signatures = out.len(), "certification started");
        Ok(out)
    }

    /// Signs a freshly committed block.
    pub fn on_block(&mut self, committed: &CommittedBlock) -> Result<Option<Gossip>, Fatal> {
        let number = committed.block.number();
        if let Some((epoch, certificate)) = self.early_blocks.remove(&number) {
            self.store_block_certificate(epoch, certificate)?;
        }
        self.sign_block(committed.epoch, &committed.block)
    }

    /// Signs the committee of the next epoch and retries everything that
    /// waited for it.
    pub fn on_switch(&mut self, switch: &EpochSwitch) -> Result<Vec<Gossip>, Fatal> {
        let mut out = Vec::new();
        if let Some(certificate) = self.early_committees.remove(&switch.next.epoch) {
            self.store_committee_certificate(certificate)?;
        }
        out.extend(self.sign_committee(switch.sealed, switch.next.epoch)?);
        self.blocks.retain(|epoch, _| *epoch >= switch.sealed);
        self.committees.retain(|epoch, _| *epoch >= switch.sealed);

        for message in std::mem::take(&mut self.deferred) {
            self.on_gossip(message)?;
        }
        Ok(out)
    }

    /// Handles a partial signature from a peer.
    pub fn on_gossip(&mut self, message: Gossip) -> Result<(), Fatal> {
        match message {
            Gossip::BlockSignature {
                epoch,
                statement,
                partial,
            } => self.add_block_partial(epoch, statement, partial),
            Gossip::CommitteeSignature {
                signing_epoch,
                statement,
                partial,
            } => self.add_committee_partial(signing_epoch, statement, partial),
            Gossip::Event(_)
            | Gossip::Transaction(_)
            | Gossip::Heads { .. }
            | Gossip::EventRequest { .. }
            | Gossip::Events(_) => Ok(()),
        }
    }

    fn sign_block(&mut self, epoch: Epoch, block: &Block) -> Result<Option<Gossip>, Fatal> {
        let statement = BlockStatement {
            chain_id: self.chain_id,
            number: block.number(),
            hash: block.hash(),
            state_root: block.state_root(),
        };
        let Some(partial) = self.sign_as_member(epoch, &statement, |this, epoch| {
            Ok(this.block_aggregator(epoch)?.map(|aggregator| aggregator.committee().clone()))
        })?
        else {
            return Ok(None);
        };
        self.add_block_partial(epoch, statement.clone(), partial.clone())?;
        Ok(Some(Gossip::BlockSignature {
            epoch,
            statement,
            partial,
        }))
    }

    fn sign_committee(&mut self, signing_epoch: Epoch, epoch: Epoch) -> Result<Option<Gossip>, Fatal> {
        let Some(state) = self.store.epoch_state_at(epoch)? else {
            return Ok(None);
        };
        let statement = CommitteeStatement {
            chain_id: self.chain_id,
            epoch,
            committee: state.committee().map_err(Fatal::structural)?,
        };
        let Some(partial) = self.sign_as_member(signing_epoch, &statement, |this, epoch| {
            Ok(this
                .committee_aggregator(epoch)?
                .map(|aggregator| aggregator.committee().clone()))
        })?
        else {
            return Ok(None);
        };
        self.add_committee_partial(signing_epoch, statement.clone(), partial.clone())?;
        Ok(Some(Gossip::CommitteeSignature {
            signing_epoch,
            statement,
            partial,
        }))
    }

    /// Signs `statement` if the local validator sits in the committee of
    /// `epoch`.
    fn sign_as_member<S: sonic_scc::Statement>(
        &mut self,
        epoch: Epoch,
        statement: &S,
        committee_of: impl FnOnce(&mut Self, Epoch) -> Result<Option<Committee>, Fatal>,
    ) -> Result<Option<PartialSignature>, Fatal> {
        let Some(validator) = self.signer.as_ref().map(Signer::validator) else {
            return Ok(None);
        };
        let Some(committee) = committee_of(self, epoch)? else {
            return Ok(None);
        };
        if committee.index_of(validator).is_none() {
            return Ok(None);
        }
        Ok(self.signer.as_ref().map(|signer| signer.sign(statement)))
    }

    fn add_block_partial(
        &mut self,
        epoch: Epoch,
        statement: BlockStatement,
        partial: PartialSignature,
    ) -> Result<(), Fatal> {
        if statement.chain_id != self.chain_id {
            debug!(chain_id = statement.chain_id, "block signature for another chain ignored");
            return Ok(());
        }
        let Some(aggregator) = self.block_aggregator(epoch)? else {
            self.defer(Gossip::BlockSignature {
                epoch,
                statement,
                partial,
            });
            return Ok(());
        };
        match aggregator.add_partial(&statement, partial) {
            Ok(Some(certificate)) => self.store_block_certificate(epoch, certificate)?,
            Ok(None) => {}
            Err(error) => debug!(number = statement.number, %error, "block signature rejected"),
        }
        Ok(())
    }

    fn add_committee_partial(
        &mut self,
        signing_epoch: Epoch,
        statement: CommitteeStatement,
        partial: PartialSignature,
    ) -> Result<(), Fatal> {
        let chained = statement.epoch == signing_epoch + 1 || (statement.epoch == 1 && signing_epoch == 1);
        if statement.chain_id != self.chain_id || !chained {
            debug!(
                chain_id = statement.chain_id,
                signing_epoch,
                epoch = statement.epoch,
                "committee signature ignored"
            );
            return Ok(());
        }
        let Some(aggregator) = self.committee_aggregator(signing_epoch)? else {
            self.defer(Gossip::CommitteeSignature {
                signing_epoch,
                statement,
                partial,
            });
            return Ok(());
        };
        match aggregator.add_partial(&statement, partial) {
            Ok(Some(certificate)) => self.store_committee_certificate(certificate)?,
            Ok(None) => {}
            Err(error) => debug!(epoch = statement.epoch, %error, "committee signature rejected"),
        }
        Ok(())
    }

    fn store_block_certificate(&mut self, epoch: Epoch, certificate: BlockCertificate) -> Result<(), Fatal> {
        let number = certificate.statement.number;
        match self.store.block(number)? {
            Some(block)
                if block.epoch() == epoch
                    && block.hash() == certificate.statement.hash
                    && block.state_root() == certificate.statement.state_root =>
            {
                self.store.put_block_certificate(&certificate)?;
                info!(number, hash = %block.hash(), "block certified");
            }
            Some(block) => {
                warn!(
                    number,
                    local = %block.hash(),
                    certified = %certificate.statement.hash,
                    "certificate for a different block ignored"
                );
            }
            None if self.early_blocks.len() < EARLY_CAPACITY => {
                self.early_blocks.insert(number, (epoch, certificate));
            }
            None => debug!(number, "too many early certificates, dropped"),
        }
        Ok(())
    }

    fn store_committee_certificate(&mut self, certificate: CommitteeCertificate) -> Result<(), Fatal> {
        let epoch = certificate.statement.epoch;
        match self.store.epoch_state_at(epoch)? {
            Some(state) => {
                let committee = state.committee().map_err(Fatal::structural)?;
                if committee == certificate.statement.committee {
                    self.store.put_committee_certificate(&certificate)?;
                    info!(epoch, members = committee.len(), "committee certified");
                } else {
                    warn!(epoch, "certificate for a different committee ignored");
                }
            }
            None if self.early_committees.len() < EARLY_CAPACITY => {
                self.early_committees.insert(epoch, certificate);
            }
            None => debug!(epoch, "too many early committee certificates, dropped"),
        }
        Ok(())
    }

    fn defer(&mut self, message: Gossip) {
        if self.deferred.len() >= EARLY_CAPACITY {
            self.deferred.pop_front();
        }
        self.deferred.push_back(message);
    }

    fn block_aggregator(&mut self, epoch: Epoch) -> Result<Option<&mut Aggregator<BlockStatement>>, Fatal> {
        if !self.blocks.contains_key(&epoch) {
            let Some(committee) = self.committee_of(epoch)? else {
                return Ok(None);
            };
            self.blocks.insert(epoch, Aggregator::new(committee));
        }
        Ok(self.blocks.get_mut(&epoch))
    }

    fn committee_aggregator(
        &mut self,
        epoch: Epoch,
    ) -> Result<Option<&mut Aggregator<CommitteeStatement>>, Fatal> {
        if !self.committees.contains_key(&epoch) {
            let Some(committee) = self.committee_of(epoch)? else {
                return Ok(None);
            };
            self.committees.insert(epoch, Aggregator::new(committee));
        }
        Ok(self.committees.get_mut(&epoch))
    }

    fn committee_of(&self, epoch: Epoch) -> Result<Option<Committee>, Fatal> {
        self.store
            .epoch_state_at(epoch)?
            .map(|state| state.committee().map_err(Fatal::structural))
            .transpose()
    }
}
