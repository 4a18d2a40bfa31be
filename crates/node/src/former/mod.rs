//! Turns decided batches into blocks.
//!
//! The active epoch's upgrades select the mode. In distributed mode every
//! batch yields at most one block built from the transactions of all its
//! events. In single-proposer mode blocks come from proposals carried by the
//! events of the elected validator; the first valid proposal for a height
//! wins. Empty blocks are paced by `MaxEmptyBlockSkipPeriod` in both modes.
//!
//! After every block the former applies the governance actions reported by
//! the executor and decides whether the epoch seals.

use std::{collections::HashMap, sync::Arc};

use alloy_consensus::Transaction as _;
use alloy_primitives::{Address, B256};
use parking_lot::RwLock;
use sonic_chainspec::Rules;
use sonic_consensus::DecidedBatch;
use sonic_evm::{BlockContext, Executor};
use sonic_primitives::{
    Block, BlockFields, Epoch, Frame, Receipt, RecoveredTx, Timestamp, ValidatorId, Validators,
    receipts_root,
};
use tracing::{debug, info, instrument, warn};

use crate::{
    epoch::{EpochManager, EpochState, SealReason},
    error::Fatal,
    store::{BlockCommit, ChainHead, ChainStore},
    txpool::TxPool,
};

pub mod distributed;
pub mod proposer;

/// A block that is durably part of the chain.
#[derive(Debug)]
pub struct CommittedBlock {
    pub block: Block,
    pub receipts: Vec<Receipt>,
    /// Epoch whose committee certifies the block.
    pub epoch: Epoch,
}

/// The epoch sealed with the last block of a batch.
#[derive(Clone, Debug)]
pub struct EpochSwitch {
    pub sealed: Epoch,
    pub reason: SealReason,
    pub next: Arc<EpochState>,
}

#[derive(Debug, Default)]
pub struct FormerOutput {
    pub blocks: Vec<Arc<CommittedBlock>>,
    pub switch: Option<EpochSwitch>,
}

/// Header values of a block before execution.
struct Candidate {
    timestamp: Timestamp,
    prev_randao: B256,
    proposer: ValidatorId,
    transactions: Vec<RecoveredTx>,
    /// Commit even if no transaction survives execution.
    allow_empty: bool,
}

pub struct BlockFormer {
    store: Arc<ChainStore>,
    executor: Arc<dyn Executor>,
    pool: Arc<RwLock<TxPool>>,
    epochs: EpochManager,
    rules: Arc<Rules>,
    validators: Validators,
}

impl std::fmt::Debug for BlockFormer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockFormer")
            .field("epochs", &self.epochs)
            .finish_non_exhaustive()
    }
}

impl BlockFormer {
    pub fn new(
        store: Arc<ChainStore>,
        executor: Arc<dyn Executor>,
        pool: Arc<RwLock<TxPool>>,
    ) -> Result<Self, Fatal> {
        let current = store.epoch_state();
        let pending = store.pending_changes()?;
        Ok(Self {
            rules: Arc::new(current.rules.clone()),
            validators: current.validator_set(),
            epochs: EpochManager::new(current, pending),
            store,
            executor,
            pool,
        })
    }

    pub const fn epochs(&self) -> &EpochManager {
        &self.epochs
    }

    /// Forms the blocks of one decided batch.
    ///
    /// Batches of other epochs and frames at or below the head's processed
    /// frame are skipped; the latter are replayed by consensus after a restart.
    #[instrument(skip_all, fields(epoch = batch.epoch, frame = batch.frame), err)]
    pub fn handle_batch(&mut self, batch: &DecidedBatch) -> Result<FormerOutput, Fatal> {
        let head = self.store.head();
        let mut out = FormerOutput::default();
        if batch.epoch != head.epoch {
            debug!(head_epoch = head.epoch, "batch of another epoch ignored");
            return Ok(out);
        }
        if batch.frame <= head.frame {
            debug!(head_frame = head.frame, "frame already processed");
            return Ok(out);
        }

        if self.rules.upgrades.single_proposer_block_formation {
            self.handle_proposals(batch, &mut out)?;
        } else {
            self.handle_distributed(batch, &mut out)?;
        }

        if batch.seals_epoch && out.switch.is_none() {
            // Nothing was formed that could carry the seal.
            let head = self.store.head();
            let candidate = self.sealing_candidate(&head, batch);
            self.form(&head, candidate, batch.frame, true, &mut out)?;
        }
        if out.blocks.is_empty() {
            self.store.record_frame(batch.frame)?;
        }
        Ok(out)
    }

    fn handle_distributed(&mut self, batch: &DecidedBatch, out: &mut FormerOutput) -> Result<(), Fatal> {
        let head = self.store.head();
        let transactions =
            distributed::order_transactions(&batch.events, self.rules.economy.min_base_fee);
        let timestamp = distributed::block_time(batch.median_time, head.timestamp);
        let allow_empty = self.empty_block_due(&head, timestamp);
        if transactions.is_empty() && !allow_empty && !batch.seals_epoch {
            return Ok(());
        }
        let candidate = Candidate {
            timestamp,
            prev_randao: distributed::next_randao(head.prev_randao, &batch.atropos),
            proposer: batch.atropos_creator,
            transactions,
            allow_empty: allow_empty || batch.seals_epoch,
        };
        self.form(&head, candidate, batch.frame, batch.seals_epoch, out)?;
        Ok(())
    }

    fn handle_proposals(&mut self, batch: &DecidedBatch, out: &mut FormerOutput) -> Result<(), Fatal> {
        for event in &batch.events {
            let Some(proposal) = event.payload.proposal() else {
                continue;
            };
            let head = self.store.head();
            if let Err(error) = proposer::validate(
                proposal,
                event.creator,
                batch.frame,
                &head,
                &self.validators,
                &self.rules,
            ) {
                debug!(
                    creator = event.creator,
                    number = proposal.number,
                    %error,
                    "proposal rejected"
                );
                continue;
            }
            let transactions = proposal
                .transactions
                .iter()
                .filter_map(|tx| RecoveredTx::recover(tx.clone()).ok())
                .collect();
            let candidate = Candidate {
                timestamp: proposal.timestamp,
                prev_randao: proposal.prev_randao,
                proposer: event.creator,
                transactions,
                allow_empty: true,
            };
            self.form(&head, candidate, batch.frame, false, out)?;
            if out.switch.is_some() {
                break;
            }
        }
        Ok(())
    }

    /// An empty block carrying a forced epoch seal.
    fn sealing_candidate(&self, head: &ChainHead, batch: &DecidedBatch) -> Candidate {
        Candidate {
            timestamp: distributed::block_time(batch.median_time, head.timestamp),
            prev_randao: distributed::next_randao(head.prev_randao, &batch.atropos),
            proposer: batch.atropos_creator,
            transactions: Vec::new(),
            allow_empty: true,
        }
    }

    /// Whether a block at `timestamp` may be empty: the empty-block period has
    /// elapsed or the epoch has to seal anyway.
    fn empty_block_due(&self, head: &ChainHead, timestamp: Timestamp) -> bool {
        timestamp.saturating_sub(head.timestamp) >= self.rules.blocks.max_empty_block_skip_period
            || self
                .epochs
                .seal_reason(timestamp, head.epoch_gas, false)
                .is_some()
    }

    /// Executes and commits a candidate on top of `head`. Returns whether a
    /// block was committed.
    fn form(
        &mut self,
        head: &ChainHead,
        candidate: Candidate,
        frame: Frame,
        frame_cap: bool,
        out: &mut FormerOutput,
    ) -> Result<bool, Fatal> {
        let number = head.number + 1;
        let ctx = BlockContext::new(
            number,
            candidate.timestamp,
            candidate.prev_randao,
            self.rules.clone(),
        );
        let senders: HashMap<B256, Address> = candidate
            .transactions
            .iter()
            .map(|tx| (tx.hash(), tx.sender()))
            .collect();
        let submitted = candidate.transactions.len();
        let outcome = self.executor.execute(
            head.state_root,
            &ctx,
            candidate
                .transactions
                .into_iter()
                .map(RecoveredTx::into_tx)
                .collect(),
        )?;
        let dropped: Vec<B256> = outcome
            .skipped
            .iter()
            .filter(|skipped| skipped.reason.is_permanent())
            .map(|skipped| skipped.hash)
            .collect();

        if outcome.transactions.is_empty() && !candidate.allow_empty {
            let root = self.executor.revert_to(head.number)?;
            if root != head.state_root {
                return Err(Fatal::structural(format!(
                    "reverting to block {} yields state root {root}, the chain has {}",
                    head.number, head.state_root
                )));
            }
            self.pool.write().evict(std::iter::empty(), &dropped);
            debug!(number, submitted, "no transaction executed, block skipped");
            return Ok(false);
        }

        let block = Block::assemble(
            BlockFields {
                number,
                parent_hash: head.hash,
                timestamp: candidate.timestamp,
                prev_randao: candidate.prev_randao,
                gas_limit: ctx.gas_limit,
                gas_used: outcome.gas_used,
                base_fee: ctx.base_fee,
                state_root: outcome.state_root,
                receipts_root: receipts_root(&outcome.receipts),
                logs_bloom: outcome.logs_bloom,
                proposer: candidate.proposer,
                epoch: head.epoch,
            },
            outcome.transactions,
        );
        for action in &outcome.governance {
            self.epochs.apply(action);
        }

        let epoch_gas = head.epoch_gas.saturating_add(outcome.gas_used);
        let reason = self
            .epochs
            .seal_reason(block.timestamp(), epoch_gas, frame_cap);
        let mut next_head = ChainHead::of(&block, frame, epoch_gas);
        let next_epoch = reason.map(|_| self.epochs.seal(&block));
        if let Some(next) = &next_epoch {
            next_head.epoch = next.epoch;
            next_head.frame = 0;
            next_head.block_frame = 0;
            next_head.epoch_gas = 0;
        }

        self.store.commit(BlockCommit {
            block: &block,
            receipts: &outcome.receipts,
            head: next_head,
            pending: self.epochs.pending(),
            next_epoch: next_epoch.clone(),
        })?;
        let evicted = self.pool.write().evict(
            block
                .transactions()
                .iter()
                .filter_map(|tx| {
                    let sender = senders.get(tx.tx_hash())?;
                    Some((*sender, tx.nonce()))
                }),
            &dropped,
        );

        info!(
            number,
            hash = %block.hash(),
            txs = block.transactions().len(),
            skipped = outcome.skipped.len(),
            gas_used = block.gas_used(),
            evicted,
            "block committed"
        );

        if let (Some(reason), Some(next)) = (reason, next_epoch) {
            if next.validators.is_empty() {
                warn!(epoch = next.epoch, "new epoch has no validators");
            }
            info!(sealed = head.epoch, next = next.epoch, %reason, "epoch sealed");
            self.rules = Arc::new(next.rules.clone());
            self.validators = next.validator_set();
            out.switch = Some(EpochSwitch {
                sealed: head.epoch,
                reason,
                next,
            });
        }
        out.blocks.push(Arc::new(CommittedBlock {
            block,
            receipts: outcome.receipts,
            epoch: head.epoch,
        }));
        Ok(true)
    }
}
