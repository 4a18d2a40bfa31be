//! Creates the local validator's events.
//!
//! An event is emitted once the previous one is admitted to the DAG and the
//! emitter interval has passed (the stalled interval once no block was
//! committed for `StallThreshold`). Its parents are the self-parent plus the
//! newest events of up to `MaxParents - 1` other validators. In distributed
//! mode the event carries pool transactions this validator is responsible
//! for; in single-proposer mode it carries a proposal whenever the validator
//! is elected for the next block.

use std::{
    cmp::Reverse,
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use alloy_eips::eip2718::Encodable2718 as _;
use alloy_primitives::{Address, B256, keccak256};
use alloy_signer_local::PrivateKeySigner;
use parking_lot::RwLock;
use sonic_dag::{Dag, DagEvent, GasPower, event_gas};
use sonic_primitives::{
    BlockNumber, Epoch, Event, EventPayload, Proposal, Timestamp, UnsignedEvent, ValidatorId,
};
use tracing::{debug, trace, warn};

use crate::{
    clock::Clock,
    former::proposer::{next_randao, proposer_of, reached_turn},
    store::{ChainHead, ChainStore},
    txpool::TxPool,
};

/// A transaction put into an event is not offered again before this long.
pub const TX_REEMIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Index of the validator that puts `sender`'s transactions into events.
pub fn responsible_validator(sender: &Address, validators: usize) -> usize {
    let hash = keccak256(sender);
    let mut head = [0u8; 8];
    head.copy_from_slice(&hash[..8]);
    (u64::from_be_bytes(head) % validators.max(1) as u64) as usize
}

struct EpochEmitter {
    epoch: Epoch,
    creator_idx: usize,
    gas_power: GasPower,
    /// Last emitted event, until the DAG admits it.
    pending: Option<B256>,
}

pub struct Emitter {
    validator: ValidatorId,
    signer: PrivateKeySigner,
    clock: Arc<dyn Clock>,
    pool: Arc<RwLock<TxPool>>,
    store: Arc<ChainStore>,
    epoch: Option<EpochEmitter>,
    last_emit: Option<Timestamp>,
    /// Head block number and the local time it was first seen.
    progress: Option<(BlockNumber, Timestamp)>,
    in_flight: HashMap<B256, Timestamp>,
    proposed: HashSet<(Epoch, BlockNumber, u32)>,
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("validator", &self.validator)
            .field("last_emit", &self.last_emit)
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl Emitter {
    pub fn new(
        validator: ValidatorId,
        signer: PrivateKeySigner,
        clock: Arc<dyn Clock>,
        pool: Arc<RwLock<TxPool>>,
        store: Arc<ChainStore>,
    ) -> Self {
        Self {
            validator,
            signer,
            clock,
            pool,
            store,
            epoch: None,
            last_emit: None,
            progress: None,
            in_flight: HashMap::new(),
            proposed: HashSet::new(),
        }
    }

    pub const fn validator(&self) -> ValidatorId {
        self.validator
    }

    /// Creates the next event on top of `dag`, if one is due.
    pub fn emit(&mut self, dag: &Dag) -> Option<Event> {
        let context = dag.context();
        if self.epoch.as_ref().map(|state| state.epoch) != Some(context.epoch) {
            let Some(creator_idx) = context.validators.index_of(self.validator) else {
                trace!(epoch = context.epoch, "not a validator of the epoch");
                self.epoch = None;
                return None;
            };
            self.epoch = Some(EpochEmitter {
                epoch: context.epoch,
                creator_idx,
                gas_power: GasPower::new(&context.rules, &context.validators),
                pending: None,
            });
        }
        let state = self.epoch.as_ref()?;
        let creator_idx = state.creator_idx;

        let self_parent = dag.last_of(creator_idx).map(|idx| dag.event(idx));
        if let Some(pending) = state.pending
            && self_parent.map(|parent| parent.event.id()) != Some(pending)
        {
            return None;
        }
        if dag.is_cheater(creator_idx) {
            warn!(epoch = context.epoch, "local validator is flagged as cheater, not emitting");
            return None;
        }

        let now = self.clock.now();
        let head = self.store.head();
        let rules = &context.rules;
        let stalled_since = match self.progress {
            Some((number, since)) if number == head.number => since,
            _ => {
                self.progress = Some((head.number, now));
                now
            }
        };
        let interval = if now.saturating_sub(stalled_since) >= rules.emitter.stall_threshold {
            rules.emitter.stalled_interval
        } else {
            rules.emitter.interval
        };
        if let Some(last) = self.last_emit
            && now.saturating_sub(last) < interval
        {
            return None;
        }

        let mut unsigned = self.skeleton(dag, creator_idx, self_parent, now);
        let previous = self_parent.map(|parent| (parent.gas_left, parent.event.creation_time));
        let available = state
            .gas_power
            .available(creator_idx, previous, unsigned.creation_time)
            .min()
            .min(rules.economy.gas.max_event_gas);
        let base = event_gas(rules, &unsigned);
        if base > available {
            debug!(base, available, "not enough gas power to emit");
            return None;
        }
        let budget = available - base;
        let size_budget = (rules.dag.max_event_size as usize / 2).saturating_sub(unsigned.parents.len() * 32);

        unsigned.payload = if rules.upgrades.single_proposer_block_formation {
            EventPayload::V3 {
                transactions: Vec::new(),
                proposal: self.proposal(&head, context.epoch, dag, budget, size_budget, now),
            }
        } else {
            let transactions =
                self.pick_transactions(Some(context.validators.len()), creator_idx, budget, size_budget, now);
            EventPayload::V2 { transactions }
        };
        unsigned.gas_power_used = event_gas(rules, &unsigned);

        let event = match unsigned.sign(&self.signer) {
            Ok(event) => event,
            Err(error) => {
                warn!(%error, "failed signing event");
                return None;
            }
        };
        for tx in event.payload.transactions().iter().chain(
            event
                .payload
                .proposal()
                .map(|proposal| proposal.transactions.as_slice())
                .unwrap_or_default(),
        ) {
            self.in_flight.insert(*tx.tx_hash(), now);
        }
        if let Some(state) = self.epoch.as_mut() {
            state.pending = Some(event.id());
        }
        self.last_emit = Some(now);
        debug!(
            id = %event.id(),
            epoch = event.epoch,
            seq = event.seq,
            lamport = event.lamport,
            parents = event.parents.len(),
            txs = event.payload.transactions().len(),
            proposal = event.payload.proposal().map(|proposal| proposal.number),
            "emitted event"
        );
        Some(event)
    }

    /// An event without payload on top of the self-parent and the newest
    /// events of the other validators.
    fn skeleton(
        &self,
        dag: &Dag,
        creator_idx: usize,
        self_parent: Option<&DagEvent>,
        now: Timestamp,
    ) -> UnsignedEvent {
        let context = dag.context();
        let mut others: Vec<&DagEvent> = (0..context.validators.len())
            .filter(|idx| *idx != creator_idx && !dag.is_cheater(*idx))
            .filter_map(|idx| dag.last_of(idx))
            .map(|idx| dag.event(idx))
            .collect();
        others.sort_by_key(|other| (Reverse(other.event.lamport), other.event.id()));
        others.truncate((context.rules.dag.max_parents as usize).saturating_sub(1));

        let mut parents = Vec::with_capacity(others.len() + 1);
        parents.push(self_parent.map_or(B256::ZERO, |parent| parent.event.id()));
        parents.extend(others.iter().map(|other| other.event.id()));
        let lamport = self_parent
            .into_iter()
            .chain(others.iter().copied())
            .map(|parent| parent.event.lamport)
            .max()
            .unwrap_or(0)
            + 1;
        let creation_time = match self_parent {
            Some(parent) => now.max(Timestamp::from_nanos(
                parent.event.creation_time.as_nanos() + 1,
            )),
            None => now,
        };

        UnsignedEvent {
            epoch: context.epoch,
            lamport,
            creator: self.validator,
            seq: self_parent.map_or(1, |parent| parent.event.seq + 1),
            creation_time,
            parents,
            gas_power_used: 0,
            payload: EventPayload::V2 {
                transactions: Vec::new(),
            },
        }
    }

    /// Pool transactions that fit into `gas` and `size`, skipping those
    /// recently put into an event. With `validators` set, only senders this
    /// validator is responsible for are considered.
    fn pick_transactions(
        &mut self,
        validators: Option<usize>,
        creator_idx: usize,
        gas: u64,
        size: usize,
        now: Timestamp,
    ) -> Vec<alloy_consensus::TxEnvelope> {
        let pool = self.pool.read();
        self.in_flight.retain(|hash, _| pool.contains(hash));
        let (mut gas_left, mut size_left) = (gas, size);
        let mut picked = Vec::new();
        for tx in pool.pending() {
            if validators.is_some_and(|n| responsible_validator(&tx.sender(), n) != creator_idx) {
                continue;
            }
            if self
                .in_flight
                .get(&tx.hash())
                .is_some_and(|at| now.saturating_sub(*at) < TX_REEMIT_TIMEOUT)
            {
                continue;
            }
            let len = tx.tx().encode_2718_len();
            if tx.gas_limit() > gas_left || len > size_left {
                continue;
            }
            gas_left -= tx.gas_limit();
            size_left -= len;
            picked.push(tx.tx().clone());
        }
        picked
    }

    fn proposal(
        &mut self,
        head: &ChainHead,
        epoch: Epoch,
        dag: &Dag,
        gas: u64,
        size: usize,
        now: Timestamp,
    ) -> Option<Proposal> {
        if head.epoch != epoch {
            return None;
        }
        let number = head.number + 1;
        self.proposed.retain(|(e, n, _)| *e == epoch && *n >= number);
        let turn = reached_turn(head.frame, head.block_frame);
        if proposer_of(dag.validators(), head, turn) != Some(self.validator)
            || self.proposed.contains(&(epoch, number, turn))
        {
            return None;
        }
        let rules = &dag.context().rules;
        let gas = gas.min(rules.blocks.max_block_gas);
        let transactions = self.pick_transactions(None, 0, gas, size, now);
        let timestamp = now.max(Timestamp::from_nanos(head.timestamp.as_nanos() + 1));
        if transactions.is_empty()
            && timestamp.saturating_sub(head.timestamp) < rules.blocks.max_empty_block_skip_period
        {
            return None;
        }
        self.proposed.insert((epoch, number, turn));
        debug!(number, turn, txs = transactions.len(), "proposing block");
        Some(Proposal {
            number,
            parent_hash: head.hash,
            timestamp,
            prev_randao: next_randao(head),
            turn,
            transactions,
        })
    }
}
