//! Helpers for building signed events and small DAGs in tests.

use std::{collections::HashMap, time::Duration};

use alloy_primitives::B256;
use alloy_signer_local::PrivateKeySigner;
use sonic_chainspec::{Upgrades, genesis::FakeGenesis};
use sonic_primitives::{
    Event, EventPayload, Lamport, Seq, Timestamp, UnsignedEvent, ValidatorId, event::EventId,
};

use crate::{EpochContext, event_gas};

/// Epoch 1 of a fake network with `validators` equally staked validators.
pub fn fake_context(validators: u32, upgrades: Upgrades) -> EpochContext {
    let genesis = FakeGenesis::new(validators, upgrades)
        .build()
        .expect("fake genesis is valid");
    EpochContext::new(1, &genesis.validators, genesis.rules, genesis.time)
}

/// An unsigned, empty distributed-mode event of epoch 1.
pub fn unsigned_event(creator: ValidatorId, seq: Seq, parents: &[EventId]) -> UnsignedEvent {
    let mut all = Vec::with_capacity(parents.len() + 1);
    if seq == 1 {
        all.push(B256::ZERO);
    }
    all.extend_from_slice(parents);
    UnsignedEvent {
        epoch: 1,
        lamport: seq,
        creator,
        seq,
        creation_time: Timestamp::from_secs(1_700_000_000).saturating_add(Duration::from_millis(
            u64::from(seq) * 100,
        )),
        parents: all,
        gas_power_used: 0,
        payload: EventPayload::V2 {
            transactions: vec![],
        },
    }
}

/// Event-signing key of fake validator `id`.
pub struct ValidatorKeys {
    pub signer: PrivateKeySigner,
}

impl ValidatorKeys {
    pub fn fake(id: ValidatorId) -> Self {
        Self {
            signer: sonic_chainspec::genesis::fake::fake_key(id).expect("fake keys are valid"),
        }
    }

    pub fn sign(&self, event: UnsignedEvent) -> Event {
        event.sign(&self.signer).expect("local signing does not fail")
    }
}

#[derive(Clone, Copy)]
struct Tip {
    id: EventId,
    seq: Seq,
    time: Timestamp,
}

/// Creates well-formed signed events of fake validators, tracking self-parents,
/// lamport times and creation times.
pub struct EventFactory {
    context: EpochContext,
    keys: HashMap<ValidatorId, ValidatorKeys>,
    tips: HashMap<ValidatorId, Tip>,
    lamports: HashMap<EventId, Lamport>,
    now: Timestamp,
    step: Duration,
}

impl EventFactory {
    pub fn new(context: EpochContext) -> Self {
        let keys = context
            .validators
            .ids()
            .map(|id| (id, ValidatorKeys::fake(id)))
            .collect();
        let now = context.start_time;
        Self {
            context,
            keys,
            tips: HashMap::new(),
            lamports: HashMap::new(),
            now,
            step: Duration::from_millis(50),
        }
    }

    pub const fn context(&self) -> &EpochContext {
        &self.context
    }

    /// Latest event created for `creator`.
    pub fn tip(&self, creator: ValidatorId) -> Option<EventId> {
        self.tips.get(&creator).map(|tip| tip.id)
    }

    pub fn create(&mut self, creator: ValidatorId, others: &[EventId]) -> Event {
        self.create_with(
            creator,
            others,
            EventPayload::V2 {
                transactions: vec![],
            },
        )
    }

    pub fn create_with(
        &mut self,
        creator: ValidatorId,
        others: &[EventId],
        payload: EventPayload,
    ) -> Event {
        self.now = self.now.saturating_add(self.step);
        let tip = self.tips.get(&creator).copied();
        let mut parents = vec![tip.map_or(B256::ZERO, |tip| tip.id)];
        parents.extend_from_slice(others);
        let lamport = parents
            .iter()
            .filter_map(|parent| self.lamports.get(parent))
            .max()
            .copied()
            .unwrap_or(0)
            + 1;
        let mut unsigned = UnsignedEvent {
            epoch: self.context.epoch,
            lamport,
            creator,
            seq: tip.map_or(1, |tip| tip.seq + 1),
            creation_time: tip.map_or(self.now, |tip| {
                self.now.max(tip.time.saturating_add(Duration::from_nanos(1)))
            }),
            parents,
            gas_power_used: 0,
            payload,
        };
        unsigned.gas_power_used = event_gas(&self.context.rules, &unsigned);
        let event = self.keys[&creator].sign(unsigned);
        self.lamports.insert(event.id(), lamport);
        self.tips.insert(
            creator,
            Tip {
                id: event.id(),
                seq: event.seq,
                time: event.creation_time,
            },
        );
        event
    }

    /// One round in which every validator creates an event on top of the
    /// previous tips of all others.
    pub fn round(&mut self) -> Vec<Event> {
        let ids: Vec<_> = self.context.validators.ids().collect();
        let previous: HashMap<_, _> = ids.iter().map(|id| (*id, self.tip(*id))).collect();
        ids.iter()
            .map(|creator| {
                let others: Vec<_> = ids
                    .iter()
                    .filter(|other| *other != creator)
                    .filter_map(|other| previous[other])
                    .collect();
                self.create(*creator, &others)
            })
            .collect()
    }
}
