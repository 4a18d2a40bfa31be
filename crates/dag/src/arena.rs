use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use sonic_primitives::{Epoch, Event, Lamport, Seq, Validators, event::EventId};

use crate::{EpochContext, GasPowerLeft, VectorClock};

/// Dense index of an event within its epoch, in admission order.
pub type EventIdx = u32;

/// An admitted event together with its resolved links.
#[derive(Clone, Debug)]
pub struct DagEvent {
    pub event: Arc<Event>,
    /// Index of the creator in the epoch's validator set.
    pub creator_idx: usize,
    /// Parents in wire order, without the empty self-parent slot of a first event.
    pub parents: Vec<EventIdx>,
    pub self_parent: Option<EventIdx>,
    pub gas_left: GasPowerLeft,
}

/// Arena of the events of one epoch.
#[derive(Debug)]
pub struct Dag {
    context: EpochContext,
    events: Vec<DagEvent>,
    index: HashMap<EventId, EventIdx>,
    /// Events of every creator, ordered by sequence.
    by_creator: Vec<Vec<EventIdx>>,
    heads: BTreeSet<EventIdx>,
    clock: VectorClock,
    cheaters: Vec<bool>,
    max_lamport: Lamport,
}

impl Dag {
    pub fn new(context: EpochContext) -> Self {
        let width = context.validators.len();
        Self {
            context,
            events: Vec::new(),
            index: HashMap::new(),
            by_creator: vec![Vec::new(); width],
            heads: BTreeSet::new(),
            clock: VectorClock::new(width),
            cheaters: vec![false; width],
            max_lamport: 0,
        }
    }

    pub const fn context(&self) -> &EpochContext {
        &self.context
    }

    pub const fn epoch(&self) -> Epoch {
        self.context.epoch
    }

    pub const fn validators(&self) -> &Validators {
        &self.context.validators
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn get(&self, idx: EventIdx) -> Option<&DagEvent> {
        self.events.get(idx as usize)
    }

    /// # Panics
    ///
    /// If `idx` was not handed out by this DAG.
    pub fn event(&self, idx: EventIdx) -> &DagEvent {
        &self.events[idx as usize]
    }

    pub fn idx_of(&self, id: &EventId) -> Option<EventIdx> {
        self.index.get(id).copied()
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.index.contains_key(id)
    }

    pub fn by_id(&self, id: &EventId) -> Option<&DagEvent> {
        self.idx_of(id).map(|idx| self.event(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = (EventIdx, &DagEvent)> + '_ {
        self.events
            .iter()
            .enumerate()
            .map(|(idx, event)| (idx as EventIdx, event))
    }

    /// Latest event of a creator.
    pub fn last_of(&self, creator_idx: usize) -> Option<EventIdx> {
        self.by_creator.get(creator_idx)?.last().copied()
    }

    pub fn event_at(&self, creator_idx: usize, seq: Seq) -> Option<EventIdx> {
        let slot = (seq as usize).checked_sub(1)?;
        self.by_creator.get(creator_idx)?.get(slot).copied()
    }

    /// Events no other event refers to as a parent yet.
    pub fn heads(&self) -> impl Iterator<Item = EventIdx> + '_ {
        self.heads.iter().copied()
    }

    pub fn head_ids(&self) -> Vec<EventId> {
        self.heads().map(|idx| self.event(idx).event.id()).collect()
    }

    pub const fn clock(&self) -> &VectorClock {
        &self.clock
    }

    pub const fn max_lamport(&self) -> Lamport {
        self.max_lamport
    }

    pub fn is_cheater(&self, creator_idx: usize) -> bool {
        self.cheaters.get(creator_idx).copied().unwrap_or(false)
    }

    /// Cheater flags indexed like the validator set.
    pub fn cheaters(&self) -> &[bool] {
        &self.cheaters
    }

    pub(crate) fn mark_cheater(&mut self, creator_idx: usize) {
        if let Some(flag) = self.cheaters.get_mut(creator_idx) {
            *flag = true;
        }
    }

    /// Whether `a` has `b` among its ancestors (or is `b`).
    pub fn observes(&self, a: EventIdx, b: EventIdx) -> bool {
        let target = self.event(b);
        self.clock
            .observes(a, b, target.creator_idx, target.event.seq)
    }

    /// Whether `a` observes `b` through a quorum of honest validators.
    pub fn forkless_cause(&self, a: EventIdx, b: EventIdx) -> bool {
        self.clock
            .forkless_cause(a, b, &self.context.validators, &self.cheaters)
    }

    /// Appends an event whose checks have all passed.
    pub(crate) fn insert(
        &mut self,
        event: Arc<Event>,
        creator_idx: usize,
        parents: Vec<EventIdx>,
        gas_left: GasPowerLeft,
    ) -> EventIdx {
        let idx = self.events.len() as EventIdx;
        let self_parent = event
            .self_parent()
            .and_then(|id| self.index.get(&id).copied());

        for parent in &parents {
            self.heads.remove(parent);
        }
        self.heads.insert(idx);
        self.index.insert(event.id(), idx);
        self.by_creator[creator_idx].push(idx);
        self.max_lamport = self.max_lamport.max(event.lamport);

        let events = &self.events;
        self.clock.push(idx, creator_idx, event.seq, &parents, |e| {
            events[e as usize].parents.as_slice()
        });

        self.events.push(DagEvent {
            event,
            creator_idx,
            parents,
            self_parent,
            gas_left,
        });
        idx
    }
}
