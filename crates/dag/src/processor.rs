use std::{collections::HashSet, sync::Arc};

use parking_lot::RwLock;
use sonic_primitives::{Event, EventVersion, event::EventId};
use tracing::{debug, trace, warn};

use crate::{
    AdmissionError, Dag, EpochContext, EventIdx, GasPower, HangingBuffer, RejectKind, event_gas,
    store::EpochEvents,
};

/// Events the hanging buffer holds before dropping the oldest.
const HANGING_CAPACITY: usize = 10_000;

/// An event that made it into the DAG.
#[derive(Clone, Debug)]
pub struct Admitted {
    pub idx: EventIdx,
    pub event: Arc<Event>,
}

#[derive(Clone, Copy)]
struct Checks {
    signature: bool,
    persist: bool,
}

/// Runs admission for the current epoch and owns the only write access to its
/// [`Dag`].
pub struct EventProcessor {
    dag: Arc<RwLock<Dag>>,
    gas_power: GasPower,
    hanging: HangingBuffer,
    events: EpochEvents,
}

impl EventProcessor {
    /// Starts an empty epoch. Readers share the returned DAG handle through
    /// [`Self::dag`].
    pub fn new(context: EpochContext, events: EpochEvents) -> Self {
        let gas_power = GasPower::new(&context.rules, &context.validators);
        Self {
            dag: Arc::new(RwLock::new(Dag::new(context))),
            gas_power,
            hanging: HangingBuffer::new(HANGING_CAPACITY),
            events,
        }
    }

    /// Shared handle to the DAG. It stays valid across [`Self::reset`].
    pub fn dag(&self) -> Arc<RwLock<Dag>> {
        self.dag.clone()
    }

    pub fn epoch(&self) -> sonic_primitives::Epoch {
        self.dag.read().epoch()
    }

    pub fn hanging_len(&self) -> usize {
        self.hanging.len()
    }

    /// Whether `id` is admitted or waits in the hanging buffer.
    pub fn is_known(&self, id: &EventId) -> bool {
        self.hanging.contains(id) || self.dag.read().contains(id)
    }

    /// Unknown parents of the hanging events.
    pub fn missing_parents(&self) -> Vec<EventId> {
        let dag = self.dag.read();
        self.hanging
            .missing_parents()
            .into_iter()
            .filter(|parent| !dag.contains(parent))
            .collect()
    }

    /// Switches to a new epoch, discarding all in-memory state of the old one.
    pub fn reset(&mut self, context: EpochContext, events: EpochEvents) {
        self.gas_power = GasPower::new(&context.rules, &context.validators);
        self.hanging.clear();
        self.events = events;
        *self.dag.write() = Dag::new(context);
    }

    /// Rebuilds the DAG from the persisted events of the epoch.
    ///
    /// Signatures were checked when the events were first admitted and are not
    /// verified again.
    pub fn restore(&mut self) -> Result<Vec<Admitted>, AdmissionError> {
        let events = self.events.load()?;
        let mut restored = Vec::with_capacity(events.len());
        for event in events {
            let admitted = self.admit(
                event,
                Checks {
                    signature: false,
                    persist: false,
                },
            )?;
            restored.push(admitted);
        }
        debug!(epoch = self.epoch(), events = restored.len(), "restored dag");
        Ok(restored)
    }

    /// Admits `event` and every hanging event it unblocks.
    ///
    /// The admitted events are returned in admission order, `event` first. If
    /// parents are missing, the event is parked and
    /// [`AdmissionError::UnknownParent`] returned.
    pub fn process(&mut self, event: Event) -> Result<Vec<Admitted>, AdmissionError> {
        let checks = Checks {
            signature: true,
            persist: true,
        };
        let first = self.admit(event, checks)?;
        let mut queue = vec![first.event.id()];
        let mut admitted = vec![first];

        while let Some(parent) = queue.pop() {
            for child in self.hanging.release(&parent) {
                let child_id = child.id();
                match self.admit(
                    child,
                    Checks {
                        signature: false,
                        ..checks
                    },
                ) {
                    Ok(done) => {
                        queue.push(done.event.id());
                        admitted.push(done);
                    }
                    Err(error) if error.is_fatal() => return Err(error),
                    Err(AdmissionError::UnknownParent(_)) => {}
                    Err(error) => {
                        debug!(event = %child_id, %error, kind = %error.kind(), "dropped hanging event");
                    }
                }
            }
        }
        Ok(admitted)
    }

    fn admit(&mut self, event: Event, checks: Checks) -> Result<Admitted, AdmissionError> {
        let id = event.id();
        let (creator_idx, parents) = {
            let dag = self.dag.read();
            if dag.contains(&id) || self.hanging.contains(&id) {
                return Err(AdmissionError::Duplicate(id));
            }
            let context = dag.context();
            check_limits(context, &event)?;
            if event.epoch != context.epoch {
                return Err(AdmissionError::WrongEpoch {
                    got: event.epoch,
                    expected: context.epoch,
                });
            }
            let creator_idx = context
                .validators
                .index_of(event.creator)
                .ok_or(AdmissionError::UnknownCreator(event.creator))?;
            check_structure(context, &event)?;
            if checks.signature {
                let expected = context
                    .address_of(event.creator)
                    .ok_or(AdmissionError::UnknownCreator(event.creator))?;
                let signer = event
                    .recover_signer()
                    .map_err(|_| AdmissionError::BadSignature)?;
                if signer != expected {
                    return Err(AdmissionError::BadSignature);
                }
            }

            let linked: Vec<&EventId> = event.parents.iter().filter(|p| !p.is_zero()).collect();
            let missing: Vec<EventId> = linked
                .iter()
                .filter(|parent| !dag.contains(parent))
                .map(|parent| **parent)
                .collect();
            if let Some(first) = missing.first().copied() {
                drop(dag);
                trace!(event = %id, missing = missing.len(), "parking event with unknown parents");
                self.hanging.insert(event, &missing);
                return Err(AdmissionError::UnknownParent(first));
            }
            let parents: Vec<EventIdx> = linked
                .iter()
                .filter_map(|parent| dag.idx_of(parent))
                .collect();
            check_links(&dag, &event, creator_idx, &parents)?;
            (creator_idx, parents)
        };

        let gas_left = {
            let mut dag = self.dag.write();
            if dag.event_at(creator_idx, event.seq).is_some() {
                dag.mark_cheater(creator_idx);
                warn!(
                    creator = event.creator,
                    seq = event.seq,
                    event = %id,
                    kind = %RejectKind::Equivocation,
                    "creator equivocated, flagged as cheater for the epoch"
                );
                return Err(AdmissionError::Equivocation {
                    creator: event.creator,
                    seq: event.seq,
                });
            }
            let previous = event
                .self_parent()
                .and_then(|sp| dag.by_id(&sp))
                .map(|sp| (sp.gas_left, sp.event.creation_time));
            self.gas_power.charge(
                creator_idx,
                previous,
                event.creation_time,
                event.gas_power_used,
            )?
        };

        if checks.persist {
            self.events.put(&event)?;
        }
        let event = Arc::new(event);
        let idx = self
            .dag
            .write()
            .insert(event.clone(), creator_idx, parents, gas_left);
        trace!(
            event = %id,
            creator = event.creator,
            seq = event.seq,
            lamport = event.lamport,
            "admitted event"
        );
        Ok(Admitted { idx, event })
    }
}

fn check_limits(context: &EpochContext, event: &Event) -> Result<(), AdmissionError> {
    let limit = context.rules.dag.max_event_size;
    if event.size() > limit as usize {
        return Err(AdmissionError::TooLarge {
            size: event.size(),
            limit,
        });
    }
    let max_gas = context.rules.economy.gas.max_event_gas;
    if event.gas_power_used > max_gas {
        return Err(AdmissionError::GasOverrun {
            used: event.gas_power_used,
            available: max_gas,
        });
    }
    Ok(())
}

/// Checks that need nothing but the event and the rules.
fn check_structure(context: &EpochContext, event: &Event) -> Result<(), AdmissionError> {
    let rules = &context.rules;
    let expected_version = if rules.upgrades.single_proposer_block_formation {
        EventVersion::SingleProposer
    } else {
        EventVersion::Distributed
    };
    if event.version() != expected_version {
        return Err(AdmissionError::Malformed("event version does not match the epoch"));
    }
    if event.seq == 0 {
        return Err(AdmissionError::Malformed("sequence starts at 1"));
    }
    let Some(self_slot) = event.parents.first() else {
        return Err(AdmissionError::Malformed("missing self-parent slot"));
    };
    if (event.seq == 1) != self_slot.is_zero() {
        return Err(AdmissionError::Malformed(
            "self-parent must be empty exactly for the first event",
        ));
    }
    let others = event.other_parents();
    if others.iter().any(|p| p.is_zero()) {
        return Err(AdmissionError::Malformed("empty other-parent"));
    }
    let mut seen = HashSet::with_capacity(event.parents.len());
    if !event.parents.iter().filter(|p| !p.is_zero()).all(|p| seen.insert(*p)) {
        return Err(AdmissionError::Malformed("duplicate parent"));
    }
    if seen.len() > rules.dag.max_parents as usize {
        return Err(AdmissionError::Malformed("too many parents"));
    }
    if event.lamport == 0 {
        return Err(AdmissionError::Malformed("lamport starts at 1"));
    }
    if event.gas_power_used != event_gas(rules, event) {
        return Err(AdmissionError::Malformed(
            "gas power used does not match the event",
        ));
    }
    Ok(())
}

/// Checks against the already admitted parents.
fn check_links(
    dag: &Dag,
    event: &Event,
    creator_idx: usize,
    parents: &[EventIdx],
) -> Result<(), AdmissionError> {
    let mut max_lamport = 0;
    let mut creators = HashSet::with_capacity(parents.len());
    for (pos, parent) in parents.iter().enumerate() {
        let parent = dag.event(*parent);
        max_lamport = max_lamport.max(parent.event.lamport);
        let is_self_parent = pos == 0 && event.self_parent().is_some();
        if is_self_parent {
            if parent.creator_idx != creator_idx || parent.event.seq + 1 != event.seq {
                return Err(AdmissionError::Malformed(
                    "self-parent is not the creator's previous event",
                ));
            }
            if event.creation_time <= parent.event.creation_time {
                return Err(AdmissionError::Malformed(
                    "creation time does not advance past the self-parent",
                ));
            }
        } else if parent.creator_idx == creator_idx {
            return Err(AdmissionError::Malformed("other-parent by the creator itself"));
        }
        if !creators.insert(parent.creator_idx) {
            return Err(AdmissionError::Malformed("two parents by the same creator"));
        }
    }
    if event.lamport <= max_lamport {
        return Err(AdmissionError::Malformed(
            "lamport does not exceed the parents' lamport",
        ));
    }
    Ok(())
}
