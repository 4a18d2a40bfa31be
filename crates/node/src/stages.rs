//! The event side of the pipeline: admission into the DAG and consensus.
//!
//! [`DagStage`] is the only writer of the current epoch's DAG. It admits
//! events, keeps events of the next epoch in a bounded buffer until
//! [`DagStage::switch_epoch`] opens that epoch, and tracks which unknown
//! parents were already asked from peers. [`ConsensusStage`] reads the same
//! DAG and runs the consensus engine over the admitted events in admission
//! order. Both stages switch on the same [`EpochState`]; admitted events of an
//! epoch the consensus stage no longer runs are skipped.

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use parking_lot::RwLock;
use sonic_consensus::{DecidedBatch, Lachesis};
use sonic_dag::{AdmissionError, Admitted, Dag, EventIdx, EventProcessor, RejectKind};
use sonic_primitives::{Epoch, Event, event::EventId};
use tracing::{debug, info, instrument, trace, warn};

use crate::{epoch::EpochState, error::Fatal, store::ChainStore};

/// Events of future epochs kept until the switch.
pub const FUTURE_EVENTS_CAPACITY: usize = 10_000;

/// Result of handing one event to the DAG stage.
#[derive(Debug, Default)]
pub struct Processed {
    /// Epoch the admitted events belong to.
    pub epoch: Epoch,
    /// Events that entered the DAG, the given one first if it was admitted.
    pub admitted: Vec<Admitted>,
    pub rejected: Option<RejectKind>,
    /// Unknown parents not asked for before.
    pub missing: Vec<EventId>,
}

impl Processed {
    pub fn indices(&self) -> Vec<EventIdx> {
        self.admitted.iter().map(|admitted| admitted.idx).collect()
    }
}

pub struct DagStage {
    store: Arc<ChainStore>,
    processor: EventProcessor,
    future: BTreeMap<Epoch, Vec<Event>>,
    future_len: usize,
    requested: HashSet<EventId>,
}

impl std::fmt::Debug for DagStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DagStage")
            .field("epoch", &self.epoch())
            .field("hanging", &self.processor.hanging_len())
            .field("future", &self.future_len)
            .finish_non_exhaustive()
    }
}

impl DagStage {
    /// Opens the current epoch from its persisted events. Returns the indices
    /// of the restored events in admission order.
    #[instrument(skip_all, err)]
    pub fn open(store: Arc<ChainStore>) -> Result<(Self, Vec<EventIdx>), Fatal> {
        let state = store.epoch_state();
        let events = store.dag().epoch(state.epoch)?;
        let mut stage = Self {
            processor: EventProcessor::new(state.context(), events),
            store,
            future: BTreeMap::new(),
            future_len: 0,
            requested: HashSet::new(),
        };
        let restored = stage.processor.restore().map_err(admission_fatal)?;
        info!(epoch = state.epoch, events = restored.len(), "dag restored");
        Ok((stage, restored.iter().map(|admitted| admitted.idx).collect()))
    }

    /// Shared handle to the current epoch's DAG.
    pub fn dag(&self) -> Arc<RwLock<Dag>> {
        self.processor.dag()
    }

    pub fn epoch(&self) -> Epoch {
        self.processor.epoch()
    }

    /// Admits `event` and everything it unblocks.
    pub fn process(&mut self, event: Event) -> Result<Processed, Fatal> {
        let epoch = self.epoch();
        let mut out = Processed {
            epoch,
            ..Processed::default()
        };
        if event.epoch > epoch {
            if self.future_len < FUTURE_EVENTS_CAPACITY {
                trace!(event = %event.id(), epoch = event.epoch, "buffering event of a future epoch");
                self.future.entry(event.epoch).or_default().push(event);
                self.future_len += 1;
            } else {
                debug!(event = %event.id(), epoch = event.epoch, "future epoch buffer full, event dropped");
            }
            return Ok(out);
        }

        let id = event.id();
        let parents = event.parents.clone();
        match self.processor.process(event) {
            Ok(admitted) => {
                for event in &admitted {
                    self.requested.remove(&event.event.id());
                }
                out.admitted = admitted;
            }
            Err(error) if error.is_fatal() => return Err(admission_fatal(error)),
            Err(error) => {
                let kind = error.kind();
                match kind {
                    RejectKind::UnknownParent => {
                        out.missing = parents
                            .into_iter()
                            .filter(|parent| {
                                !parent.is_zero()
                                    && !self.processor.is_known(parent)
                                    && self.requested.insert(*parent)
                            })
                            .collect();
                        trace!(event = %id, missing = out.missing.len(), "event waits for parents");
                    }
                    RejectKind::Duplicate | RejectKind::WrongEpoch => {
                        trace!(event = %id, %kind, %error, "event not admitted")
                    }
                    RejectKind::Equivocation => {}
                    _ => warn!(event = %id, %kind, %error, "event rejected"),
                }
                out.rejected = Some(kind);
            }
        }
        Ok(out)
    }

    /// Admits an event this node created and makes it durable, so that a
    /// restart never creates a second event with the same sequence.
    pub fn process_own(&mut self, event: Event) -> Result<Processed, Fatal> {
        let processed = self.process(event)?;
        if !processed.admitted.is_empty() {
            self.store.flush_events()?;
        }
        Ok(processed)
    }

    /// Forgets which parents were asked for and returns every parent still
    /// missing, to be asked for again.
    pub fn resync(&mut self) -> Vec<EventId> {
        let missing = self.processor.missing_parents();
        self.requested = missing.iter().copied().collect();
        missing
    }

    /// Seals the current epoch's DAG and opens `next`. Returns what the
    /// buffered events of the new epoch admit.
    #[instrument(skip_all, fields(sealed = self.epoch(), next = next.epoch), err)]
    pub fn switch_epoch(&mut self, next: &EpochState) -> Result<Processed, Fatal> {
        let sealed = self.epoch();
        if next.epoch <= sealed {
            return Ok(Processed {
                epoch: sealed,
                ..Processed::default()
            });
        }
        let heads = self.processor.dag().read().head_ids();
        self.store.dag().epoch(sealed)?.seal(&heads)?;
        // The sealed epoch stays readable; older ones are dropped.
        for epoch in self.store.dag().epochs()? {
            if epoch < sealed {
                self.store.dag().drop_epoch(epoch)?;
            }
        }

        self.processor
            .reset(next.context(), self.store.dag().epoch(next.epoch)?);
        self.requested.clear();
        info!(heads = heads.len(), "dag switched epoch");

        let mut out = Processed {
            epoch: next.epoch,
            ..Processed::default()
        };
        let stale: Vec<Epoch> = self.future.range(..next.epoch).map(|(epoch, _)| *epoch).collect();
        for epoch in stale {
            if let Some(events) = self.future.remove(&epoch) {
                self.future_len -= events.len();
            }
        }
        let buffered = self.future.remove(&next.epoch).unwrap_or_default();
        self.future_len -= buffered.len();
        for event in buffered {
            let processed = self.process(event)?;
            out.admitted.extend(processed.admitted);
            out.missing.extend(processed.missing);
        }
        Ok(out)
    }
}

/// Consensus over the DAG written by a [`DagStage`].
pub struct ConsensusStage {
    dag: Arc<RwLock<Dag>>,
    lachesis: Lachesis,
}

impl std::fmt::Debug for ConsensusStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusStage")
            .field("epoch", &self.lachesis.epoch())
            .field("decided", &self.lachesis.last_decided_frame())
            .finish_non_exhaustive()
    }
}

impl ConsensusStage {
    pub fn new(dag: Arc<RwLock<Dag>>, state: &EpochState) -> Self {
        Self {
            dag,
            lachesis: Lachesis::new(state.epoch, state.rules.epochs.max_epoch_frames),
        }
    }

    pub const fn epoch(&self) -> Epoch {
        self.lachesis.epoch()
    }

    /// Runs consensus over events admitted into the DAG of `epoch`. Batches
    /// decided by a replay include ones already turned into blocks; the
    /// former skips those.
    pub fn process(&mut self, epoch: Epoch, admitted: &[EventIdx]) -> Vec<DecidedBatch> {
        let dag = self.dag.read();
        if epoch != self.lachesis.epoch() || dag.epoch() != epoch {
            trace!(epoch, events = admitted.len(), "skipping events of another epoch");
            return Vec::new();
        }
        let mut batches = Vec::new();
        for idx in admitted {
            batches.extend(self.lachesis.process(&dag, *idx));
        }
        batches
    }

    pub fn switch_epoch(&mut self, next: &EpochState) {
        if next.epoch > self.lachesis.epoch() {
            self.lachesis = Lachesis::new(next.epoch, next.rules.epochs.max_epoch_frames);
        }
    }
}

fn admission_fatal(error: AdmissionError) -> Fatal {
    match error {
        AdmissionError::Storage(error) => Fatal::Storage(error),
        other => Fatal::structural(other),
    }
}
