use std::{collections::HashMap, sync::Arc};

use sonic_dag::{Dag, EventIdx};
use sonic_primitives::{Epoch, Frame, Stake};
use tracing::{debug, info};

use crate::{DecidedBatch, election::Election, ordering};

/// A root: the first event of a validator in a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Root {
    pub creator_idx: usize,
    pub idx: EventIdx,
}

/// Consensus state of one epoch.
///
/// Feed every admitted event through [`Self::process`] in admission order.
#[derive(Debug)]
pub struct Lachesis {
    epoch: Epoch,
    max_epoch_frames: Frame,
    frames: Vec<Frame>,
    roots: HashMap<Frame, Vec<Root>>,
    highest_root_frame: Frame,
    confirmed: Vec<bool>,
    election: Election,
    last_decided: Frame,
    sealed: bool,
}

impl Lachesis {
    pub fn new(epoch: Epoch, max_epoch_frames: Frame) -> Self {
        Self {
            epoch,
            max_epoch_frames,
            frames: Vec::new(),
            roots: HashMap::new(),
            highest_root_frame: 0,
            confirmed: Vec::new(),
            election: Election::new(1),
            last_decided: 0,
            sealed: false,
        }
    }

    pub const fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub const fn last_decided_frame(&self) -> Frame {
        self.last_decided
    }

    /// Whether the frame cap was reached.
    pub const fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn frame_of(&self, idx: EventIdx) -> Option<Frame> {
        self.frames.get(idx as usize).copied()
    }

    pub fn roots(&self, frame: Frame) -> &[Root] {
        self.roots.get(&frame).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn is_root(&self, idx: EventIdx) -> bool {
        self.frame_of(idx)
            .is_some_and(|frame| self.roots(frame).iter().any(|root| root.idx == idx))
    }

    /// Computes the frame of the newly admitted event `idx` and returns every
    /// batch this decides.
    pub fn process(&mut self, dag: &Dag, idx: EventIdx) -> Vec<DecidedBatch> {
        if (idx as usize) < self.frames.len() {
            return Vec::new();
        }
        debug_assert_eq!(idx as usize, self.frames.len(), "events must be fed in order");

        let event = dag.event(idx);
        let frame = self.compute_frame(dag, idx);
        let self_parent_frame = event
            .self_parent
            .and_then(|sp| self.frame_of(sp))
            .unwrap_or(0);
        self.frames.push(frame);
        self.confirmed.push(false);

        if frame <= self_parent_frame {
            return Vec::new();
        }
        let root = Root {
            creator_idx: event.creator_idx,
            idx,
        };
        self.roots.entry(frame).or_default().push(root);
        self.highest_root_frame = self.highest_root_frame.max(frame);

        let mut batches = Vec::new();
        if self.sealed {
            return batches;
        }
        let mut decided = self.election.process_root(dag, &self.roots, root, frame);
        while let Some(atropos) = decided.take() {
            let batch = self.confirm(dag, atropos);
            let seals = batch.seals_epoch;
            batches.push(batch);
            if seals {
                self.sealed = true;
                break;
            }
            decided = self.revote(dag);
        }
        batches
    }

    fn compute_frame(&self, dag: &Dag, idx: EventIdx) -> Frame {
        let event = dag.event(idx);
        let max_parent_frame = event
            .parents
            .iter()
            .filter_map(|parent| self.frame_of(*parent))
            .max()
            .unwrap_or(0);
        if max_parent_frame == 0 {
            return 1;
        }
        let validators = dag.validators();
        let caused: Stake = self
            .roots(max_parent_frame)
            .iter()
            .filter(|root| !dag.is_cheater(root.creator_idx))
            .filter(|root| dag.forkless_cause(idx, root.idx))
            .map(|root| validators.stake_at(root.creator_idx))
            .sum();
        if caused >= validators.quorum() {
            max_parent_frame + 1
        } else {
            max_parent_frame
        }
    }

    /// Starts the election of the next frame and replays the roots that are
    /// already known above it.
    fn revote(&mut self, dag: &Dag) -> Option<Root> {
        self.election = Election::new(self.last_decided + 1);
        for frame in self.election.frame() + 1..=self.highest_root_frame {
            let voters = self.roots(frame).to_vec();
            for voter in voters {
                if let Some(atropos) = self.election.process_root(dag, &self.roots, voter, frame) {
                    return Some(atropos);
                }
            }
        }
        None
    }

    fn confirm(&mut self, dag: &Dag, atropos: Root) -> DecidedBatch {
        let frame = self.election.frame();
        let mut reached = Vec::new();
        let mut stack = vec![atropos.idx];
        while let Some(idx) = stack.pop() {
            let slot = &mut self.confirmed[idx as usize];
            if *slot {
                continue;
            }
            *slot = true;
            reached.push(idx);
            stack.extend(dag.event(idx).parents.iter().copied());
        }
        let ordered = ordering::order(dag, &reached);
        let atropos_event = dag.event(atropos.idx);
        self.last_decided = frame;

        let batch = DecidedBatch {
            epoch: self.epoch,
            frame,
            atropos: atropos_event.event.id(),
            atropos_creator: atropos_event.event.creator,
            events: ordered
                .iter()
                .map(|idx| Arc::clone(&dag.event(*idx).event))
                .collect(),
            median_time: ordering::median_time(dag, atropos.idx),
            seals_epoch: frame >= self.max_epoch_frames,
        };
        if batch.seals_epoch {
            info!(epoch = self.epoch, frame, "frame cap reached, epoch is sealing");
        }
        debug!(
            epoch = self.epoch,
            frame,
            atropos = %batch.atropos,
            events = batch.events.len(),
            "decided frame"
        );
        batch
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng as _, rngs::StdRng, seq::SliceRandom as _};
    use sonic_chainspec::Upgrades;
    use sonic_dag::{
        DagStore, EventProcessor,
        testing::{EventFactory, fake_context},
    };
    use sonic_kvdb::MemoryProducer;
    use sonic_primitives::{Event, event::EventId};

    use super::*;

    fn rounds(validators: u32, count: usize) -> Vec<Vec<Event>> {
        let mut factory = EventFactory::new(fake_context(validators, Upgrades::sonic()));
        (0..count).map(|_| factory.round()).collect()
    }

    fn run(validators: u32, events: &[Event], max_frames: Frame) -> (Lachesis, Vec<DecidedBatch>) {
        let context = fake_context(validators, Upgrades::sonic());
        let store = DagStore::new(Arc::new(MemoryProducer::new()));
        let mut processor = EventProcessor::new(context, store.epoch(1).unwrap());
        let dag = processor.dag();
        let mut engine = Lachesis::new(1, max_frames);
        let mut batches = Vec::new();
        for event in events {
            for admitted in processor.process(event.clone()).unwrap() {
                batches.extend(engine.process(&dag.read(), admitted.idx));
            }
        }
        (engine, batches)
    }

    #[test]
    fn frames_advance_every_second_round() {
        let events: Vec<_> = rounds(3, 6).concat();
        let (engine, _) = run(3, &events, 1_000);
        let frames: Vec<_> = (0..events.len() as EventIdx)
            .map(|idx| engine.frame_of(idx).unwrap())
            .collect();
        assert_eq!(frames, vec![1, 1, 1, 1, 1, 1, 2, 2, 2, 2, 2, 2, 3, 3, 3, 3, 3, 3]);
        assert_eq!(engine.roots(1).len(), 3);
        assert_eq!(engine.roots(2).len(), 3);
    }

    #[test]
    fn decides_frames_and_confirms_every_event_once() {
        let events: Vec<_> = rounds(4, 12).concat();
        let (engine, batches) = run(4, &events, 1_000);
        assert!(engine.last_decided_frame() >= 3);
        assert_eq!(
            batches.iter().map(|b| b.frame).collect::<Vec<_>>(),
            (1..=engine.last_decided_frame()).collect::<Vec<_>>()
        );

        let mut seen = std::collections::HashSet::new();
        for batch in &batches {
            assert_eq!(batch.events.last().map(|e| e.id()), Some(batch.atropos));
            for id in batch.event_ids() {
                assert!(seen.insert(id), "event confirmed twice");
            }
        }
        // the first atropos is the root of the validator with the lowest id
        assert_eq!(batches[0].atropos_creator, 1);
        assert_eq!(batches[0].events.len(), 1);
    }

    #[test]
    fn admission_order_does_not_change_the_outcome() {
        let per_round = rounds(4, 12);
        let (_, expected) = run(4, &per_round.concat(), 1_000);

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..5 {
            let mut shuffled = Vec::new();
            for round in &per_round {
                let mut round = round.clone();
                round.shuffle(&mut rng);
                shuffled.extend(round);
            }
            let (_, batches) = run(4, &shuffled, 1_000);
            let ids = |batches: &[DecidedBatch]| -> Vec<Vec<EventId>> {
                batches.iter().map(|b| b.event_ids().collect()).collect()
            };
            assert_eq!(ids(&batches), ids(&expected));
            assert_eq!(
                batches.iter().map(|b| b.median_time).collect::<Vec<_>>(),
                expected.iter().map(|b| b.median_time).collect::<Vec<_>>()
            );
        }
    }

    #[test]
    fn progresses_without_a_silent_minority() {
        // validator 4 never emits; three of four still hold a quorum
        let mut factory = EventFactory::new(fake_context(4, Upgrades::sonic()));
        let mut events = Vec::new();
        for _ in 0..12 {
            let tips: Vec<_> = (1..=3).map(|id| factory.tip(id)).collect();
            for creator in 1..=3u32 {
                let others: Vec<EventId> = (1..=3u32)
                    .filter(|other| *other != creator)
                    .filter_map(|other| tips[other as usize - 1])
                    .collect();
                events.push(factory.create(creator, &others));
            }
        }
        let (engine, batches) = run(4, &events, 1_000);
        assert!(engine.last_decided_frame() >= 2);
        assert!(!batches.is_empty());
    }

    #[test]
    fn frame_cap_seals_the_epoch() {
        let events: Vec<_> = rounds(3, 16).concat();
        let (engine, batches) = run(3, &events, 2);
        assert!(engine.is_sealed());
        assert_eq!(batches.len(), 2);
        assert!(batches[1].seals_epoch);
        assert!(!batches[0].seals_epoch);
    }
}
