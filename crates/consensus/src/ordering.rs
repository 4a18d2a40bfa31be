//! Deterministic order of the events confirmed by an atropos.

use std::{
    cmp::{Ordering, Reverse},
    collections::{BinaryHeap, HashMap},
};

use sonic_dag::{Dag, EventIdx};
use sonic_primitives::{Stake, Timestamp, event::EventId};

/// Stake-weighted median of the creation times of the latest events `idx`
/// observes from every honest validator. Falls back to the epoch start time
/// when nothing is observed.
pub fn median_time(dag: &Dag, idx: EventIdx) -> Timestamp {
    let validators = dag.validators();
    let mut points: Vec<(Timestamp, Stake)> = dag
        .clock()
        .highest_before(idx)
        .iter()
        .enumerate()
        .filter(|(v, seq)| **seq > 0 && !dag.is_cheater(*v))
        .filter_map(|(v, seq)| {
            let observed = dag.event_at(v, *seq)?;
            Some((
                dag.event(observed).event.creation_time,
                validators.stake_at(v),
            ))
        })
        .collect();
    if points.is_empty() {
        return dag.context().start_time;
    }
    points.sort_unstable();

    let total: Stake = points.iter().map(|(_, stake)| stake).sum();
    let mut acc = 0;
    for (time, stake) in &points {
        acc += stake;
        if acc * 2 >= total {
            return *time;
        }
    }
    points[points.len() - 1].0
}

#[derive(PartialEq, Eq)]
struct Key {
    median_time: Timestamp,
    stake: Reverse<Stake>,
    id: EventId,
    idx: EventIdx,
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.median_time, self.stake, self.id).cmp(&(other.median_time, other.stake, other.id))
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Orders `events` so that parents come first; among events whose parents are
/// all placed, the earliest median time goes first, then the creator with more
/// stake, then the lower hash.
pub fn order(dag: &Dag, events: &[EventIdx]) -> Vec<EventIdx> {
    let members: HashMap<EventIdx, usize> =
        events.iter().enumerate().map(|(pos, idx)| (*idx, pos)).collect();
    let mut pending = vec![0usize; events.len()];
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); events.len()];
    for (pos, idx) in events.iter().enumerate() {
        for parent in &dag.event(*idx).parents {
            if let Some(parent_pos) = members.get(parent) {
                pending[pos] += 1;
                children[*parent_pos].push(pos);
            }
        }
    }

    let key = |pos: usize| {
        let idx = events[pos];
        let event = dag.event(idx);
        Reverse(Key {
            median_time: median_time(dag, idx),
            stake: Reverse(dag.validators().stake_at(event.creator_idx)),
            id: event.event.id(),
            idx,
        })
    };
    let mut ready: BinaryHeap<Reverse<Key>> = pending
        .iter()
        .enumerate()
        .filter(|(_, count)| **count == 0)
        .map(|(pos, _)| key(pos))
        .collect();

    let mut ordered = Vec::with_capacity(events.len());
    while let Some(Reverse(next)) = ready.pop() {
        ordered.push(next.idx);
        let pos = members[&next.idx];
        for child in &children[pos] {
            pending[*child] -= 1;
            if pending[*child] == 0 {
                ready.push(key(*child));
            }
        }
    }
    ordered
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sonic_chainspec::Upgrades;
    use sonic_dag::{
        DagStore, EventProcessor,
        testing::{EventFactory, fake_context},
    };
    use sonic_kvdb::MemoryProducer;

    use super::*;

    fn build(rounds: usize) -> EventProcessor {
        let context = fake_context(4, Upgrades::sonic());
        let store = DagStore::new(Arc::new(MemoryProducer::new()));
        let mut processor = EventProcessor::new(context.clone(), store.epoch(1).unwrap());
        let mut factory = EventFactory::new(context);
        for _ in 0..rounds {
            for event in factory.round() {
                processor.process(event).unwrap();
            }
        }
        processor
    }

    #[test]
    fn parents_precede_children() {
        let processor = build(3);
        let dag = processor.dag();
        let dag = dag.read();
        let mut all: Vec<EventIdx> = (0..dag.len() as EventIdx).collect();
        all.reverse();
        let ordered = order(&dag, &all);
        assert_eq!(ordered.len(), all.len());
        for (pos, idx) in ordered.iter().enumerate() {
            for parent in &dag.event(*idx).parents {
                assert!(ordered[..pos].contains(parent));
            }
        }
    }

    #[test]
    fn median_time_is_within_observed_times() {
        let processor = build(2);
        let dag = processor.dag();
        let dag = dag.read();
        let last = dag.len() as EventIdx - 1;
        let median = median_time(&dag, last);
        let times: Vec<_> = dag.iter().map(|(_, e)| e.event.creation_time).collect();
        assert!(times.iter().min().unwrap() <= &median);
        assert!(&median <= times.iter().max().unwrap());
        // the first event observes only itself
        assert_eq!(median_time(&dag, 0), dag.event(0).event.creation_time);
    }
}
