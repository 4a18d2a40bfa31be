//! Per-event vectors over the validator set.
//!
//! `highest_before[e][v]` is the highest sequence of validator `v` that event
//! `e` observes (itself included). `lowest_after[e][v]` is the lowest sequence
//! of `v`'s events that observe `e`, or zero while none does. Together they
//! answer the forkless-cause query of virtual voting: `a` forkless-causes `b`
//! when a quorum of validators have an event that observes `b` and is itself
//! observed by `a`.

use sonic_primitives::{Seq, Stake, Validators};

use crate::EventIdx;

#[derive(Debug, Default)]
pub struct VectorClock {
    width: usize,
    highest_before: Vec<Box<[Seq]>>,
    lowest_after: Vec<Box<[Seq]>>,
}

impl VectorClock {
    pub fn new(width: usize) -> Self {
        Self {
            width,
            highest_before: Vec::new(),
            lowest_after: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.highest_before.len()
    }

    pub fn is_empty(&self) -> bool {
        self.highest_before.is_empty()
    }

    /// Adds the vectors of a new event.
    ///
    /// `ancestors_of` lists the direct parents of an event and is used to walk
    /// backwards from `parents` while filling `lowest_after`; the walk stops at
    /// events already observed by an earlier event of the same creator.
    pub(crate) fn push<'a, F>(
        &mut self,
        idx: EventIdx,
        creator: usize,
        seq: Seq,
        parents: &[EventIdx],
        ancestors_of: F,
    ) where
        F: Fn(EventIdx) -> &'a [EventIdx],
    {
        debug_assert_eq!(idx as usize, self.highest_before.len());

        let mut highest = vec![0; self.width].into_boxed_slice();
        for parent in parents {
            for (slot, seen) in highest.iter_mut().zip(self.highest_before[*parent as usize].iter())
            {
                *slot = (*slot).max(*seen);
            }
        }
        highest[creator] = seq;
        self.highest_before.push(highest);

        let mut lowest = vec![0; self.width].into_boxed_slice();
        lowest[creator] = seq;
        self.lowest_after.push(lowest);

        let mut stack: Vec<EventIdx> = parents.to_vec();
        while let Some(ancestor) = stack.pop() {
            let slot = &mut self.lowest_after[ancestor as usize][creator];
            if *slot != 0 {
                continue;
            }
            *slot = seq;
            stack.extend_from_slice(ancestors_of(ancestor));
        }
    }

    pub fn highest_before(&self, idx: EventIdx) -> &[Seq] {
        &self.highest_before[idx as usize]
    }

    pub fn lowest_after(&self, idx: EventIdx) -> &[Seq] {
        &self.lowest_after[idx as usize]
    }

    /// Whether `a` has `b` among its ancestors (or is `b`).
    pub fn observes(&self, a: EventIdx, b: EventIdx, b_creator: usize, b_seq: Seq) -> bool {
        a == b || self.highest_before[a as usize][b_creator] >= b_seq
    }

    /// Stake of the validators through which `a` observes `b`.
    ///
    /// Validators flagged in `excluded` do not count.
    pub fn forkless_cause_stake(
        &self,
        a: EventIdx,
        b: EventIdx,
        validators: &Validators,
        excluded: &[bool],
    ) -> Stake {
        let highest = &self.highest_before[a as usize];
        let lowest = &self.lowest_after[b as usize];
        highest
            .iter()
            .zip(lowest.iter())
            .enumerate()
            .filter(|(v, (hb, la))| {
                **la != 0 && **la <= **hb && !excluded.get(*v).copied().unwrap_or(false)
            })
            .map(|(v, _)| validators.stake_at(v))
            .sum()
    }

    pub fn forkless_cause(
        &self,
        a: EventIdx,
        b: EventIdx,
        validators: &Validators,
        excluded: &[bool],
    ) -> bool {
        self.forkless_cause_stake(a, b, validators, excluded) >= validators.quorum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Three validators with equal stake, two rounds:
    //   a1 b1 c1
    //   a2(a1,b1,c1) b2(b1,a1,c1) c2(c1,a1)
    struct Fixture {
        clock: VectorClock,
        parents: Vec<Vec<EventIdx>>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                clock: VectorClock::new(3),
                parents: Vec::new(),
            }
        }

        fn push(&mut self, creator: usize, seq: Seq, parents: &[EventIdx]) -> EventIdx {
            let idx = self.parents.len() as EventIdx;
            self.parents.push(parents.to_vec());
            let table = &self.parents;
            self.clock
                .push(idx, creator, seq, parents, |e| table[e as usize].as_slice());
            idx
        }
    }

    #[test]
    fn quorum_of_observers_forkless_causes() {
        let validators = Validators::new([(1, 1), (2, 1), (3, 1)]);
        let mut f = Fixture::new();
        let a1 = f.push(0, 1, &[]);
        let b1 = f.push(1, 1, &[]);
        let c1 = f.push(2, 1, &[]);
        let a2 = f.push(0, 2, &[a1, b1, c1]);
        let b2 = f.push(1, 2, &[b1, a1, c1]);
        let c2 = f.push(2, 2, &[c1, a1]);

        assert_eq!(f.clock.highest_before(a2), &[2, 1, 1]);
        assert_eq!(f.clock.lowest_after(a1), &[1, 2, 2]);
        assert_eq!(f.clock.lowest_after(b1), &[2, 1, 0]);

        assert!(f.clock.observes(c2, a1, 0, 1));
        assert!(!f.clock.observes(c2, b1, 1, 1));

        // a2 sees a1 only through itself
        assert_eq!(f.clock.forkless_cause_stake(a2, a1, &validators, &[]), 1);

        let d = f.push(0, 3, &[a2, b2, c2]);
        assert!(f.clock.forkless_cause(d, a1, &validators, &[]));
        assert!(f.clock.forkless_cause(d, c1, &validators, &[]));
        // c2 does not observe b1
        assert_eq!(f.clock.forkless_cause_stake(d, b1, &validators, &[]), 2);
        assert!(!f.clock.forkless_cause(d, b1, &validators, &[]));
        assert_eq!(
            f.clock.forkless_cause_stake(d, b1, &validators, &[false, true, false]),
            1
        );
    }
}
