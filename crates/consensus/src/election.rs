//! Virtual voting on the roots of one frame.

use std::collections::HashMap;

use sonic_dag::{Dag, EventIdx};
use sonic_primitives::{Frame, Stake};

use crate::Root;

#[derive(Clone, Copy, Debug)]
struct Vote {
    yes: bool,
    decided: bool,
}

/// Fame votes for the roots of `frame`, cast by the roots of later frames.
#[derive(Debug)]
pub(crate) struct Election {
    frame: Frame,
    /// Vote of a root (by event index) on a subject validator.
    votes: HashMap<(EventIdx, usize), Vote>,
    decided: HashMap<usize, bool>,
}

impl Election {
    pub(crate) fn new(frame: Frame) -> Self {
        Self {
            frame,
            votes: HashMap::new(),
            decided: HashMap::new(),
        }
    }

    pub(crate) const fn frame(&self) -> Frame {
        self.frame
    }

    /// Lets `voter`, a root of `voter_frame`, vote. Returns the atropos once the
    /// frame is decided.
    pub(crate) fn process_root(
        &mut self,
        dag: &Dag,
        roots: &HashMap<Frame, Vec<Root>>,
        voter: Root,
        voter_frame: Frame,
    ) -> Option<Root> {
        if voter_frame <= self.frame {
            return None;
        }
        let round = voter_frame - self.frame;
        let validators = dag.validators();
        let quorum = validators.quorum();
        let subjects = roots.get(&self.frame).map(Vec::as_slice).unwrap_or_default();
        let observed: Vec<&Root> = if round == 1 {
            Vec::new()
        } else {
            roots
                .get(&(voter_frame - 1))
                .map(Vec::as_slice)
                .unwrap_or_default()
                .iter()
                .filter(|root| !dag.is_cheater(root.creator_idx))
                .filter(|root| dag.forkless_cause(voter.idx, root.idx))
                .collect()
        };

        for subject in 0..validators.len() {
            if self.decided.contains_key(&subject) {
                continue;
            }
            let vote = if round == 1 {
                let yes = subjects
                    .iter()
                    .find(|root| root.creator_idx == subject)
                    .is_some_and(|root| dag.forkless_cause(voter.idx, root.idx));
                Vote {
                    yes,
                    decided: false,
                }
            } else {
                let (mut yes, mut no): (Stake, Stake) = (0, 0);
                for root in &observed {
                    if let Some(vote) = self.votes.get(&(root.idx, subject)) {
                        let stake = validators.stake_at(root.creator_idx);
                        if vote.yes {
                            yes += stake;
                        } else {
                            no += stake;
                        }
                    }
                }
                Vote {
                    yes: yes >= no,
                    decided: yes >= quorum || no >= quorum,
                }
            };
            self.votes.insert((voter.idx, subject), vote);
            if vote.decided {
                self.decided.insert(subject, vote.yes);
            }
        }
        self.atropos(dag, subjects)
    }

    /// First validator in stake order whose root is decided "yes", provided
    /// every validator before it is decided "no".
    fn atropos(&self, dag: &Dag, subjects: &[Root]) -> Option<Root> {
        let validators = dag.validators();
        for id in validators.by_stake() {
            let subject = validators.index_of(id)?;
            match self.decided.get(&subject) {
                None => return None,
                Some(false) => continue,
                Some(true) => {
                    if let Some(root) = subjects.iter().find(|root| root.creator_idx == subject) {
                        return Some(*root);
                    }
                }
            }
        }
        None
    }
}
