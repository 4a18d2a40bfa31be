//! Catching up on events a node missed.
//!
//! A starting node announces its heads with [`Gossip::Heads`]. Peers of the
//! same epoch answer with their own heads as events and ask for the heads
//! they lack; a peer that is ahead answers with the heads it sealed the
//! announced epoch with. Events whose parents are unknown are parked by the
//! DAG and their parents asked for by id with [`Gossip::EventRequest`], which
//! [`EventSync::answer`] serves from the event tables. Following parents back
//! this way reaches every event the node missed.
//!
//! Only a node that is behind answers heads with heads, so an exchange always
//! ends.

use std::sync::Arc;

use parking_lot::RwLock;
use sonic_dag::Dag;
use sonic_primitives::{Encode as _, Epoch, event::EventId};
use tracing::trace;

use crate::{error::Fatal, network::Gossip, store::ChainStore};

/// Upper bound of events in one [`Gossip::Events`] answer.
pub const MAX_EVENTS_PER_ANSWER: usize = 1_024;

#[derive(Clone)]
pub struct EventSync {
    store: Arc<ChainStore>,
    dag: Arc<RwLock<Dag>>,
}

impl std::fmt::Debug for EventSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSync").finish_non_exhaustive()
    }
}

impl EventSync {
    pub fn new(store: Arc<ChainStore>, dag: Arc<RwLock<Dag>>) -> Self {
        Self { store, dag }
    }

    /// The heads of the current epoch's DAG.
    pub fn announce(&self) -> Gossip {
        let dag = self.dag.read();
        Gossip::Heads {
            epoch: dag.epoch(),
            heads: dag.head_ids(),
        }
    }

    /// Replies to a peer's heads.
    pub fn on_heads(&self, epoch: Epoch, heads: &[EventId]) -> Result<Vec<Gossip>, Fatal> {
        let (current, unknown, ours) = {
            let dag = self.dag.read();
            let unknown: Vec<_> = heads
                .iter()
                .filter(|head| !dag.contains(head))
                .copied()
                .collect();
            (dag.epoch(), unknown, dag.head_ids())
        };
        let mut replies = Vec::new();
        if epoch == current {
            if !unknown.is_empty() {
                replies.push(Gossip::EventRequest {
                    epoch,
                    ids: unknown,
                });
            }
            replies.extend(self.answer(epoch, &ours)?);
        } else if epoch < current {
            let sealed = if self.has_epoch(epoch)? {
                self.store.dag().epoch(epoch)?.sealed_heads()?
            } else {
                None
            };
            match sealed {
                Some(sealed) => replies.extend(self.answer(epoch, &sealed)?),
                None => trace!(epoch, current, "peer is too far behind"),
            }
        } else {
            replies.push(self.announce());
        }
        Ok(replies)
    }

    /// The requested events of `epoch` that are stored locally. Epochs whose
    /// table was dropped are not answered.
    pub fn answer(&self, epoch: Epoch, ids: &[EventId]) -> Result<Option<Gossip>, Fatal> {
        if ids.is_empty() || !self.has_epoch(epoch)? {
            return Ok(None);
        }
        let table = self.store.dag().epoch(epoch)?;
        let mut events = Vec::new();
        for id in ids.iter().take(MAX_EVENTS_PER_ANSWER) {
            if let Some(event) = table.get(id)? {
                events.push(event.encode());
            }
        }
        trace!(epoch, asked = ids.len(), found = events.len(), "answering event request");
        Ok((!events.is_empty()).then_some(Gossip::Events(events)))
    }

    fn has_epoch(&self, epoch: Epoch) -> Result<bool, Fatal> {
        Ok(self.store.dag().epochs()?.contains(&epoch))
    }
}

#[cfg(test)]
mod tests {
    use sonic_chainspec::{Upgrades, genesis::FakeGenesis};
    use sonic_dag::testing::EventFactory;
    use sonic_primitives::{Decode as _, Event};

    use super::*;
    use crate::{
        launch::{Producers, open_storage},
        stages::DagStage,
    };

    fn setup() -> (DagStage, EventSync, EventFactory) {
        let genesis = FakeGenesis::new(3, Upgrades::sonic()).build().unwrap();
        let storage = open_storage(Producers::memory(), Some(&genesis)).unwrap();
        let factory = EventFactory::new(storage.store.epoch_state().context());
        let (stage, _) = DagStage::open(storage.store.clone()).unwrap();
        let sync = EventSync::new(storage.store, stage.dag());
        (stage, sync, factory)
    }

    fn decoded(message: Gossip) -> Vec<Event> {
        let Gossip::Events(raw) = message else {
            panic!("expected events, got {message:?}");
        };
        raw.iter().map(|raw| Event::decode(raw).unwrap()).collect()
    }

    #[test]
    fn requests_are_answered_from_the_event_table() {
        let (mut stage, sync, mut factory) = setup();
        let round = factory.round();
        for event in round.clone() {
            stage.process(event).unwrap();
        }
        let unknown = factory.round().remove(0).id();

        let answer = sync
            .answer(1, &[round[1].id(), unknown, round[0].id()])
            .unwrap()
            .unwrap();
        assert_eq!(decoded(answer), vec![round[1].clone(), round[0].clone()]);

        assert_eq!(sync.answer(1, &[unknown]).unwrap(), None);
        // no table for this epoch
        assert_eq!(sync.answer(7, &[round[0].id()]).unwrap(), None);
    }

    #[test]
    fn heads_of_the_same_epoch_are_exchanged() {
        let (mut stage, sync, mut factory) = setup();
        let round = factory.round();
        for event in round.clone() {
            stage.process(event).unwrap();
        }
        let theirs = factory.round().remove(0).id();

        let replies = sync.on_heads(1, &[theirs, round[2].id()]).unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(
            replies[0],
            Gossip::EventRequest {
                epoch: 1,
                ids: vec![theirs],
            }
        );
        let mut sent: Vec<_> = decoded(replies[1].clone()).iter().map(Event::id).collect();
        sent.sort_unstable();
        let mut heads: Vec<_> = round.iter().map(Event::id).collect();
        heads.sort_unstable();
        assert_eq!(sent, heads);
    }

    #[test]
    fn a_node_that_is_behind_announces_itself_back() {
        let (_stage, sync, _factory) = setup();
        assert_eq!(
            sync.on_heads(2, &[EventId::ZERO]).unwrap(),
            vec![Gossip::Heads {
                epoch: 1,
                heads: vec![],
            }]
        );
        // nothing to send for an empty dag
        assert!(sync.on_heads(1, &[]).unwrap().is_empty());
    }

    #[test]
    fn a_peer_that_is_behind_gets_the_sealed_heads() {
        let (mut stage, sync, mut factory) = setup();
        let round = factory.round();
        for event in round.clone() {
            stage.process(event).unwrap();
        }
        let mut next = (*sync.store.epoch_state()).clone();
        next.epoch = 2;
        stage.switch_epoch(&next).unwrap();

        let replies = sync.on_heads(1, &[]).unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(decoded(replies[0].clone()).len(), round.len());
    }
}
