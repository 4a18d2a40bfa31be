use std::sync::Arc;

use sonic_primitives::{Epoch, Event, Frame, Timestamp, ValidatorId, event::EventId};

/// Events confirmed by one atropos, in final order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecidedBatch {
    pub epoch: Epoch,
    pub frame: Frame,
    pub atropos: EventId,
    pub atropos_creator: ValidatorId,
    pub events: Vec<Arc<Event>>,
    /// Stake-weighted median of the creation times the atropos observes.
    pub median_time: Timestamp,
    /// The frame cap of the epoch is reached; nothing is decided after this batch.
    pub seals_epoch: bool,
}

impl DecidedBatch {
    pub fn event_ids(&self) -> impl Iterator<Item = EventId> + '_ {
        self.events.iter().map(|event| event.id())
    }
}
