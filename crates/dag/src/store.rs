//! Persistence of events, one `lachesis-<epoch>` table per epoch.

use std::sync::Arc;

use alloy_primitives::B256;
use sonic_kvdb::{Producer, Result, StoreError, Table};
use sonic_primitives::{Decode as _, Encode as _, Epoch, Event, event::EventId};

const TABLE_PREFIX: &str = "lachesis-";
const EVENT_PREFIX: &[u8] = b"e";
const HEADS_KEY: &[u8] = b"heads";

/// Opens the per-epoch event tables.
#[derive(Clone)]
pub struct DagStore {
    producer: Arc<dyn Producer>,
}

impl DagStore {
    pub fn new(producer: Arc<dyn Producer>) -> Self {
        Self { producer }
    }

    pub fn table_name(epoch: Epoch) -> String {
        format!("{TABLE_PREFIX}{epoch}")
    }

    pub fn epoch(&self, epoch: Epoch) -> Result<EpochEvents> {
        Ok(EpochEvents {
            epoch,
            table: self.producer.open_table(&Self::table_name(epoch))?,
        })
    }

    /// Epochs that still have an event table, ascending.
    pub fn epochs(&self) -> Result<Vec<Epoch>> {
        let mut epochs: Vec<Epoch> = self
            .producer
            .table_names()?
            .iter()
            .filter_map(|name| name.strip_prefix(TABLE_PREFIX)?.parse().ok())
            .collect();
        epochs.sort_unstable();
        Ok(epochs)
    }

    pub fn drop_epoch(&self, epoch: Epoch) -> Result<()> {
        self.producer.drop_table(&Self::table_name(epoch))
    }
}

/// Events of one epoch.
#[derive(Clone)]
pub struct EpochEvents {
    epoch: Epoch,
    table: Arc<dyn Table>,
}

impl EpochEvents {
    pub const fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn put(&self, event: &Event) -> Result<()> {
        self.table.put(&event_key(&event.id()), &event.encode())
    }

    pub fn get(&self, id: &EventId) -> Result<Option<Event>> {
        self.table
            .get(&event_key(id))?
            .map(|raw| self.decode(&raw))
            .transpose()
    }

    /// All events in an order where parents precede children.
    pub fn load(&self) -> Result<Vec<Event>> {
        let mut events = self
            .table
            .scan_prefix(EVENT_PREFIX)?
            .into_iter()
            .map(|(_, raw)| self.decode(&raw))
            .collect::<Result<Vec<_>>>()?;
        events.sort_by_key(|event| (event.lamport, event.id()));
        Ok(events)
    }

    /// Records the final heads of a sealed epoch.
    pub fn seal(&self, heads: &[EventId]) -> Result<()> {
        let raw: Vec<u8> = heads
            .iter()
            .flat_map(|head| head.as_slice().iter().copied())
            .collect();
        self.table.put(HEADS_KEY, &raw)
    }

    /// Heads recorded by [`Self::seal`].
    pub fn sealed_heads(&self) -> Result<Option<Vec<EventId>>> {
        let Some(raw) = self.table.get(HEADS_KEY)? else {
            return Ok(None);
        };
        if raw.len() % 32 != 0 {
            return Err(StoreError::corrupted(
                DagStore::table_name(self.epoch),
                "heads record is not a list of hashes",
            ));
        }
        Ok(Some(raw.chunks_exact(32).map(B256::from_slice).collect()))
    }

    fn decode(&self, raw: &[u8]) -> Result<Event> {
        Event::decode(raw).map_err(|err| StoreError::corrupted(DagStore::table_name(self.epoch), err))
    }
}

fn event_key(id: &EventId) -> Vec<u8> {
    [EVENT_PREFIX, id.as_slice()].concat()
}
