use std::collections::{HashMap, VecDeque};

use sonic_primitives::{Event, event::EventId};
use tracing::debug;

/// Events waiting for parents that have not been admitted yet.
///
/// Bounded: once full, the oldest waiting event is dropped. An event is handed
/// back as soon as any of its missing parents arrives and simply returns here
/// if others are still missing.
#[derive(Debug)]
pub struct HangingBuffer {
    capacity: usize,
    events: HashMap<EventId, Event>,
    waiting_on: HashMap<EventId, Vec<EventId>>,
    order: VecDeque<EventId>,
}

impl HangingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: HashMap::new(),
            waiting_on: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.events.contains_key(id)
    }

    /// Parks `event` until one of `missing` is admitted.
    pub fn insert(&mut self, event: Event, missing: &[EventId]) {
        let id = event.id();
        if self.events.contains_key(&id) {
            return;
        }
        while self.events.len() >= self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if self.events.remove(&oldest).is_some() {
                debug!(event = %oldest, "hanging buffer full, dropped oldest event");
            }
        }
        for parent in missing {
            self.waiting_on.entry(*parent).or_default().push(id);
        }
        self.order.push_back(id);
        self.events.insert(id, event);
    }

    /// Takes out every event that was waiting for `parent`.
    pub fn release(&mut self, parent: &EventId) -> Vec<Event> {
        let Some(children) = self.waiting_on.remove(parent) else {
            return Vec::new();
        };
        let released: Vec<_> = children
            .into_iter()
            .filter_map(|child| self.events.remove(&child))
            .collect();
        if !released.is_empty() {
            self.order.retain(|id| self.events.contains_key(id));
        }
        released
    }

    /// Parents some event waits for that are not waiting themselves, i.e.
    /// the events to fetch from peers.
    pub fn missing_parents(&self) -> Vec<EventId> {
        let mut missing: Vec<EventId> = self
            .waiting_on
            .keys()
            .filter(|parent| !self.events.contains_key(*parent))
            .copied()
            .collect();
        missing.sort_unstable();
        missing
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.waiting_on.clear();
        self.order.clear();
    }
}
