//! Gossip between nodes.
//!
//! Peer-to-peer transport is outside the node core: it only needs something
//! that broadcasts [`Gossip`] to every other node and answers a single peer.
//! Inbound messages carry the [`PeerId`] they came from. [`InMemoryNetwork`]
//! connects nodes running in one process.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use sonic_primitives::{Epoch, event::EventId};
use sonic_scc::{BlockStatement, CommitteeStatement, PartialSignature};
use tokio::sync::mpsc;
use tracing::trace;

/// Identifies a connected peer on the transport a node runs on.
pub type PeerId = usize;

/// A message as received, with its sender.
pub type Inbound = (PeerId, Gossip);

/// A message exchanged between nodes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Gossip {
    /// Wire-encoded event.
    Event(Bytes),
    /// EIP-2718 encoded transaction.
    Transaction(Bytes),
    /// Partial signature of a block, by a member of the committee of `epoch`.
    BlockSignature {
        epoch: Epoch,
        statement: BlockStatement,
        partial: PartialSignature,
    },
    /// Partial signature of the committee of `statement.epoch`, by a member of
    /// the committee of `signing_epoch`.
    CommitteeSignature {
        signing_epoch: Epoch,
        statement: CommitteeStatement,
        partial: PartialSignature,
    },
    /// The sender's latest events of `epoch`, announced when it starts.
    Heads { epoch: Epoch, heads: Vec<EventId> },
    /// Asks for the events `ids` of `epoch`.
    EventRequest { epoch: Epoch, ids: Vec<EventId> },
    /// Wire-encoded events sent to a single peer, in answer to
    /// [`Gossip::Heads`] or [`Gossip::EventRequest`].
    Events(Vec<Bytes>),
}

impl Gossip {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Event(_) => "event",
            Self::Transaction(_) => "transaction",
            Self::BlockSignature { .. } => "block_signature",
            Self::CommitteeSignature { .. } => "committee_signature",
            Self::Heads { .. } => "heads",
            Self::EventRequest { .. } => "event_request",
            Self::Events(_) => "events",
        }
    }
}

/// Outbound side of the gossip layer.
pub trait Network: Send + Sync {
    /// Sends `message` to every other node, best effort.
    fn broadcast(&self, message: Gossip);

    /// Sends `message` to `peer` only, best effort.
    fn send(&self, peer: PeerId, message: Gossip);
}

/// A network that drops everything; used by nodes running alone.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoNetwork;

impl Network for NoNetwork {
    fn broadcast(&self, _message: Gossip) {}

    fn send(&self, _peer: PeerId, _message: Gossip) {}
}

type Peers = Arc<Mutex<Vec<(PeerId, mpsc::UnboundedSender<Inbound>)>>>;

/// Hub connecting nodes of one process.
#[derive(Clone, Debug, Default)]
pub struct InMemoryNetwork {
    peers: Peers,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects a new node and returns its outbound handle and inbox.
    pub fn join(&self) -> (InMemoryPeer, mpsc::UnboundedReceiver<Inbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut peers = self.peers.lock();
        let id = peers.last().map_or(0, |(id, _)| id + 1);
        peers.push((id, tx));
        (
            InMemoryPeer {
                id,
                peers: self.peers.clone(),
            },
            rx,
        )
    }
}

/// Outbound handle of one node on an [`InMemoryNetwork`].
#[derive(Clone, Debug)]
pub struct InMemoryPeer {
    id: PeerId,
    peers: Peers,
}

impl InMemoryPeer {
    pub const fn id(&self) -> PeerId {
        self.id
    }
}

impl Network for InMemoryPeer {
    fn broadcast(&self, message: Gossip) {
        let mut peers = self.peers.lock();
        // Closed inboxes belong to nodes that stopped.
        peers.retain(|(id, tx)| *id == self.id || !tx.is_closed());
        trace!(kind = message.kind(), peers = peers.len().saturating_sub(1), "broadcast");
        for (id, tx) in peers.iter() {
            if *id != self.id {
                let _ = tx.send((self.id, message.clone()));
            }
        }
    }

    fn send(&self, peer: PeerId, message: Gossip) {
        let peers = self.peers.lock();
        match peers.iter().find(|(id, _)| *id == peer) {
            Some((_, tx)) => {
                trace!(kind = message.kind(), peer, "send");
                let _ = tx.send((self.id, message));
            }
            None => trace!(kind = message.kind(), peer, "peer is gone, message dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_skips_the_sender_and_stopped_peers() {
        let network = InMemoryNetwork::new();
        let (a, mut a_rx) = network.join();
        let (_b, mut b_rx) = network.join();
        let (_c, c_rx) = network.join();
        drop(c_rx);

        a.broadcast(Gossip::Transaction(Bytes::from_static(b"tx")));
        assert_eq!(
            b_rx.try_recv().unwrap(),
            (a.id(), Gossip::Transaction(Bytes::from_static(b"tx")))
        );
        assert!(a_rx.try_recv().is_err());
        assert_eq!(network.peers.lock().len(), 2);
    }

    #[test]
    fn send_reaches_one_peer_with_the_sender() {
        let network = InMemoryNetwork::new();
        let (a, _a_rx) = network.join();
        let (b, mut b_rx) = network.join();
        let (_c, mut c_rx) = network.join();

        a.send(b.id(), Gossip::Events(vec![Bytes::from_static(b"event")]));
        assert_eq!(
            b_rx.try_recv().unwrap(),
            (a.id(), Gossip::Events(vec![Bytes::from_static(b"event")]))
        );
        assert!(c_rx.try_recv().is_err());

        // unknown peers are ignored
        a.send(42, Gossip::Events(Vec::new()));
    }
}
