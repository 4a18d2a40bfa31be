//! A deterministic network of validator nodes in one thread.
//!
//! [`FakeNet`] runs one [`NodeCore`] per genesis validator over a shared
//! [`ManualClock`]. Gossip goes into a single FIFO queue and is delivered in
//! order, broadcasts to every other running node and sync answers to their
//! one recipient. A run depends only on the sequence of calls made on the
//! network, never on wall-clock timing or scheduling. Node `idx` is peer
//! `idx` to the others.

use std::{collections::VecDeque, path::PathBuf, sync::Arc, time::Duration};

use alloy_primitives::B256;
use parking_lot::Mutex;
use sonic_chainspec::{
    Genesis,
    genesis::fake::{fake_bls_key, fake_key},
};
use sonic_kvdb::DataDir;
use sonic_primitives::ValidatorId;
use tracing::{debug, warn};

use crate::{
    clock::ManualClock,
    error::Fatal,
    former::CommittedBlock,
    ingress::SubmitError,
    launch::{Producers, open_datadir, open_storage, write_errlock},
    network::{Gossip, Network, PeerId},
    node_core::{CoreOptions, NodeCore, ValidatorKeys},
    rpc::RpcContext,
    store::ChainHead,
};

/// Default clock step of [`FakeNet::step`].
pub const DEFAULT_STEP: Duration = Duration::from_millis(100);

/// Sender, recipient if not a broadcast, and the message.
type Queue = Arc<Mutex<VecDeque<(PeerId, Option<PeerId>, Gossip)>>>;

/// Outbound side of one node: everything it sends lands in the shared queue.
#[derive(Clone, Debug)]
struct QueuedNetwork {
    from: PeerId,
    queue: Queue,
}

impl Network for QueuedNetwork {
    fn broadcast(&self, message: Gossip) {
        self.queue.lock().push_back((self.from, None, message));
    }

    fn send(&self, peer: PeerId, message: Gossip) {
        self.queue.lock().push_back((self.from, Some(peer), message));
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FakeNetError {
    #[error("node `{0}` is not running")]
    NotRunning(usize),
    #[error(transparent)]
    Submit(#[from] SubmitError),
}

/// Where a fake node keeps its databases.
#[derive(Clone, Debug)]
pub enum Backend {
    /// In-memory databases that survive restarts of the node.
    Memory(Producers),
    /// Sled databases under a data directory.
    DataDir(PathBuf),
}

struct FakeNode {
    id: ValidatorId,
    backend: Backend,
    core: Option<NodeCore>,
    /// Every block the node committed, across restarts.
    committed: Vec<Arc<CommittedBlock>>,
}

pub struct FakeNet {
    genesis: Genesis,
    clock: ManualClock,
    options: CoreOptions,
    queue: Queue,
    nodes: Vec<FakeNode>,
}

impl std::fmt::Debug for FakeNet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeNet")
            .field("now", &crate::clock::Clock::now(&self.clock))
            .field("nodes", &self.nodes.len())
            .field("queued", &self.queue.lock().len())
            .finish_non_exhaustive()
    }
}

impl FakeNet {
    /// One validator node per genesis validator, on in-memory databases.
    pub fn new(genesis: Genesis) -> Result<Self, Fatal> {
        let backends = genesis
            .validators
            .iter()
            .map(|_| Backend::Memory(Producers::memory()))
            .collect();
        Self::with_backends(genesis, backends)
    }

    /// Nodes with data directories `<root>/node<id>`.
    pub fn with_datadirs(genesis: Genesis, root: impl Into<PathBuf>) -> Result<Self, Fatal> {
        let root = root.into();
        let backends = genesis
            .validators
            .iter()
            .map(|validator| Backend::DataDir(root.join(format!("node{}", validator.id))))
            .collect();
        Self::with_backends(genesis, backends)
    }

    /// Validator `i + 1` runs on `backends[i]`.
    pub fn with_backends(genesis: Genesis, backends: Vec<Backend>) -> Result<Self, Fatal> {
        let mut net = Self {
            clock: ManualClock::new(genesis.time.saturating_add(Duration::from_secs(1))),
            options: CoreOptions {
                emit: true,
                ..CoreOptions::default()
            },
            queue: Queue::default(),
            nodes: genesis
                .validators
                .iter()
                .zip(backends)
                .map(|(validator, backend)| FakeNode {
                    id: validator.id,
                    backend,
                    core: None,
                    committed: Vec::new(),
                })
                .collect(),
            genesis,
        };
        for idx in 0..net.nodes.len() {
            net.start(idx)?;
        }
        net.deliver()?;
        Ok(net)
    }

    pub const fn genesis(&self) -> &Genesis {
        &self.genesis
    }

    pub const fn clock(&self) -> &ManualClock {
        &self.clock
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The running core of node `idx`.
    pub fn node(&self, idx: usize) -> Option<&NodeCore> {
        self.nodes.get(idx)?.core.as_ref()
    }

    pub fn head(&self, idx: usize) -> Option<ChainHead> {
        self.node(idx).map(|core| core.storage().store.head())
    }

    /// Blocks node `idx` committed since the network started.
    pub fn committed(&self, idx: usize) -> &[Arc<CommittedBlock>] {
        self.nodes
            .get(idx)
            .map_or(&[][..], |node| node.committed.as_slice())
    }

    /// Read access for the RPC handlers of node `idx`.
    pub fn rpc(&self, idx: usize) -> Option<RpcContext> {
        let core = self.node(idx)?;
        Some(RpcContext {
            store: core.storage().store.clone(),
            state: core.storage().state().clone(),
            dag: core.dag().dag(),
            ingress: core.ingress().clone(),
        })
    }

    /// Submits a transaction at node `idx`, which relays it to the others.
    pub fn submit(&mut self, idx: usize, raw: &[u8]) -> Result<B256, FakeNetError> {
        let core = self.node(idx).ok_or(FakeNetError::NotRunning(idx))?;
        let hash = core.submit_raw(raw)?;
        // Relayed transactions cannot fail a node.
        if let Err(fatal) = self.deliver() {
            warn!(%fatal, "delivery after submit failed");
        }
        Ok(hash)
    }

    /// Advances the clock by `by`, lets every node emit and ask again for
    /// parents nobody answered, and delivers all gossip.
    pub fn step(&mut self, by: Duration) -> Result<(), Fatal> {
        self.clock.advance(by);
        for idx in 0..self.nodes.len() {
            let Some(core) = self.nodes[idx].core.as_mut() else {
                continue;
            };
            let result = core.tick();
            core.resync();
            self.collect(idx);
            self.fail_on(idx, result)?;
            self.deliver()?;
        }
        Ok(())
    }

    /// Steps for `duration` of clock time.
    pub fn run_for(&mut self, duration: Duration, step: Duration) -> Result<(), Fatal> {
        let mut elapsed = Duration::ZERO;
        while elapsed < duration {
            self.step(step)?;
            elapsed += step;
        }
        Ok(())
    }

    /// Steps until `done` holds or `limit` of clock time passed. Returns
    /// whether `done` held.
    pub fn run_until(
        &mut self,
        step: Duration,
        limit: Duration,
        mut done: impl FnMut(&Self) -> bool,
    ) -> Result<bool, Fatal> {
        let mut elapsed = Duration::ZERO;
        while !done(self) {
            if elapsed >= limit {
                return Ok(false);
            }
            self.step(step)?;
            elapsed += step;
        }
        Ok(true)
    }

    /// Steps until every running node reached block `number`.
    pub fn run_until_block(&mut self, number: u64, limit: Duration) -> Result<bool, Fatal> {
        self.run_until(DEFAULT_STEP, limit, |net| {
            net.nodes
                .iter()
                .filter_map(|node| node.core.as_ref())
                .all(|core| core.storage().store.head().number >= number)
        })
    }

    /// Drops node `idx` as if it crashed: gossip still in flight to it is lost
    /// and its databases keep only what it flushed.
    pub fn stop(&mut self, idx: usize) {
        if let Some(node) = self.nodes.get_mut(idx)
            && node.core.take().is_some()
        {
            debug!(validator = node.id, "node stopped");
        }
    }

    /// Starts node `idx` again on its databases.
    pub fn restart(&mut self, idx: usize) -> Result<(), Fatal> {
        self.stop(idx);
        self.start(idx)?;
        self.deliver()
    }

    fn start(&mut self, idx: usize) -> Result<(), Fatal> {
        let Some(node) = self.nodes.get(idx) else {
            return Err(Fatal::structural(format!("fake network has no node {idx}")));
        };
        let keys = ValidatorKeys {
            id: node.id,
            event_key: fake_key(node.id).map_err(Fatal::structural)?,
            bls_key: fake_bls_key(node.id).map_err(Fatal::structural)?,
        };
        let storage = match &node.backend {
            Backend::Memory(producers) => open_storage(producers.clone(), Some(&self.genesis))?,
            Backend::DataDir(root) => {
                let datadir = DataDir::new(root);
                open_datadir(&datadir, Some(&self.genesis)).inspect_err(|fatal| {
                    write_errlock(&datadir, fatal);
                })?
            }
        };
        let network = Arc::new(QueuedNetwork {
            from: idx,
            queue: self.queue.clone(),
        });
        let core = NodeCore::open(
            storage,
            Some(keys),
            Arc::new(self.clock.clone()),
            network,
            self.options.clone(),
        );
        let core = self.fail_on(idx, core)?;
        self.nodes[idx].core = Some(core);
        self.collect(idx);
        Ok(())
    }

    /// Delivers queued gossip until the queue is empty.
    fn deliver(&mut self) -> Result<(), Fatal> {
        loop {
            let Some((from, to, message)) = self.queue.lock().pop_front() else {
                return Ok(());
            };
            for idx in 0..self.nodes.len() {
                if idx == from || to.is_some_and(|to| to != idx) {
                    continue;
                }
                let Some(core) = self.nodes[idx].core.as_mut() else {
                    continue;
                };
                let result = core.handle_gossip(from, message.clone());
                self.collect(idx);
                self.fail_on(idx, result)?;
            }
        }
    }

    fn collect(&mut self, idx: usize) {
        let node = &mut self.nodes[idx];
        if let Some(core) = node.core.as_mut() {
            node.committed.extend(core.take_committed());
        }
    }

    /// Stops node `idx` on a fatal error, recording it like a real node would.
    fn fail_on<T>(&mut self, idx: usize, result: Result<T, Fatal>) -> Result<T, Fatal> {
        result.inspect_err(|fatal| {
            let node = &mut self.nodes[idx];
            warn!(validator = node.id, error = %fatal.report(), "fake node failed");
            node.core = None;
            if let Backend::DataDir(root) = &node.backend {
                write_errlock(&DataDir::new(root), fatal);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use sonic_chainspec::{Upgrades, genesis::FakeGenesis};
    use sonic_primitives::Decode as _;

    use super::*;

    #[test]
    fn validators_agree_on_blocks() {
        let genesis = FakeGenesis::new(3, Upgrades::sonic()).build().unwrap();
        let mut net = FakeNet::new(genesis).unwrap();
        assert!(net.run_until_block(3, Duration::from_secs(60)).unwrap());

        let first = net.node(0).unwrap().storage().store.block(3).unwrap().unwrap();
        for idx in 1..net.len() {
            let block = net.node(idx).unwrap().storage().store.block(3).unwrap().unwrap();
            assert_eq!(block, first);
        }
        assert!(net.committed(0).len() >= 3);
    }

    #[test]
    fn restarted_node_resumes_from_its_head() {
        let genesis = FakeGenesis::new(3, Upgrades::sonic()).build().unwrap();
        let mut net = FakeNet::new(genesis).unwrap();
        assert!(net.run_until_block(2, Duration::from_secs(60)).unwrap());
        let head = net.head(0).unwrap();

        net.stop(0);
        assert!(net.head(0).is_none());
        assert!(matches!(net.submit(0, &[]), Err(FakeNetError::NotRunning(0))));
        net.restart(0).unwrap();
        let resumed = net.head(0).unwrap();
        assert!(resumed.number >= head.number);
        assert_eq!(
            net.node(0).unwrap().storage().store.block(head.number).unwrap().unwrap().hash(),
            head.hash
        );
        assert!(net.run_until_block(head.number + 2, Duration::from_secs(60)).unwrap());
    }

    #[test]
    fn stopped_node_catches_up_after_restart() {
        let genesis = FakeGenesis::new(4, Upgrades::sonic()).build().unwrap();
        let mut net = FakeNet::new(genesis).unwrap();
        assert!(net.run_until_block(2, Duration::from_secs(60)).unwrap());
        let stopped_at = net.head(0).unwrap().number;

        // Three of four validators keep the chain going.
        net.stop(0);
        assert!(net.run_until_block(stopped_at + 6, Duration::from_secs(120)).unwrap());
        let target = net.head(1).unwrap().number;

        net.restart(0).unwrap();
        assert!(
            net.run_until(DEFAULT_STEP, Duration::from_secs(60), |net| {
                net.head(0).is_some_and(|head| head.number >= target)
            })
            .unwrap()
        );
        let block = |idx: usize| {
            net.node(idx)
                .unwrap()
                .storage()
                .store
                .block(target)
                .unwrap()
                .unwrap()
        };
        assert_eq!(block(0), block(1));
    }

    #[test]
    fn emitted_event_survives_a_crash_before_the_next_block() {
        let genesis = FakeGenesis::new(3, Upgrades::sonic()).build().unwrap();
        let producers = Producers::memory();
        let backends = vec![
            Backend::Memory(producers.clone()),
            Backend::Memory(Producers::memory()),
            Backend::Memory(Producers::memory()),
        ];
        let mut net = FakeNet::with_backends(genesis, backends).unwrap();
        let head = net.head(0).unwrap();

        // Only node 0 runs, so nothing gets decided.
        let mut emitted = false;
        for _ in 0..50 {
            net.clock.advance(DEFAULT_STEP);
            if net.nodes[0].core.as_mut().unwrap().tick().unwrap() {
                emitted = true;
                break;
            }
        }
        assert!(emitted);
        let Some((0, None, Gossip::Event(raw))) = net.queue.lock().back().cloned() else {
            panic!("the event was not broadcast");
        };
        let event = sonic_primitives::Event::decode(&raw).unwrap();
        assert_eq!(event.seq, 1);

        net.stop(0);
        {
            let storage = open_storage(producers, None).unwrap();
            assert_eq!(storage.store.head(), head);
            assert!(storage.store.dag().epoch(1).unwrap().get(&event.id()).unwrap().is_some());
        }

        // The restarted node goes on from its first event instead of creating
        // a conflicting one.
        net.restart(0).unwrap();
        assert!(net.run_until_block(head.number + 2, Duration::from_secs(60)).unwrap());
        for idx in 0..net.len() {
            let dag = net.node(idx).unwrap().dag().dag();
            let dag = dag.read();
            assert!(!dag.is_cheater(0));
            assert!(dag.contains(&event.id()) || dag.epoch() > event.epoch);
        }
    }
}
