//! All stages of a node wired together on one thread.
//!
//! [`NodeCore`] takes gossip, local transactions and emitter ticks, and runs
//! each through admission, consensus, block formation and certification
//! before returning, and answers the sync requests of its peers. It performs
//! no I/O of its own beyond the storage and the [`Network`] it was given,
//! which makes it the unit that deterministic in-process networks drive. The
//! async runtime splits the same stages over separate workers.

use std::{collections::VecDeque, sync::Arc};

use alloy_signer_local::PrivateKeySigner;
use parking_lot::RwLock;
use sonic_consensus::DecidedBatch;
use sonic_dag::EventIdx;
use sonic_primitives::{Decode as _, Encode as _, Epoch, Event, ValidatorId};
use sonic_scc::{BlsSecretKey, Signer};
use tracing::{debug, instrument};

use crate::{
    certification::Certifier,
    clock::Clock,
    emitter::Emitter,
    error::Fatal,
    former::{BlockFormer, CommittedBlock, FormerOutput},
    ingress::{SubmitError, TxIngress},
    launch::Storage,
    network::{Gossip, Network, PeerId},
    stages::{ConsensusStage, DagStage},
    sync::EventSync,
    txpool::TxPool,
};

/// Keys of a validator node.
pub struct ValidatorKeys {
    pub id: ValidatorId,
    pub event_key: PrivateKeySigner,
    pub bls_key: BlsSecretKey,
}

impl std::fmt::Debug for ValidatorKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatorKeys")
            .field("id", &self.id)
            .field("address", &self.event_key.address())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, Default)]
pub struct CoreOptions {
    pub pool_capacity: Option<usize>,
    pub allow_unprotected: bool,
    /// Validators create events only when set.
    pub emit: bool,
}

pub struct NodeCore {
    storage: Storage,
    ingress: TxIngress,
    dag: DagStage,
    consensus: ConsensusStage,
    sync: EventSync,
    former: BlockFormer,
    certifier: Certifier,
    emitter: Option<Emitter>,
    network: Arc<dyn Network>,
    /// Every block committed since the last [`Self::take_committed`].
    committed: Vec<Arc<CommittedBlock>>,
}

impl std::fmt::Debug for NodeCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCore")
            .field("head", &self.storage.store.head().number)
            .field("dag", &self.dag)
            .field("emitter", &self.emitter)
            .finish_non_exhaustive()
    }
}

impl NodeCore {
    /// Starts the stages over opened storage, catches up on the batches the
    /// persisted DAG decides and announces its heads to the peers.
    #[instrument(skip_all, err)]
    pub fn open(
        storage: Storage,
        keys: Option<ValidatorKeys>,
        clock: Arc<dyn Clock>,
        network: Arc<dyn Network>,
        options: CoreOptions,
    ) -> Result<Self, Fatal> {
        let pool = Arc::new(RwLock::new(
            options
                .pool_capacity
                .map_or_else(TxPool::default, TxPool::new),
        ));
        let ingress = TxIngress::new(
            pool.clone(),
            storage.state().clone(),
            storage.store.clone(),
            network.clone(),
            options.allow_unprotected,
        );
        let former = BlockFormer::new(storage.store.clone(), storage.executor.clone(), pool.clone())?;
        let (dag, restored) = DagStage::open(storage.store.clone())?;
        let state = storage.store.epoch_state();
        let consensus = ConsensusStage::new(dag.dag(), &state);
        let sync = EventSync::new(storage.store.clone(), dag.dag());
        let (emitter, signer) = match keys {
            Some(keys) => (
                options.emit.then(|| {
                    Emitter::new(
                        keys.id,
                        keys.event_key,
                        clock,
                        pool.clone(),
                        storage.store.clone(),
                    )
                }),
                Some(Signer::new(keys.id, keys.bls_key)),
            ),
            None => (None, None),
        };
        let certifier = Certifier::new(storage.store.clone(), signer);

        let mut core = Self {
            storage,
            ingress,
            dag,
            consensus,
            sync,
            former,
            certifier,
            emitter,
            network,
            committed: Vec::new(),
        };
        for message in core.certifier.start()? {
            core.network.broadcast(message);
        }
        let replayed = core.consensus.process(state.epoch, &restored);
        core.run_batches(replayed)?;
        let heads = core.sync.announce();
        core.network.broadcast(heads);
        Ok(core)
    }

    pub const fn storage(&self) -> &Storage {
        &self.storage
    }

    pub const fn ingress(&self) -> &TxIngress {
        &self.ingress
    }

    pub const fn dag(&self) -> &DagStage {
        &self.dag
    }

    /// Blocks committed since the previous call.
    pub fn take_committed(&mut self) -> Vec<Arc<CommittedBlock>> {
        std::mem::take(&mut self.committed)
    }

    /// Submits a local transaction and relays it.
    pub fn submit_raw(&self, raw: &[u8]) -> Result<alloy_primitives::B256, SubmitError> {
        self.ingress.submit_raw(raw, true)
    }

    /// Handles a message from peer `from`.
    pub fn handle_gossip(&mut self, from: PeerId, message: Gossip) -> Result<(), Fatal> {
        match message {
            Gossip::Event(raw) => self.process_raw(from, &raw)?,
            Gossip::Events(events) => {
                for raw in events {
                    self.process_raw(from, &raw)?;
                }
            }
            Gossip::Heads { epoch, heads } => {
                for reply in self.sync.on_heads(epoch, &heads)? {
                    self.network.send(from, reply);
                }
            }
            Gossip::EventRequest { epoch, ids } => {
                if let Some(answer) = self.sync.answer(epoch, &ids)? {
                    self.network.send(from, answer);
                }
            }
            Gossip::Transaction(raw) => {
                let _ = self.ingress.submit_raw(&raw, false);
            }
            signature @ (Gossip::BlockSignature { .. } | Gossip::CommitteeSignature { .. }) => {
                self.certifier.on_gossip(signature)?;
            }
        }
        Ok(())
    }

    /// Emits an event if one is due and broadcasts it once admitted. Returns
    /// whether an event was emitted.
    pub fn tick(&mut self) -> Result<bool, Fatal> {
        let Some(emitter) = self.emitter.as_mut() else {
            return Ok(false);
        };
        let dag = self.dag.dag();
        let Some(event) = emitter.emit(&dag.read()) else {
            return Ok(false);
        };
        let raw = event.encode();
        let processed = self.dag.process_own(event)?;
        if processed.admitted.is_empty() {
            debug!(rejected = ?processed.rejected, "own event was not admitted");
            return Ok(false);
        }
        self.network.broadcast(Gossip::Event(raw));
        self.run_consensus(processed.epoch, &processed.indices())?;
        Ok(true)
    }

    /// Asks the peers again for every parent that is still missing.
    pub fn resync(&mut self) {
        let epoch = self.dag.epoch();
        let ids = self.dag.resync();
        if !ids.is_empty() {
            self.network.broadcast(Gossip::EventRequest { epoch, ids });
        }
    }

    fn process_raw(&mut self, from: PeerId, raw: &[u8]) -> Result<(), Fatal> {
        let event = match Event::decode(raw) {
            Ok(event) => event,
            Err(error) => {
                debug!(peer = from, %error, "undecodable event from peer");
                return Ok(());
            }
        };
        let processed = self.dag.process(event)?;
        if !processed.missing.is_empty() {
            self.network.send(
                from,
                Gossip::EventRequest {
                    epoch: processed.epoch,
                    ids: processed.missing.clone(),
                },
            );
        }
        self.run_consensus(processed.epoch, &processed.indices())
    }

    fn run_consensus(&mut self, epoch: Epoch, admitted: &[EventIdx]) -> Result<(), Fatal> {
        if admitted.is_empty() {
            return Ok(());
        }
        let batches = self.consensus.process(epoch, admitted);
        self.run_batches(batches)
    }

    /// Forms blocks from `batches`, certifies them and follows epoch switches.
    fn run_batches(&mut self, batches: Vec<DecidedBatch>) -> Result<(), Fatal> {
        let mut queue = VecDeque::from(batches);
        while let Some(batch) = queue.pop_front() {
            let FormerOutput { blocks, switch } = self.former.handle_batch(&batch)?;
            for block in blocks {
                if let Some(message) = self.certifier.on_block(&block)? {
                    self.network.broadcast(message);
                }
                self.committed.push(block);
            }
            if let Some(switch) = switch {
                // Batches of the sealed epoch are stale now.
                queue.clear();
                for message in self.certifier.on_switch(&switch)? {
                    self.network.broadcast(message);
                }
                let processed = self.dag.switch_epoch(&switch.next)?;
                self.consensus.switch_epoch(&switch.next);
                queue.extend(self.consensus.process(processed.epoch, &processed.indices()));
                if !processed.missing.is_empty() {
                    self.network.broadcast(Gossip::EventRequest {
                        epoch: processed.epoch,
                        ids: processed.missing.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}
