//! The node as a set of long-lived tokio workers.
//!
//! ```text
//! inbox -> ingress -[events]-> dag -[admitted]-> consensus -[batches]-> former -[blocks]-> scc
//!           |  txs: pool        ^ emitter                                 |                ^
//!           |  heads, requests  |                                         |                |
//!           |  answered here    +------------- epoch switches ------------+                |
//!           +--- signatures ----------------------------------------------------------------+
//! ```
//!
//! Every hand-off between workers is a bounded channel, so a slow stage
//! pushes back on the ones feeding it. The DAG worker asks the sender of an
//! event for its unknown parents, and every [`RESYNC_INTERVAL`] asks all peers
//! for the ones still missing. Stopping cancels ingress and the emitter; the
//! remaining workers drain their queues and exit once their input closes. Workers still busy when the drain deadline passes are
//! aborted. Blocks are committed atomically, so an aborted former loses at
//! most the batch it was waiting for.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use parking_lot::RwLock;
use sonic_consensus::DecidedBatch;
use sonic_dag::EventIdx;
use sonic_kvdb::DataDir;
use sonic_node_config::Config;
use sonic_primitives::{Decode as _, Encode as _, Epoch, Event};
use sonic_scc::Signer;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument as _, debug, error, info, info_span, instrument, trace, warn};

use crate::{
    certification::Certifier,
    clock::Clock,
    emitter::Emitter,
    epoch::EpochState,
    error::Fatal,
    former::{BlockFormer, CommittedBlock, EpochSwitch, FormerOutput},
    ingress::TxIngress,
    launch::{Storage, write_errlock},
    network::{Gossip, Inbound, Network, PeerId},
    node_core::ValidatorKeys,
    rpc::{RpcContext, start_server},
    stages::{ConsensusStage, DagStage, Processed},
    store::ChainStore,
    sync::EventSync,
    txpool::TxPool,
};

/// How often the DAG worker asks the emitter for an event.
pub const EMIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How often parents nobody answered for are asked again.
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(1);

/// Everything a node is started from.
pub struct Launch {
    pub config: Config,
    pub storage: Storage,
    pub keys: Option<ValidatorKeys>,
    pub clock: Arc<dyn Clock>,
    pub network: Arc<dyn Network>,
    /// Gossip from peers, with its sender.
    pub inbox: mpsc::UnboundedReceiver<Inbound>,
    /// Receives the `errlock` if the node stops on a fatal error.
    pub datadir: Option<DataDir>,
}

impl std::fmt::Debug for Launch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launch")
            .field("config", &self.config)
            .field("keys", &self.keys)
            .field("datadir", &self.datadir)
            .finish_non_exhaustive()
    }
}

enum ConsensusInput {
    Admitted { epoch: Epoch, events: Vec<EventIdx> },
    Switch(Arc<EpochState>),
}

enum SccInput {
    Block(Arc<CommittedBlock>),
    Switch(EpochSwitch),
    Gossip(Gossip),
}

type Worker = (&'static str, Result<(), Fatal>);

/// A running node.
pub struct Node {
    store: Arc<ChainStore>,
    ingress: TxIngress,
    rpc_addr: Option<SocketAddr>,
    blocks: broadcast::Sender<Arc<CommittedBlock>>,
    stop: CancellationToken,
    workers: JoinSet<Worker>,
    datadir: Option<DataDir>,
    drain_deadline: Duration,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("head", &self.store.head().number)
            .field("rpc_addr", &self.rpc_addr)
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Spawns the workers and, if enabled, the RPC server.
    #[instrument(skip_all, err)]
    pub async fn launch(launch: Launch) -> eyre::Result<Self> {
        let Launch {
            config,
            storage,
            keys,
            clock,
            network,
            inbox,
            datadir,
        } = launch;
        let store = storage.store.clone();
        let pool = Arc::new(RwLock::new(TxPool::new(config.txpool.capacity)));
        let ingress = TxIngress::new(
            pool.clone(),
            storage.state().clone(),
            store.clone(),
            network.clone(),
            config.txpool.allow_unprotected,
        );
        let former = BlockFormer::new(store.clone(), storage.executor.clone(), pool.clone())?;
        let (stage, restored) = DagStage::open(store.clone())?;
        let consensus = ConsensusStage::new(stage.dag(), &store.epoch_state());
        let sync = EventSync::new(store.clone(), stage.dag());

        let (emitter, signer) = match keys {
            Some(keys) => (
                config.emitter.enabled.then(|| {
                    Emitter::new(keys.id, keys.event_key, clock, pool.clone(), store.clone())
                }),
                Some(Signer::new(keys.id, keys.bls_key)),
            ),
            None => (None, None),
        };
        let mut certifier = Certifier::new(store.clone(), signer);
        for message in certifier.start()? {
            network.broadcast(message);
        }

        let channels = &config.channels;
        let (events_tx, events_rx) = mpsc::channel(channels.events);
        let (admitted_tx, admitted_rx) = mpsc::channel(channels.admitted);
        let (batches_tx, batches_rx) = mpsc::channel(channels.batches);
        let (scc_tx, scc_rx) = mpsc::channel(channels.blocks);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (blocks, _) = broadcast::channel(channels.blocks);
        let stop = CancellationToken::new();
        let mut workers = JoinSet::new();

        let mut rpc_addr = None;
        if config.rpc.enabled {
            let context = RpcContext {
                store: store.clone(),
                state: storage.state().clone(),
                dag: stage.dag(),
                ingress: ingress.clone(),
            };
            let (local, handle) = start_server(config.rpc.listen, context).await?;
            rpc_addr = Some(local);
            let stop = stop.clone();
            workers.spawn(async move {
                stop.cancelled().await;
                let _ = handle.stop();
                handle.stopped().await;
                ("rpc", Ok(()))
            });
        }

        workers.spawn(
            IngressWorker {
                inbox,
                events: events_tx,
                scc: scc_tx.clone(),
                ingress: ingress.clone(),
                sync: sync.clone(),
                network: network.clone(),
                stop: stop.clone(),
            }
            .run()
            .instrument(info_span!("ingress")),
        );
        workers.spawn(
            DagWorker {
                stage,
                emitter,
                events: events_rx,
                control: control_rx,
                consensus: admitted_tx,
                network: network.clone(),
                stop: stop.clone(),
            }
            .run(restored)
            .instrument(info_span!("dag")),
        );
        workers.spawn(
            ConsensusWorker {
                stage: consensus,
                input: admitted_rx,
                batches: batches_tx,
            }
            .run()
            .instrument(info_span!("consensus")),
        );
        workers.spawn(
            FormerWorker {
                former,
                batches: batches_rx,
                scc: scc_tx,
                control: control_tx,
                blocks: blocks.clone(),
            }
            .run()
            .instrument(info_span!("former")),
        );
        workers.spawn(
            SccWorker {
                certifier,
                input: scc_rx,
                network: network.clone(),
            }
            .run()
            .instrument(info_span!("scc")),
        );
        network.broadcast(sync.announce());

        info!(head = store.head().number, epoch = store.head().epoch, ?rpc_addr, "node started");
        Ok(Self {
            store,
            ingress,
            rpc_addr,
            blocks,
            stop,
            workers,
            datadir,
            drain_deadline: config.shutdown.drain_deadline(),
        })
    }

    pub const fn local_rpc_addr(&self) -> Option<SocketAddr> {
        self.rpc_addr
    }

    pub const fn store(&self) -> &Arc<ChainStore> {
        &self.store
    }

    pub const fn ingress(&self) -> &TxIngress {
        &self.ingress
    }

    /// Blocks committed from now on.
    pub fn subscribe_blocks(&self) -> broadcast::Receiver<Arc<CommittedBlock>> {
        self.blocks.subscribe()
    }

    /// Token that starts a graceful shutdown when cancelled.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Runs until every worker finished.
    ///
    /// The first fatal error stops all workers and is recorded in the data
    /// directory's `errlock`. Once a stop was requested, workers get the drain
    /// deadline to finish before they are aborted.
    pub async fn wait(&mut self) -> Result<(), Fatal> {
        let stop = self.stop.clone();
        let deadline = self.drain_deadline;
        let drain = async move {
            stop.cancelled().await;
            tokio::time::sleep(deadline).await;
        };
        tokio::pin!(drain);
        let mut aborted = false;

        loop {
            tokio::select! {
                biased;

                joined = self.workers.join_next() => {
                    let (worker, result) = match joined {
                        None => break,
                        Some(Ok(finished)) => finished,
                        Some(Err(error)) if error.is_cancelled() => continue,
                        Some(Err(error)) => ("unknown", Err(Fatal::structural(format!("worker panicked: {error}")))),
                    };
                    match result {
                        Ok(()) => debug!(worker, "worker finished"),
                        Err(fatal) => {
                            error!(worker, error = %fatal.report(), "fatal error, stopping node");
                            self.stop.cancel();
                            self.workers.abort_all();
                            if let Some(datadir) = &self.datadir {
                                write_errlock(datadir, &fatal);
                            }
                            return Err(fatal);
                        }
                    }
                }

                () = &mut drain, if !aborted => {
                    aborted = true;
                    warn!(workers = self.workers.len(), "drain deadline passed, aborting workers");
                    self.workers.abort_all();
                }
            }
        }
        info!(head = self.store.head().number, "node stopped");
        Ok(())
    }

    /// Stops the node without recording an error, e.g. on low disk space.
    pub async fn shutdown(mut self) -> Result<(), Fatal> {
        self.stop();
        self.wait().await
    }
}

struct IngressWorker {
    inbox: mpsc::UnboundedReceiver<Inbound>,
    events: mpsc::Sender<(PeerId, Event)>,
    scc: mpsc::Sender<SccInput>,
    ingress: TxIngress,
    sync: EventSync,
    network: Arc<dyn Network>,
    stop: CancellationToken,
}

impl IngressWorker {
    async fn run(mut self) -> Worker {
        ("ingress", self.run_inner().await)
    }

    async fn run_inner(&mut self) -> Result<(), Fatal> {
        loop {
            tokio::select! {
                biased;

                () = self.stop.cancelled() => break,

                message = self.inbox.recv() => {
                    let Some((from, message)) = message else {
                        debug!("gossip inbox closed");
                        break;
                    };
                    if !self.route(from, message).await? {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Hands `message` to the worker that handles it, or answers it. Returns
    /// false once that worker is gone.
    async fn route(&self, from: PeerId, message: Gossip) -> Result<bool, Fatal> {
        let delivered = match message {
            Gossip::Event(raw) => self.forward_event(from, &raw).await,
            Gossip::Events(events) => {
                for raw in events {
                    if !self.forward_event(from, &raw).await {
                        return Ok(false);
                    }
                }
                true
            }
            Gossip::Heads { epoch, heads } => {
                for reply in self.sync.on_heads(epoch, &heads)? {
                    self.network.send(from, reply);
                }
                true
            }
            Gossip::EventRequest { epoch, ids } => {
                if let Some(answer) = self.sync.answer(epoch, &ids)? {
                    self.network.send(from, answer);
                }
                true
            }
            Gossip::Transaction(raw) => {
                if let Err(error) = self.ingress.submit_raw(&raw, false) {
                    trace!(%error, "gossiped transaction refused");
                }
                true
            }
            signature => self.scc.send(SccInput::Gossip(signature)).await.is_ok(),
        };
        Ok(delivered)
    }

    async fn forward_event(&self, from: PeerId, raw: &[u8]) -> bool {
        match Event::decode(raw) {
            Ok(event) => self.events.send((from, event)).await.is_ok(),
            Err(error) => {
                debug!(peer = from, %error, "undecodable event from peer");
                true
            }
        }
    }
}

struct DagWorker {
    stage: DagStage,
    emitter: Option<Emitter>,
    events: mpsc::Receiver<(PeerId, Event)>,
    control: mpsc::UnboundedReceiver<Arc<EpochState>>,
    consensus: mpsc::Sender<ConsensusInput>,
    network: Arc<dyn Network>,
    stop: CancellationToken,
}

impl DagWorker {
    async fn run(mut self, restored: Vec<EventIdx>) -> Worker {
        ("dag", self.run_inner(restored).await)
    }

    async fn run_inner(&mut self, restored: Vec<EventIdx>) -> Result<(), Fatal> {
        let epoch = self.stage.epoch();
        self.forward(epoch, restored).await;
        let mut poll = tokio::time::interval(EMIT_POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut resync = tokio::time::interval(RESYNC_INTERVAL);
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                Some(next) = self.control.recv() => {
                    let processed = self.stage.switch_epoch(&next)?;
                    if self.consensus.send(ConsensusInput::Switch(next)).await.is_err() {
                        debug!("consensus is gone, epoch switch dropped");
                    }
                    self.request(None, &processed);
                    self.forward(processed.epoch, processed.indices()).await;
                }

                event = self.events.recv() => {
                    let Some((from, event)) = event else {
                        break;
                    };
                    let processed = self.stage.process(event)?;
                    self.request(Some(from), &processed);
                    self.forward(processed.epoch, processed.indices()).await;
                }

                _ = poll.tick(), if self.emitter.is_some() && !self.stop.is_cancelled() => {
                    self.emit().await?;
                }

                _ = resync.tick(), if !self.stop.is_cancelled() => {
                    let epoch = self.stage.epoch();
                    let ids = self.stage.resync();
                    if !ids.is_empty() {
                        debug!(epoch, missing = ids.len(), "asking peers again for missing parents");
                        self.network.broadcast(Gossip::EventRequest { epoch, ids });
                    }
                }
            }
        }
        Ok(())
    }

    async fn emit(&mut self) -> Result<(), Fatal> {
        let Some(emitter) = self.emitter.as_mut() else {
            return Ok(());
        };
        let dag = self.stage.dag();
        let Some(event) = emitter.emit(&dag.read()) else {
            return Ok(());
        };
        let raw = event.encode();
        let processed = self.stage.process_own(event)?;
        if processed.admitted.is_empty() {
            debug!(rejected = ?processed.rejected, "own event was not admitted");
            return Ok(());
        }
        self.network.broadcast(Gossip::Event(raw));
        self.forward(processed.epoch, processed.indices()).await;
        Ok(())
    }

    /// Asks `from`, or every peer, for the parents `processed` found missing.
    fn request(&self, from: Option<PeerId>, processed: &Processed) {
        if processed.missing.is_empty() {
            return;
        }
        let request = Gossip::EventRequest {
            epoch: processed.epoch,
            ids: processed.missing.clone(),
        };
        match from {
            Some(peer) => self.network.send(peer, request),
            None => self.network.broadcast(request),
        }
    }

    async fn forward(&self, epoch: Epoch, events: Vec<EventIdx>) {
        if events.is_empty() {
            return;
        }
        if self
            .consensus
            .send(ConsensusInput::Admitted { epoch, events })
            .await
            .is_err()
        {
            debug!("consensus is gone, admitted events dropped");
        }
    }
}

struct ConsensusWorker {
    stage: ConsensusStage,
    input: mpsc::Receiver<ConsensusInput>,
    batches: mpsc::Sender<DecidedBatch>,
}

impl ConsensusWorker {
    async fn run(mut self) -> Worker {
        while let Some(input) = self.input.recv().await {
            match input {
                ConsensusInput::Admitted { epoch, events } => {
                    for batch in self.stage.process(epoch, &events) {
                        if self.batches.send(batch).await.is_err() {
                            debug!("block former is gone, batch dropped");
                            return ("consensus", Ok(()));
                        }
                    }
                }
                ConsensusInput::Switch(next) => self.stage.switch_epoch(&next),
            }
        }
        ("consensus", Ok(()))
    }
}

struct FormerWorker {
    former: BlockFormer,
    batches: mpsc::Receiver<DecidedBatch>,
    scc: mpsc::Sender<SccInput>,
    control: mpsc::UnboundedSender<Arc<EpochState>>,
    blocks: broadcast::Sender<Arc<CommittedBlock>>,
}

impl FormerWorker {
    async fn run(mut self) -> Worker {
        ("former", self.run_inner().await)
    }

    async fn run_inner(&mut self) -> Result<(), Fatal> {
        while let Some(batch) = self.batches.recv().await {
            let FormerOutput { blocks, switch } = self.former.handle_batch(&batch)?;
            for block in blocks {
                let _ = self.blocks.send(block.clone());
                let _ = self.scc.send(SccInput::Block(block)).await;
            }
            if let Some(switch) = switch {
                let _ = self.control.send(switch.next.clone());
                let _ = self.scc.send(SccInput::Switch(switch)).await;
            }
        }
        Ok(())
    }
}

struct SccWorker {
    certifier: Certifier,
    input: mpsc::Receiver<SccInput>,
    network: Arc<dyn Network>,
}

impl SccWorker {
    async fn run(mut self) -> Worker {
        ("scc", self.run_inner().await)
    }

    async fn run_inner(&mut self) -> Result<(), Fatal> {
        while let Some(input) = self.input.recv().await {
            match input {
                SccInput::Block(block) => {
                    if let Some(message) = self.certifier.on_block(&block)? {
                        self.network.broadcast(message);
                    }
                }
                SccInput::Switch(switch) => {
                    for message in self.certifier.on_switch(&switch)? {
                        self.network.broadcast(message);
                    }
                }
                SccInput::Gossip(message) => self.certifier.on_gossip(message)?,
            }
        }
        Ok(())
    }
}
