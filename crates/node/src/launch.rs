//! Opening the node's storage.
//!
//! Startup runs in this order: refuse a locked data directory, open the flush
//! journal (a dirty flush is a storage error), open the state database, then
//! either import the genesis or check that the chain head and the state
//! database agree. A state database one block ahead of the chain is rolled
//! back; that block was executed but its commit never reached the disk.

use std::{path::Path, sync::Arc};

use alloy_primitives::{B256, Bloom};
use parking_lot::RwLock;
use sonic_chainspec::{Genesis, GenesisError};
use sonic_evm::{StateDb, TransferExecutor};
use sonic_kvdb::{DataDir, Flushable, IteratorPool, MemoryProducer, Producer, SledProducer};
use sonic_primitives::{Block, BlockFields, receipts_root};
use tracing::{info, instrument, warn};

use crate::{error::Fatal, store::ChainStore};

/// The three databases of a node.
#[derive(Clone)]
pub struct Producers {
    pub chaindata: Arc<dyn Producer>,
    pub live: Arc<dyn Producer>,
    pub archive: Arc<dyn Producer>,
}

impl Producers {
    /// In-memory databases. Clones share their contents, so a node can be
    /// restarted on top of them.
    pub fn memory() -> Self {
        Self {
            chaindata: Arc::new(MemoryProducer::new()),
            live: Arc::new(MemoryProducer::new()),
            archive: Arc::new(MemoryProducer::new()),
        }
    }

    /// Sled databases under the data directory.
    pub fn sled(datadir: &DataDir) -> Result<Self, Fatal> {
        Ok(Self {
            chaindata: Arc::new(SledProducer::open(&datadir.chaindata())?),
            live: Arc::new(SledProducer::open(&datadir.carmen_live())?),
            archive: Arc::new(SledProducer::open(&datadir.carmen_archive())?),
        })
    }
}

impl std::fmt::Debug for Producers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producers").finish_non_exhaustive()
    }
}

/// Opened and mutually consistent chain and state.
#[derive(Clone, Debug)]
pub struct Storage {
    pub store: Arc<ChainStore>,
    pub executor: Arc<TransferExecutor>,
}

impl Storage {
    pub fn state(&self) -> &Arc<RwLock<StateDb>> {
        self.executor.state()
    }
}

/// Block 0 of `genesis` over the genesis state root.
pub fn genesis_block(genesis: &Genesis, state_root: B256) -> Result<Block, GenesisError> {
    Ok(Block::assemble(
        BlockFields {
            number: 0,
            parent_hash: B256::ZERO,
            timestamp: genesis.time,
            prev_randao: genesis.hash()?,
            gas_limit: genesis.rules.blocks.max_block_gas,
            gas_used: 0,
            base_fee: genesis.rules.economy.min_base_fee,
            state_root,
            receipts_root: receipts_root(&[]),
            logs_bloom: Bloom::ZERO,
            proposer: 0,
            epoch: 1,
        },
        Vec::new(),
    ))
}

/// Opens chain and state over `producers`, importing `genesis` if the chain is
/// empty.
#[instrument(skip_all, err)]
pub fn open_storage(producers: Producers, genesis: Option<&Genesis>) -> Result<Storage, Fatal> {
    let db = Arc::new(Flushable::open(producers.chaindata, IteratorPool::default())?);
    let mut state = StateDb::open(producers.live, producers.archive)?;

    let store = match ChainStore::open(db.clone())? {
        Some(store) => {
            check_consistency(&store, &mut state)?;
            store
        }
        None => {
            let genesis = genesis
                .ok_or_else(|| Fatal::structural("the chain is empty and no genesis was given"))?;
            let root = state.init_genesis(genesis)?;
            let block = genesis_block(genesis, root).map_err(Fatal::structural)?;
            ChainStore::init_genesis(db, genesis, &block)?
        }
    };

    let driver_owner = store.genesis().driver_owner;
    Ok(Storage {
        store: Arc::new(store),
        executor: Arc::new(TransferExecutor::new(
            Arc::new(RwLock::new(state)),
            driver_owner,
        )),
    })
}

fn check_consistency(store: &ChainStore, state: &mut StateDb) -> Result<(), Fatal> {
    let head = store.head();
    match state.block() {
        Some(number) if number == head.number => {}
        Some(number) if number == head.number + 1 => {
            warn!(number, "state is ahead of the chain, rolling back one block");
            state.rollback(head.number)?;
        }
        other => {
            return Err(Fatal::structural(format!(
                "state database is at block {other:?}, the chain head is block {}",
                head.number
            )));
        }
    }
    if state.root() != head.state_root {
        return Err(Fatal::structural(format!(
            "state root {} does not match the root {} of head block {}",
            state.root(),
            head.state_root,
            head.number
        )));
    }
    info!(number = head.number, epoch = head.epoch, "chain and state agree");
    Ok(())
}

/// Opens the storage of a data directory.
///
/// A present `errlock` refuses the start. The `unfinished` marker brackets the
/// genesis import of a fresh directory; finding it means an import was
/// interrupted and the directory has to be wiped.
pub fn open_datadir(datadir: &DataDir, genesis: Option<&Genesis>) -> Result<Storage, Fatal> {
    datadir.check_errlock()?;
    if datadir.is_unfinished() {
        return Err(Fatal::structural(format!(
            "genesis import into `{}` did not finish; remove the directory and start again",
            datadir.root().display()
        )));
    }
    let fresh = datadir.is_empty();
    datadir.create()?;
    if fresh {
        datadir.mark_unfinished()?;
    }
    let storage = open_storage(Producers::sled(datadir)?, genesis)?;
    if fresh {
        datadir.clear_unfinished()?;
    }
    Ok(storage)
}

/// Records `fatal` in the data directory's `errlock`, unless the directory is
/// what refused to start.
pub fn write_errlock(datadir: &DataDir, fatal: &Fatal) {
    if !fatal.writes_errlock() {
        return;
    }
    if let Err(error) = datadir.write_errlock(&fatal.report()) {
        warn!(%error, path = %datadir.errlock().display(), "failed writing errlock");
    }
}

/// Whether `path` holds a data directory that was initialized before.
pub fn is_initialized(path: &Path) -> bool {
    !DataDir::new(path).is_empty()
}

#[cfg(test)]
mod tests {
    use sonic_chainspec::{Upgrades, genesis::FakeGenesis};
    use sonic_kvdb::StoreError;

    use super::*;

    fn genesis() -> Genesis {
        FakeGenesis::new(3, Upgrades::sonic()).build().unwrap()
    }

    #[test]
    fn imports_genesis_once() {
        let producers = Producers::memory();
        let genesis = genesis();
        let storage = open_storage(producers.clone(), Some(&genesis)).unwrap();
        let head = storage.store.head();
        assert_eq!(head.number, 0);
        assert_eq!(head.prev_randao, genesis.hash().unwrap());
        assert_eq!(head.state_root, storage.state().read().root());

        let reopened = open_storage(producers, None).unwrap();
        assert_eq!(reopened.store.head(), head);
    }

    #[test]
    fn empty_chain_needs_a_genesis() {
        assert!(matches!(
            open_storage(Producers::memory(), None),
            Err(Fatal::Structural(_))
        ));
    }

    #[test]
    fn state_behind_the_chain_is_structural() {
        let producers = Producers::memory();
        open_storage(producers.clone(), Some(&genesis())).unwrap();

        let mut other = producers.clone();
        other.live = Arc::new(MemoryProducer::new());
        other.archive = Arc::new(MemoryProducer::new());
        assert!(matches!(open_storage(other, None), Err(Fatal::Structural(_))));
    }

    #[test]
    fn locked_and_unfinished_datadirs_refuse_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let datadir = DataDir::new(dir.path().join("node"));
        open_datadir(&datadir, Some(&genesis())).unwrap();
        assert!(is_initialized(datadir.root()));

        datadir.mark_unfinished().unwrap();
        let fatal = open_datadir(&datadir, None).unwrap_err();
        assert!(matches!(fatal, Fatal::Structural(_)));
        write_errlock(&datadir, &fatal);

        let fatal = open_datadir(&datadir, None).unwrap_err();
        assert!(matches!(fatal, Fatal::Locked(_)));
        assert!(!fatal.writes_errlock());
    }

    #[test]
    fn dirty_flush_is_a_storage_error() {
        let producers = Producers::memory();
        open_storage(producers.clone(), Some(&genesis())).unwrap();
        producers
            .chaindata
            .open_table("main")
            .unwrap()
            .put(b"!flush/dirty", &7u64.to_be_bytes())
            .unwrap();
        assert!(matches!(
            open_storage(producers, None),
            Err(Fatal::Storage(StoreError::DirtyFlush(7)))
        ));
    }
}
