//! Chain storage: blocks, receipts, epochs and certificates.
//!
//! Everything lives in the `chaindata` database behind one [`Flushable`]. A
//! block and all of its side records are written under a single write lock
//! and become durable with one flush, so a restart observes either the whole
//! block or none of it.

use std::sync::Arc;

use alloy_primitives::B256;
use alloy_rlp::{Decodable as _, Encodable as _};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sonic_chainspec::Genesis;
use sonic_dag::DagStore;
use sonic_kvdb::{Flushable, Producer as _, StoreError, Table};
use sonic_primitives::{Block, BlockNumber, Epoch, Frame, Receipt, Timestamp};
use sonic_scc::{BlockCertificate, CommitteeCertificate};
use tracing::{debug, info};

use crate::epoch::{EpochState, PendingChanges};

const MAIN_TABLE: &str = "main";
const EPOCHS_TABLE: &str = "epochs";

const BLOCK_PREFIX: u8 = b'b';
const HASH_PREFIX: u8 = b'n';
const RECEIPTS_PREFIX: u8 = b'r';
const TX_PREFIX: u8 = b't';
const BLOCK_CERT_PREFIX: u8 = b'c';
const COMMITTEE_CERT_PREFIX: u8 = b'k';
const HEAD_KEY: &[u8] = b"head";
const PENDING_KEY: &[u8] = b"pending";
const GENESIS_KEY: &[u8] = b"genesis";

/// Progress of the chain, persisted with every block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainHead {
    pub number: BlockNumber,
    pub hash: B256,
    pub state_root: B256,
    pub timestamp: Timestamp,
    pub prev_randao: B256,
    pub epoch: Epoch,
    /// Last decided frame the block former has processed.
    pub frame: Frame,
    /// Frame whose batch produced the head block; zero at epoch start.
    pub block_frame: Frame,
    /// Gas used by the blocks of the current epoch.
    pub epoch_gas: u64,
}

impl ChainHead {
    pub fn of(block: &Block, frame: Frame, epoch_gas: u64) -> Self {
        Self {
            number: block.number(),
            hash: block.hash(),
            state_root: block.state_root(),
            timestamp: block.timestamp(),
            prev_randao: block.prev_randao(),
            epoch: block.epoch(),
            frame,
            block_frame: frame,
            epoch_gas,
        }
    }
}

/// Position of a transaction in the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxLocation {
    pub block: BlockNumber,
    pub index: u32,
}

/// Everything written for one committed block.
#[derive(Debug)]
pub struct BlockCommit<'a> {
    pub block: &'a Block,
    pub receipts: &'a [Receipt],
    pub head: ChainHead,
    pub pending: &'a PendingChanges,
    /// Set when the block sealed its epoch.
    pub next_epoch: Option<Arc<EpochState>>,
}

pub struct ChainStore {
    db: Arc<Flushable>,
    main: Arc<dyn Table>,
    epochs: Arc<dyn Table>,
    dag: DagStore,
    genesis: Genesis,
    write: Mutex<()>,
    head: RwLock<ChainHead>,
    epoch: RwLock<Arc<EpochState>>,
}

impl std::fmt::Debug for ChainStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainStore")
            .field("head", &*self.head.read())
            .field("epoch", &self.epoch.read().epoch)
            .finish_non_exhaustive()
    }
}

impl ChainStore {
    /// Opens an initialized chain; `None` if no genesis was imported.
    pub fn open(db: Arc<Flushable>) -> Result<Option<Self>, StoreError> {
        let main = db.open_table(MAIN_TABLE)?;
        let epochs = db.open_table(EPOCHS_TABLE)?;
        let Some(genesis) = get_json::<Genesis>(&*main, MAIN_TABLE, GENESIS_KEY)? else {
            return Ok(None);
        };
        let head: ChainHead = get_json(&*main, MAIN_TABLE, HEAD_KEY)?
            .ok_or_else(|| StoreError::corrupted(MAIN_TABLE, "genesis without a head"))?;
        let epoch: EpochState = get_json(&*epochs, EPOCHS_TABLE, &head.epoch.to_be_bytes())?
            .ok_or_else(|| {
                StoreError::corrupted(EPOCHS_TABLE, format!("missing epoch {}", head.epoch))
            })?;
        debug!(number = head.number, epoch = head.epoch, "opened chain store");
        Ok(Some(Self {
            dag: DagStore::new(db.clone()),
            db,
            main,
            epochs,
            genesis,
            write: Mutex::new(()),
            head: RwLock::new(head),
            epoch: RwLock::new(Arc::new(epoch)),
        }))
    }

    /// Writes genesis, block 0 and epoch 1, and flushes them.
    pub fn init_genesis(db: Arc<Flushable>, genesis: &Genesis, block: &Block) -> Result<Self, StoreError> {
        let main = db.open_table(MAIN_TABLE)?;
        let epochs = db.open_table(EPOCHS_TABLE)?;
        let epoch = EpochState::genesis(genesis);
        let head = ChainHead::of(block, 0, 0);

        put_json(&*main, GENESIS_KEY, genesis)?;
        put_json(&*epochs, &epoch.epoch.to_be_bytes(), &epoch)?;
        write_block(&*main, block, &[])?;
        put_json(&*main, HEAD_KEY, &head)?;
        db.flush()?;
        info!(hash = %block.hash(), "genesis imported");

        Ok(Self {
            dag: DagStore::new(db.clone()),
            db,
            main,
            epochs,
            genesis: genesis.clone(),
            write: Mutex::new(()),
            head: RwLock::new(head),
            epoch: RwLock::new(Arc::new(epoch)),
        })
    }

    pub fn db(&self) -> &Arc<Flushable> {
        &self.db
    }

    pub const fn dag(&self) -> &DagStore {
        &self.dag
    }

    pub const fn genesis(&self) -> &Genesis {
        &self.genesis
    }

    pub fn head(&self) -> ChainHead {
        self.head.read().clone()
    }

    pub fn epoch_state(&self) -> Arc<EpochState> {
        self.epoch.read().clone()
    }

    pub fn epoch_state_at(&self, epoch: Epoch) -> Result<Option<EpochState>, StoreError> {
        get_json(&*self.epochs, EPOCHS_TABLE, &epoch.to_be_bytes())
    }

    pub fn pending_changes(&self) -> Result<PendingChanges, StoreError> {
        Ok(get_json(&*self.main, MAIN_TABLE, PENDING_KEY)?.unwrap_or_default())
    }

    pub fn block(&self, number: BlockNumber) -> Result<Option<Block>, StoreError> {
        self.main
            .get(&numbered(BLOCK_PREFIX, number))?
            .map(|raw| {
                Block::decode(&mut raw.as_slice())
                    .map_err(|err| StoreError::corrupted(MAIN_TABLE, format!("block {number}: {err}")))
            })
            .transpose()
    }

    pub fn block_by_hash(&self, hash: &B256) -> Result<Option<Block>, StoreError> {
        match self.main.get(&hashed(HASH_PREFIX, hash))? {
            Some(raw) => self.block(decode_u64(&raw)?),
            None => Ok(None),
        }
    }

    pub fn receipts(&self, number: BlockNumber) -> Result<Option<Vec<Receipt>>, StoreError> {
        self.main
            .get(&numbered(RECEIPTS_PREFIX, number))?
            .map(|raw| {
                Vec::<Receipt>::decode(&mut raw.as_slice()).map_err(|err| {
                    StoreError::corrupted(MAIN_TABLE, format!("receipts {number}: {err}"))
                })
            })
            .transpose()
    }

    pub fn tx_location(&self, hash: &B256) -> Result<Option<TxLocation>, StoreError> {
        let Some(raw) = self.main.get(&hashed(TX_PREFIX, hash))? else {
            return Ok(None);
        };
        if raw.len() != 12 {
            return Err(StoreError::corrupted(MAIN_TABLE, "malformed transaction location"));
        }
        let (block, index) = raw.split_at(8);
        Ok(Some(TxLocation {
            block: decode_u64(block)?,
            index: u32::from_be_bytes(index.try_into().map_err(|_| {
                StoreError::corrupted(MAIN_TABLE, "malformed transaction index")
            })?),
        }))
    }

    pub fn block_certificate(&self, number: BlockNumber) -> Result<Option<BlockCertificate>, StoreError> {
        get_json(&*self.main, MAIN_TABLE, &numbered(BLOCK_CERT_PREFIX, number))
    }

    pub fn committee_certificate(&self, epoch: Epoch) -> Result<Option<CommitteeCertificate>, StoreError> {
        get_json(
            &*self.main,
            MAIN_TABLE,
            &numbered(COMMITTEE_CERT_PREFIX, u64::from(epoch)),
        )
    }

    pub fn put_block_certificate(&self, certificate: &BlockCertificate) -> Result<(), StoreError> {
        let _guard = self.write.lock();
        put_json(
            &*self.main,
            &numbered(BLOCK_CERT_PREFIX, certificate.statement.number),
            certificate,
        )?;
        self.db.flush()?;
        Ok(())
    }

    pub fn put_committee_certificate(&self, certificate: &CommitteeCertificate) -> Result<(), StoreError> {
        let _guard = self.write.lock();
        put_json(
            &*self.main,
            &numbered(COMMITTEE_CERT_PREFIX, u64::from(certificate.statement.epoch)),
            certificate,
        )?;
        self.db.flush()?;
        Ok(())
    }

    /// Persists a block with its receipts and the new head, then flushes.
    pub fn commit(&self, commit: BlockCommit<'_>) -> Result<(), StoreError> {
        let _guard = self.write.lock();
        write_block(&*self.main, commit.block, commit.receipts)?;
        put_json(&*self.main, PENDING_KEY, commit.pending)?;
        if let Some(next) = &commit.next_epoch {
            put_json(&*self.epochs, &next.epoch.to_be_bytes(), &**next)?;
        }
        put_json(&*self.main, HEAD_KEY, &commit.head)?;
        self.db.flush()?;

        *self.head.write() = commit.head;
        if let Some(next) = commit.next_epoch {
            *self.epoch.write() = next;
        }
        Ok(())
    }

    /// Makes the admitted events durable before the next block commit does.
    /// Block records are written under the same lock, so a flush never
    /// persists half a block.
    pub fn flush_events(&self) -> Result<(), StoreError> {
        let _guard = self.write.lock();
        self.db.flush()?;
        Ok(())
    }

    /// Records that `frame` was processed without producing a block.
    pub fn record_frame(&self, frame: Frame) -> Result<(), StoreError> {
        let _guard = self.write.lock();
        let mut head = self.head.read().clone();
        head.frame = frame;
        put_json(&*self.main, HEAD_KEY, &head)?;
        self.db.flush()?;
        *self.head.write() = head;
        Ok(())
    }
}

fn write_block(main: &dyn Table, block: &Block, receipts: &[Receipt]) -> Result<(), StoreError> {
    let number = block.number();
    let mut raw = Vec::with_capacity(block.length());
    block.encode(&mut raw);
    main.put(&numbered(BLOCK_PREFIX, number), &raw)?;
    main.put(&hashed(HASH_PREFIX, &block.hash()), &number.to_be_bytes())?;
    let mut encoded_receipts = Vec::new();
    alloy_rlp::encode_list(receipts, &mut encoded_receipts);
    main.put(&numbered(RECEIPTS_PREFIX, number), &encoded_receipts)?;
    for (index, tx) in block.transactions().iter().enumerate() {
        let mut location = Vec::with_capacity(12);
        location.extend_from_slice(&number.to_be_bytes());
        location.extend_from_slice(&(index as u32).to_be_bytes());
        main.put(&hashed(TX_PREFIX, tx.tx_hash()), &location)?;
    }
    Ok(())
}

fn numbered(prefix: u8, number: u64) -> [u8; 9] {
    let mut key = [prefix; 9];
    key[1..].copy_from_slice(&number.to_be_bytes());
    key
}

fn hashed(prefix: u8, hash: &B256) -> [u8; 33] {
    let mut key = [prefix; 33];
    key[1..].copy_from_slice(hash.as_slice());
    key
}

fn decode_u64(raw: &[u8]) -> Result<u64, StoreError> {
    raw.try_into()
        .map(u64::from_be_bytes)
        .map_err(|_| StoreError::corrupted(MAIN_TABLE, "malformed block number"))
}

fn get_json<T: DeserializeOwned>(table: &dyn Table, name: &str, key: &[u8]) -> Result<Option<T>, StoreError> {
    table
        .get(key)?
        .map(|raw| {
            serde_json::from_slice(&raw).map_err(|err| {
                StoreError::corrupted(name, format!("{}: {err}", String::from_utf8_lossy(key)))
            })
        })
        .transpose()
}

fn put_json<T: Serialize + ?Sized>(table: &dyn Table, key: &[u8], value: &T) -> Result<(), StoreError> {
    let raw = serde_json::to_vec(value).map_err(|err| StoreError::corrupted("json", err))?;
    table.put(key, &raw)
}

#[cfg(test)]
mod tests {
    use sonic_chainspec::{Upgrades, genesis::FakeGenesis};
    use sonic_kvdb::{IteratorPool, MemoryProducer, Producer};

    use super::*;
    use crate::launch::genesis_block;

    fn open(producer: &MemoryProducer) -> Arc<Flushable> {
        Arc::new(Flushable::open(Arc::new(producer.clone()), IteratorPool::default()).unwrap())
    }

    #[test]
    fn genesis_survives_reopen() {
        let producer = MemoryProducer::new();
        let genesis = FakeGenesis::new(3, Upgrades::sonic()).build().unwrap();
        let block = genesis_block(&genesis, B256::repeat_byte(7)).unwrap();

        assert!(ChainStore::open(open(&producer)).unwrap().is_none());
        let store = ChainStore::init_genesis(open(&producer), &genesis, &block).unwrap();
        assert_eq!(store.head().number, 0);

        let store = ChainStore::open(open(&producer)).unwrap().unwrap();
        assert_eq!(store.head().hash, block.hash());
        assert_eq!(store.block(0).unwrap().unwrap(), block);
        assert_eq!(store.block_by_hash(&block.hash()).unwrap().unwrap(), block);
        assert_eq!(store.receipts(0).unwrap().unwrap(), Vec::new());
        assert_eq!(store.epoch_state().epoch, 1);
        assert_eq!(store.genesis(), &genesis);
    }

    #[test]
    fn corrupted_records_are_reported() {
        let producer = MemoryProducer::new();
        let genesis = FakeGenesis::new(1, Upgrades::sonic()).build().unwrap();
        let block = genesis_block(&genesis, B256::ZERO).unwrap();
        ChainStore::init_genesis(open(&producer), &genesis, &block).unwrap();

        producer
            .open_table(MAIN_TABLE)
            .unwrap()
            .put(&numbered(BLOCK_PREFIX, 0), b"\x01\x02")
            .unwrap();
        let store = ChainStore::open(open(&producer)).unwrap().unwrap();
        assert!(matches!(store.block(0), Err(StoreError::Corrupted { .. })));

        producer
            .open_table(MAIN_TABLE)
            .unwrap()
            .put(HEAD_KEY, b"{")
            .unwrap();
        assert!(matches!(
            ChainStore::open(open(&producer)),
            Err(StoreError::Corrupted { .. })
        ));
    }
}
